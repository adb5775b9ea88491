//! Promobots service.
//!
//! Hosts a fleet of chat bots whose tokens are stored encrypted, keeps one
//! long-poll consumer per bot, and sends targeted broadcasts to the users
//! they have collected.

pub mod broadcast;
pub mod health;
pub mod platform;
pub mod shutdown;
pub mod storage;
pub mod supervisor;
