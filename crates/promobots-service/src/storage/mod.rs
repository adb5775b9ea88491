//! SQLite storage for the promobots service.
//!
//! Provides persistence for hosted bots, end users, and the scenario and
//! payment state that broadcast targeting reads.

mod bots;
mod db;
mod models;
mod repository;
mod snapshots;
mod users;


pub use db::{Database, DatabaseError};
pub use models::{BotRecord, BotStatus, UserRecord, UserRole};
pub use repository::{BotRepository, SnapshotSource, UserRepository};
pub use snapshots::PAYMENT_SUCCEEDED;
