//! Broadcasts: the file-backed definition registry, targeting evaluation
//! and the sender that ties them to a platform client.

mod registry;
mod sender;
mod targeting;

pub use registry::{BroadcastDefinition, BroadcastRegistry, RegistryError};
pub use sender::{BroadcastError, BroadcastReport, BroadcastSender};
pub use targeting::{Condition, ConditionResolver, TargetResolver, Targeting, UserSnapshot};
