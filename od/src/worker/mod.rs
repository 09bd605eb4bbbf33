//! Worker capabilities
//!
//! Workers are opaque external capabilities: the core hands one a task and
//! a sandbox root and branches only on success/failure/timeout. One trait
//! covers all three kinds (coder, validator, reviewer); the lifecycle
//! engine picks which kind to invoke per transition.

mod capability;
mod command;

pub use capability::{Capability, CapabilityError, WorkerKind, WorkerOutcome, WorkerSet, WorkerTask};
pub use command::CommandCapability;
