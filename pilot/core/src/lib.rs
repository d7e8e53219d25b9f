//! Mesh Pilot Core
//!
//! Shared model and capabilities for the pilot control plane. Configuration
//! flows from one or more [`ConfigSource`]s into a [`ConfigStoreCache`];
//! service data flows from a [`ServiceRegistry`]. Every long-running loop
//! implements [`Controller`] so that it may be started, observed until its
//! first full sync, and stopped through a single shared [`StopSignal`].
//!
//! ```text
//! [ ConfigSource ]* -> [ ConfigStoreCache ] -> consumers
//! [ ServiceRegistry ] --------------------------^
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
mod error;
pub mod registry;
mod source;
pub mod store;
mod synced;

pub use self::{
    config::{ChangeEvent, ConfigKey, ConfigObject, EventStream},
    error::{Conflict, Error},
    registry::{ServiceAccounts, ServiceDiscovery, ServiceRegistry},
    source::{ConfigSource, ConfigStoreCache, Controller},
    synced::{Synced, SyncedTx},
};

/// The process-wide cancellation token.
///
/// It fires exactly once, when the owning `drain::Signal` is drained, and is
/// observed by every loop that holds a clone. A loop releases the signal when
/// it drops its clone (or the `drain::ReleaseShutdown` handle it was given),
/// so the owner can wait for all loops to exit.
pub type StopSignal = drain::Watch;

/// Kind of the route rules consumed by proxies.
pub const ROUTE_RULE: &str = "route-rule";

/// Kind of the destination policies consumed by proxies.
pub const DESTINATION_POLICY: &str = "destination-policy";
