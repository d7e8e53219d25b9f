//! A VM registry adapter for the pilot.
//!
//! Workloads running outside the orchestrator register with an HTTP registry
//! that serves their instances and configuration rules. [`VmRegistry`] polls
//! it and exposes the result both as a [`ConfigSource`] and as a service
//! registry.
//!
//! [`ConfigSource`]: mesh_pilot_core::ConfigSource

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod controller;

pub use self::{
    client::{Error, HttpRegistry, InstanceRecord, Registry, RuleRecord, Snapshot},
    controller::{PollConfig, VmRegistry},
};
