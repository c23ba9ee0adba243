//! Core types for the warden daemon.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (Identity, EnvelopeId, etc.)
//! - **Errors**: Application error taxonomy with thiserror derives
//! - **Config**: The validated configuration snapshot

mod config;
mod errors;
mod ids;

pub use config::{
    BusConfig, Config, IdentityConfig, ObservabilityConfig, PolicyConfig, RuntimeConfig,
    SandboxConfig, SessionConfig, DEFAULT_BUS_CAPACITY,
};
pub use errors::{Error, Result, SandboxError};
pub use ids::{EnvelopeId, HookId, Identity, InvocationId};
