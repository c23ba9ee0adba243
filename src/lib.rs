//! # Warden Core - Agent-Routing Daemon Core
//!
//! Rust implementation of the warden daemon core providing:
//! - Typestate sessions (Unauthenticated → Authenticated → Authorized)
//! - Role-based policy engine with priority-ordered rules
//! - Skill registry with sandboxed execution
//! - Per-sender token-bucket rate limiting
//! - Plugin hooks dispatched in priority order
//! - Broadcast event bus for inbound and outbound envelopes
//!
//! ## Architecture
//!
//! The `Kernel` owns every subsystem; channels feed it messages and receive
//! its replies off the bus:
//! ```text
//!                     ┌─────────────────────────────────┐
//!   channel msgs  →   │             Kernel              │
//!                     │  ┌─────────┐ ┌─────────┐        │
//!                     │  │RateLimit│ │Sessions │        │
//!                     │  │   er    │ │ + Policy│        │
//!                     │  └─────────┘ └─────────┘        │
//!                     │  ┌─────────┐ ┌─────────┐        │
//!                     │  │ Skills  │ │  Hooks  │        │
//!                     │  │+Sandbox │ │         │        │
//!                     │  └─────────┘ └─────────┘        │
//!                     └───────────────┬─────────────────┘
//!                                     ▼
//!                           EventBus → channel / observers
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod channel;
pub mod commbus;
pub mod envelope;
pub mod hooks;
pub mod kernel;
pub mod policy;
pub mod session;
pub mod skills;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::Kernel;
pub use types::{Config, Error, Result};
