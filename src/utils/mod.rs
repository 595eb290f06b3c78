//! # Utility Modules
//!
//! Ambient support for the protocol layer.
//!
//! ## Components
//! - **Logging**: `tracing-subscriber` setup driven by configuration
//! - **Metrics**: thread-safe counters with a process-wide instance

pub mod logging;
pub mod metrics;
