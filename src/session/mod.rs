//! Session-level engine.
//!
//! - `controller` - Per-channel session controller and collaborator traits
//! - `disposition` - Delivery disposition tracking
//! - `credit` - Credit-based flow control and backpressure
//! - `commands` - Ordered completion of asynchronous store commands

pub mod commands;
pub mod controller;
pub mod credit;
pub mod disposition;

pub use commands::*;
pub use controller::*;
pub use credit::*;
pub use disposition::*;
