//! Operations and observability.
//!
//! - `audit` - Channel-scoped audit event emission

pub mod audit;

pub use audit::*;
