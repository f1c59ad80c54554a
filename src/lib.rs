#![warn(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Import style
#![allow(clippy::wildcard_imports)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
// Control flow style
#![allow(clippy::if_not_else)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
// Option/Result patterns
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Iterator patterns
#![allow(clippy::iter_without_into_iter)]
// String allocation efficiency
#![allow(clippy::format_push_string)]

//! Amphora - session-level engine for an AMQP-style message broker.
//!
//! Tracks in-flight message deliveries per client channel, applies
//! transactional semantics (auto-commit, local, distributed/XA), enforces
//! credit-based flow control and backpressure, and performs sticky consumer
//! assignment for grouped messages. Wire framing, persistence internals,
//! and queue storage are consumed through narrow traits and stay outside
//! this crate.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Session engine tuning and validation
//! - `core::time` - Deterministic time utilities
//!
//! ## Session
//! - `session::controller` - Per-channel session controller
//! - `session::disposition` - Delivery disposition tracking
//! - `session::credit` - Credit-based flow control
//! - `session::commands` - Async store command completion
//!
//! ## Transactions
//! - `txn::local` - Auto-commit and local transactions
//! - `txn::dtx` - Distributed (XA) branches and registry
//!
//! ## Grouping
//! - `groups` - Sticky consumer assignment for grouped messages
//!
//! ## External interfaces
//! - `store` - Store, queue and destination traits; in-memory store
//!
//! ## Operations
//! - `ops::audit` - Channel-scoped audit events

// Core infrastructure
pub mod core;

// Session engine
pub mod session;

// Transactions
pub mod txn;

// Message grouping
pub mod groups;

// External interfaces
pub mod store;

// Operations
pub mod ops;

// Re-exports for convenience
pub use self::core::config::SessionConfig;
pub use self::core::time::{Clock, ManualClock, SystemClock};
pub use groups::{GroupedEntry, MessageGroupManager};
pub use ops::audit;
pub use session::commands::CommandQueue;
pub use session::controller::{
    ConsumerListener, ConsumerTarget, FlowHandle, SessionController, WireHandle,
    RESOURCE_ERROR_CODE,
};
pub use session::credit::{BlockCause, CreditController, UNLIMITED_CREDIT};
pub use session::disposition::{
    Disposition, DispositionListener, DispositionRange, DispositionTracker,
};
pub use store::{
    CapacityAlert, ConsumerId, EnqueueRecord, MemoryStore, MessageDestination, MessageHandle,
    MessageStore, QueueEntryHandle, StoreAck, StoreAckHandle, StoreError, StoreOp,
    StoreTransaction,
};
pub use txn::{
    AutoCommitTransaction, BranchState, DistributedTransaction, DtxError, DtxRegistry,
    LocalTransaction, Transaction, TxnAction, TxnError, TxnKind, Xid,
};
