//! UDS3 - Polyglot-Persistence Orchestrator Core
//!
//! A runtime that brokers CRUD and search operations across heterogeneous
//! storage backends (vector, graph, relational, key-value, document, file)
//! behind a uniform surface, and that drives multi-backend mutations through
//! a saga engine with write-ahead event logging, idempotency, locking,
//! compensation, and crash recovery.

pub mod backends;
pub mod batcher;
pub mod config;
pub mod error;
pub mod governance;
pub mod manager;
pub mod saga;
pub mod utils;

pub use error::{CoreError, ErrorReport, Result};
