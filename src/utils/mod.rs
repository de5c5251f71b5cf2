//! Cross-cutting helpers.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
