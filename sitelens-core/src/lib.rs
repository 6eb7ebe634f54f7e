//! # sitelens-core
//!
//! Scan orchestration engine: discovers the routes of a site, audits each one
//! through a bounded pool of headless browsers, caches artifacts, streams
//! per-route progress and evaluates CI budgets over the finished report set.
//!
//! The entry point is [`orchestration::ScanRuntime`]; everything else is a
//! collaborator it wires together.

pub mod audit;
pub mod broadcast;
pub mod browser;
pub mod budget;
pub mod cache;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod history;
pub mod html;
pub mod orchestration;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{Result, ScanError};
pub use types::*;
