//! # brpc-core
//!
//! Shared building blocks for the brpc transport.
//!
//! This crate provides:
//! - The error taxonomy used on both sides of a connection
//! - The dispatch executor that runs service handlers away from I/O tasks

pub mod error;
pub mod executor;

pub use error::{Error, ErrorCode, Result};
pub use executor::{DispatchExecutor, ExecutorKind, WorkerPool};

pub mod prelude {
    //! Common imports for brpc applications

    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::executor::{DispatchExecutor, ExecutorKind};
}
