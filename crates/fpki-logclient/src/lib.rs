//! Log Client
//!
//! Submits policy objects to an append-only transparency log and retrieves
//! the proofs that they were included.
//!
//! ## Architecture
//!
//! The log itself is an external service reached through the `LogBackend`
//! trait. `LogSubmissionEngine` drives it through a fixed-size worker pool:
//!
//! - **Submission**: fan out appends, fail fast on the first hard error
//! - **Sequencing wait**: poll the signed root until the tree has grown
//! - **Proof retrieval**: fetch an inclusion proof per leaf, retrying while unsequenced
//! - **Root tracking**: cache the latest root, rejecting shrinking trees
//!
//! Every call takes a `Cancellation` that bounds RPCs and poll loops.
//!
//! ## Usage
//!
//! ```ignore
//! use fpki_logclient::{Cancellation, LogClientConfig, LogSubmissionEngine, MemoryLogBackend};
//!
//! let backend = Arc::new(MemoryLogBackend::new(1, KeyPair::generate()?));
//! let engine = LogSubmissionEngine::new(LogClientConfig::from_env(), backend)?;
//!
//! let report = engine.queue_and_prove(leaves, &Cancellation::timeout(deadline)).await?;
//! println!("proven: {}, failed: {}", report.proven.len(), report.failed.len());
//! ```

pub mod backend;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
mod pool;

pub use backend::{AppendOutcome, LogBackend, TreeId};
pub use cancel::{CancelHandle, Cancellation, Interrupt};
pub use config::LogClientConfig;
pub use engine::{InclusionBatch, LeafInclusion, LogSubmissionEngine, ProofReport, SubmitReceipt};
pub use error::{BackendError, LogClientError, Result};
pub use memory::{MemoryLogBackend, Sequencing};
