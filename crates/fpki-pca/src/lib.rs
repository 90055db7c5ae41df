//! Policy Certificate Authority
//!
//! The PCA turns domain owners' issuance requests into policy certificates
//! that are only usable once they are provably in the log:
//! - Verifies each request against the key it carries
//! - Applies a cool-off unless the request proves continuity with the
//!   subject's current certificate
//! - Presigns a certificate and queues it for the log
//! - Validates it once a proof of logging covering it arrives
//!
//! ## Usage
//!
//! ```ignore
//! use fpki_pca::{Issuer, MemoryStore, PcaConfig};
//!
//! let issuer = Issuer::new(PcaConfig::from_env(), key, Arc::new(MemoryStore::new()))?;
//! let pre = issuer.submit_request(&request).await?;
//! let report = issuer.flush_to_log(&engine, &Cancellation::none()).await?;
//! let cert = issuer.drain_recently_validated(&pre.subject).await?;
//! ```

pub mod config;
pub mod error;
pub mod issuer;
pub mod storage;

pub use config::PcaConfig;
pub use error::{PcaError, Result};
pub use issuer::{FlushReport, Issuer};
pub use storage::{IssuerStore, MemoryStore, StorageError};
