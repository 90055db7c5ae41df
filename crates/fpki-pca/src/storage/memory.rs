//! In-memory storage backend
//!
//! Default storage implementation using in-memory hashmaps.
//! Suitable for development and tests. Data is lost on restart.

use async_trait::async_trait;
use fpki_core::{Certificate, DomainName, LogRoot, Spt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::{IssuerStore, StorageError};

/// In-memory issuer store
#[derive(Debug, Default)]
pub struct MemoryStore {
    serial: AtomicU64,
    presigned: RwLock<HashMap<DomainName, Certificate>>,
    valid: RwLock<HashMap<DomainName, Certificate>>,
    recently_validated: RwLock<HashMap<DomainName, Certificate>>,
    quarantined: RwLock<Vec<Spt>>,
    trusted_root: RwLock<Option<LogRoot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last serial handed out, zero if none
    pub fn last_serial(&self) -> u64 {
        self.serial.load(Ordering::SeqCst)
    }
}

// A panic while holding one of these locks leaves whole values behind, never
// a half-written one, so poisoned locks are still safe to use.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl IssuerStore for MemoryStore {
    async fn next_serial(&self) -> Result<u64, StorageError> {
        let previous = self
            .serial
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_add(1))
            .map_err(|_| StorageError::SerialExhausted)?;
        Ok(previous + 1)
    }

    async fn put_presigned(&self, cert: &Certificate) -> Result<(), StorageError> {
        debug!(subject = %cert.subject, serial = cert.serial_number, "Storing pre-certificate");
        write(&self.presigned).insert(cert.subject.clone(), cert.clone());
        Ok(())
    }

    async fn remove_presigned(&self, subject: &DomainName) -> Result<(), StorageError> {
        write(&self.presigned).remove(subject);
        Ok(())
    }

    async fn list_presigned(&self) -> Result<Vec<Certificate>, StorageError> {
        Ok(read(&self.presigned).values().cloned().collect())
    }

    async fn put_valid(&self, cert: &Certificate) -> Result<(), StorageError> {
        debug!(subject = %cert.subject, serial = cert.serial_number, "Storing valid certificate");
        write(&self.valid).insert(cert.subject.clone(), cert.clone());
        Ok(())
    }

    async fn list_valid(&self) -> Result<Vec<Certificate>, StorageError> {
        Ok(read(&self.valid).values().cloned().collect())
    }

    async fn put_recently_validated(&self, cert: &Certificate) -> Result<(), StorageError> {
        write(&self.recently_validated).insert(cert.subject.clone(), cert.clone());
        Ok(())
    }

    async fn remove_recently_validated(&self, subject: &DomainName) -> Result<(), StorageError> {
        write(&self.recently_validated).remove(subject);
        Ok(())
    }

    async fn list_recently_validated(&self) -> Result<Vec<Certificate>, StorageError> {
        Ok(read(&self.recently_validated).values().cloned().collect())
    }

    async fn push_quarantined(&self, spt: &Spt) -> Result<(), StorageError> {
        write(&self.quarantined).push(spt.clone());
        Ok(())
    }

    async fn list_quarantined(&self) -> Result<Vec<Spt>, StorageError> {
        Ok(read(&self.quarantined).clone())
    }

    async fn put_trusted_root(&self, root: &LogRoot) -> Result<(), StorageError> {
        *write(&self.trusted_root) = Some(root.clone());
        Ok(())
    }

    async fn get_trusted_root(&self) -> Result<Option<LogRoot>, StorageError> {
        Ok(read(&self.trusted_root).clone())
    }

    fn description(&self) -> &str {
        "memory"
    }
}
