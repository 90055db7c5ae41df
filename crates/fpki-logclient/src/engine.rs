//! Log submission engine
//!
//! Submits leaves to the log through a worker pool and collects inclusion
//! proofs once the backend has sequenced them. The backend acknowledges an
//! append long before the leaf is in the tree, so proving a batch is:
//!
//! 1. `submit_batch`: every leaf acknowledged, fail-fast
//! 2. `await_tree_growth`: poll the root until the tree has grown
//! 3. `await_inclusion`: fetch a proof per leaf, retrying "not found"
//! 4. `refresh_root`: anchor the batch to the newest root
//!
//! `queue_and_prove` runs all four and reports per-leaf results.
//!
//! The cached root is the only shared mutable state. Refreshes fetch
//! outside the lock and swap the root in wholesale; its tree size never
//! decreases.

use fpki_core::{
    ConsistencyProof, InclusionProof, LeafKey, LogHasher, LogRoot, ProofVerifier, PublicKey,
    Rfc6962Hasher, SignedLogRoot,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::backend::{AppendOutcome, LogBackend};
use crate::cancel::{Cancellation, Interrupt};
use crate::config::LogClientConfig;
use crate::error::{BackendError, LogClientError, Result};
use crate::pool::{run_pool, Halt};

/// Root as decoded, plus the signed form it came in
#[derive(Debug, Clone)]
struct ObservedRoot {
    root: LogRoot,
    signed: SignedLogRoot,
}

/// Acknowledgement tally of a submitted batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// Leaves acknowledged by the backend
    pub acknowledged: usize,
    /// Leaves the backend had not seen before
    pub newly_appended: u64,
    /// Leaves the backend reported as already present
    pub already_existed: usize,
}

/// Inclusion proofs for one leaf and the root they were fetched at
#[derive(Debug, Clone)]
pub struct LeafInclusion {
    pub leaf_hash: Vec<u8>,
    pub proofs: Vec<InclusionProof>,
    pub root: LogRoot,
    pub signed_root: SignedLogRoot,
}

/// Per-leaf outcome of `await_inclusion`
#[derive(Debug, Default)]
pub struct InclusionBatch {
    pub proven: BTreeMap<LeafKey, LeafInclusion>,
    pub failed: BTreeMap<LeafKey, LogClientError>,
}

/// Outcome of `queue_and_prove`
#[derive(Debug)]
pub struct ProofReport {
    pub receipt: SubmitReceipt,
    pub proven: BTreeMap<LeafKey, LeafInclusion>,
    pub failed: BTreeMap<LeafKey, LogClientError>,
    /// Newest root after every proof was fetched
    pub latest_root: LogRoot,
    pub latest_signed_root: SignedLogRoot,
}

impl ProofReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Concurrent submission and proof retrieval against one log tree
#[derive(Debug, Clone)]
pub struct LogSubmissionEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: LogClientConfig,
    backend: Arc<dyn LogBackend>,
    log_key: Option<PublicKey>,
    verifier: ProofVerifier,
    current: Mutex<Option<ObservedRoot>>,
}

impl LogSubmissionEngine {
    /// Create an engine; fails if the configured log key does not decode
    pub fn new(config: LogClientConfig, backend: Arc<dyn LogBackend>) -> Result<Self> {
        let log_key = config
            .log_public_key_pem
            .as_deref()
            .map(|pem| PublicKey::from_pem(pem.as_bytes()))
            .transpose()?;

        info!(
            tree_id = config.tree_id,
            backend = backend.description(),
            workers = config.num_workers,
            verifies_roots = log_key.is_some(),
            "Created log submission engine"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                backend,
                log_key,
                verifier: ProofVerifier::new(),
                current: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &LogClientConfig {
        &self.inner.config
    }

    /// Last root observed, if any
    pub async fn current_root(&self) -> Option<LogRoot> {
        self.inner.current.lock().await.as_ref().map(|o| o.root.clone())
    }

    /// Append every leaf, failing fast on the first hard error
    ///
    /// "Already exists" counts as acknowledged. On failure, leaves already
    /// acknowledged stay in the log.
    pub async fn submit_batch(
        &self,
        leaves: Vec<Vec<u8>>,
        cancel: &Cancellation,
    ) -> Result<SubmitReceipt> {
        let total = leaves.len();
        let backend = Arc::clone(&self.inner.backend);
        let tree_id = self.inner.config.tree_id;
        let token = cancel.clone();

        debug!(leaves = total, "Submitting batch");

        let mut run = run_pool(self.inner.config.num_workers, leaves, cancel, true, move |leaf| {
            let backend = Arc::clone(&backend);
            let token = token.clone();
            async move {
                match token.run(backend.append(tree_id, &leaf)).await {
                    Ok(outcome) => outcome.map_err(LogClientError::from),
                    Err(interrupt) => Err(interrupted(interrupt, "submit_batch", 0, 1)),
                }
            }
        })
        .await;

        let acknowledged = run.succeeded();
        match run.halted.take() {
            None => {}
            Some(Halt::HardError) => {
                let (leaf, source) = match run.outcomes.pop() {
                    Some((leaf, Err(source))) => (leaf, source),
                    _ => return Err(LogClientError::WorkerFailed("missing batch failure".into())),
                };
                error!(
                    leaf = %leaf,
                    acknowledged = acknowledged,
                    total = total,
                    error = %source,
                    "Batch submission failed"
                );
                return Err(LogClientError::Submission {
                    leaf,
                    acknowledged,
                    total,
                    source: Box::new(source),
                });
            }
            Some(Halt::Interrupted(interrupt)) => {
                return Err(interrupted(
                    interrupt,
                    "submit_batch",
                    acknowledged as u64,
                    total as u64,
                ));
            }
            Some(Halt::WorkerLost(reason)) => return Err(LogClientError::WorkerFailed(reason)),
        }

        let mut receipt = SubmitReceipt {
            acknowledged,
            ..SubmitReceipt::default()
        };
        for (_, outcome) in &run.outcomes {
            if let Ok(AppendOutcome { already_exists }) = outcome {
                if *already_exists {
                    receipt.already_existed += 1;
                } else {
                    receipt.newly_appended += 1;
                }
            }
        }

        info!(
            acknowledged = receipt.acknowledged,
            new = receipt.newly_appended,
            duplicates = receipt.already_existed,
            "Batch acknowledged"
        );
        Ok(receipt)
    }

    /// Fetch an inclusion proof for every leaf
    ///
    /// Each leaf is looked up at the currently known tree size. While the
    /// backend reports it as not found, the worker waits
    /// `proof_poll_interval`, refreshes the root and retries, up to
    /// `max_proof_attempts` times. Proofs that do not verify against the
    /// root they were fetched at are reported as `BackendInconsistency`.
    pub async fn await_inclusion(
        &self,
        leaves: Vec<Vec<u8>>,
        cancel: &Cancellation,
    ) -> Result<InclusionBatch> {
        let leaves = dedupe(leaves);
        let total = leaves.len();
        self.inner.current_or_refresh(cancel).await?;

        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let run = run_pool(self.inner.config.num_workers, leaves, cancel, false, move |leaf| {
            let inner = Arc::clone(&inner);
            let token = token.clone();
            async move { inner.prove_leaf(&leaf, &token).await }
        })
        .await;

        let succeeded = run.succeeded();
        match run.halted {
            None => {}
            Some(Halt::Interrupted(interrupt)) => {
                return Err(interrupted(
                    interrupt,
                    "await_inclusion",
                    succeeded as u64,
                    total as u64,
                ));
            }
            Some(Halt::WorkerLost(reason)) => return Err(LogClientError::WorkerFailed(reason)),
            Some(Halt::HardError) => {
                return Err(LogClientError::WorkerFailed("unexpected fail-fast halt".into()));
            }
        }

        let mut batch = InclusionBatch::default();
        for (key, outcome) in run.outcomes {
            match outcome {
                Ok(inclusion) => {
                    batch.proven.insert(key, inclusion);
                }
                Err(e) => {
                    warn!(leaf = %key, error = %e, "No inclusion proof for leaf");
                    batch.failed.insert(key, e);
                }
            }
        }

        info!(
            proven = batch.proven.len(),
            failed = batch.failed.len(),
            "Inclusion proofs collected"
        );
        Ok(batch)
    }

    /// Fetch the latest root and make it the cached root
    ///
    /// Fails with `BackendInconsistency` if the signature does not verify
    /// under the configured log key, if the tree shrank, or if the backend
    /// reports two different roots for the same size.
    pub async fn refresh_root(&self, cancel: &Cancellation) -> Result<LogRoot> {
        Ok(self.inner.refresh(cancel).await?.root)
    }

    /// Poll the root until the tree has grown by `expected_increase`
    /// from the current root
    pub async fn await_tree_growth(
        &self,
        expected_increase: u64,
        poll_interval: Duration,
        timeout: Duration,
        cancel: &Cancellation,
    ) -> Result<LogRoot> {
        let baseline = self.inner.current_or_refresh(cancel).await?;
        self.inner
            .await_growth_from(
                baseline.root.tree_size,
                expected_increase,
                poll_interval,
                timeout,
                cancel,
            )
            .await
    }

    /// Consistency proof between two roots
    pub async fn fetch_consistency_proof(
        &self,
        old_root: &LogRoot,
        new_root: &LogRoot,
        cancel: &Cancellation,
    ) -> Result<ConsistencyProof> {
        let (from, to) = (old_root.tree_size, new_root.tree_size);
        if from > to {
            return Err(LogClientError::BackendInconsistency(format!(
                "no consistency proof from size {} back to {}",
                from, to
            )));
        }
        if from == 0 || from == to {
            return Ok(ConsistencyProof {
                first_size: from,
                second_size: to,
                hashes: Vec::new(),
            });
        }

        let tree_id = self.inner.config.tree_id;
        cancel
            .run(self.inner.backend.get_consistency_proof(tree_id, from, to))
            .await
            .map_err(|interrupt| interrupted(interrupt, "fetch_consistency_proof", 0, 1))?
            .map_err(LogClientError::from)
    }

    /// Submit a batch, wait for it to be sequenced and prove every leaf
    ///
    /// Only leaves the backend reported as new count toward the expected
    /// tree growth. Per-leaf proof failures land in `ProofReport::failed`;
    /// submission, growth-wait and root errors abort the whole call.
    pub async fn queue_and_prove(
        &self,
        leaves: Vec<Vec<u8>>,
        cancel: &Cancellation,
    ) -> Result<ProofReport> {
        let leaves = dedupe(leaves);
        let baseline = self.inner.refresh(cancel).await?.root;

        let receipt = self.submit_batch(leaves.clone(), cancel).await?;

        let config = &self.inner.config;
        self.inner
            .await_growth_from(
                baseline.tree_size,
                receipt.newly_appended,
                config.tree_growth_poll_interval,
                config.tree_growth_timeout,
                cancel,
            )
            .await?;

        let batch = self.await_inclusion(leaves, cancel).await?;
        let latest = self.inner.refresh(cancel).await?;

        info!(
            proven = batch.proven.len(),
            failed = batch.failed.len(),
            tree_size = latest.root.tree_size,
            "Batch queued and proven"
        );

        Ok(ProofReport {
            receipt,
            proven: batch.proven,
            failed: batch.failed,
            latest_root: latest.root,
            latest_signed_root: latest.signed,
        })
    }
}

impl EngineInner {
    async fn lock_current(
        &self,
        cancel: &Cancellation,
    ) -> Result<MutexGuard<'_, Option<ObservedRoot>>> {
        cancel
            .run(self.current.lock())
            .await
            .map_err(|interrupt| interrupted(interrupt, "refresh_root", 0, 1))
    }

    async fn current_or_refresh(&self, cancel: &Cancellation) -> Result<ObservedRoot> {
        let cached = self.lock_current(cancel).await?.clone();
        match cached {
            Some(observed) => Ok(observed),
            None => self.refresh(cancel).await,
        }
    }

    /// Fetch without holding the root lock; the lock covers only the
    /// monotonicity check and the swap
    async fn refresh(&self, cancel: &Cancellation) -> Result<ObservedRoot> {
        let before = self.lock_current(cancel).await?.clone();

        let signed = cancel
            .run(self.backend.get_latest_root(self.config.tree_id))
            .await
            .map_err(|interrupt| interrupted(interrupt, "refresh_root", 0, 1))??;

        if let Some(key) = &self.log_key {
            if let Err(e) = signed.verify(key) {
                warn!(error = %e, "SECURITY: Log root signature does not verify");
                return Err(LogClientError::BackendInconsistency(format!(
                    "root signature invalid: {}",
                    e
                )));
            }
        }

        let root = LogRoot::from_signed(&signed)?;

        // Anything cached before the fetch began was already reported by
        // the backend, so the new root must not fall behind it
        if let Some(previous) = before.as_ref().map(|o| &o.root) {
            if root.tree_size < previous.tree_size {
                error!(
                    previous = previous.tree_size,
                    observed = root.tree_size,
                    "SECURITY: Log tree size decreased"
                );
                return Err(LogClientError::BackendInconsistency(format!(
                    "tree size went from {} to {}",
                    previous.tree_size, root.tree_size
                )));
            }
        }

        let mut current = self.lock_current(cancel).await?;
        if let Some(latest) = current.as_ref() {
            if root.tree_size == latest.root.tree_size && root.root_hash != latest.root.root_hash {
                error!(
                    tree_size = root.tree_size,
                    "SECURITY: Log reported two different roots for one tree size"
                );
                return Err(LogClientError::BackendInconsistency(format!(
                    "two roots for tree size {}",
                    root.tree_size
                )));
            }
            if root.tree_size < latest.root.tree_size {
                // A concurrent refresh stored a newer root while this one
                // was in flight
                debug!(
                    fetched = root.tree_size,
                    cached = latest.root.tree_size,
                    "Keeping newer cached root"
                );
                return Ok(latest.clone());
            }
        }

        debug!(tree_size = root.tree_size, "Refreshed log root");
        let observed = ObservedRoot { root, signed };
        *current = Some(observed.clone());
        Ok(observed)
    }

    async fn await_growth_from(
        &self,
        baseline: u64,
        expected_increase: u64,
        poll_interval: Duration,
        timeout: Duration,
        cancel: &Cancellation,
    ) -> Result<LogRoot> {
        let target = baseline.saturating_add(expected_increase);
        let token = cancel.clone().with_timeout(timeout);
        let mut observed = baseline;

        loop {
            match self.refresh(&token).await {
                Ok(fresh) => {
                    let root = fresh.root;
                    observed = root.tree_size.max(baseline);
                    if root.tree_size >= target {
                        debug!(baseline = baseline, tree_size = root.tree_size, "Tree has grown");
                        return Ok(root);
                    }
                }
                Err(LogClientError::Backend(e)) if e.is_transient() => {
                    debug!(error = %e, "Root refresh failed during growth wait, retrying");
                }
                Err(LogClientError::Timeout { .. }) => {
                    return Err(LogClientError::Timeout {
                        operation: "await_tree_growth",
                        completed: observed - baseline,
                        expected: expected_increase,
                    })
                }
                Err(e) => return Err(e),
            }

            if let Err(interrupt) = token.sleep(poll_interval).await {
                return Err(interrupted(
                    interrupt,
                    "await_tree_growth",
                    observed - baseline,
                    expected_increase,
                ));
            }
        }
    }

    async fn prove_leaf(&self, leaf: &[u8], cancel: &Cancellation) -> Result<LeafInclusion> {
        let leaf_hash = Rfc6962Hasher.hash_leaf(leaf);
        let attempts = self.config.max_proof_attempts.max(1);
        let mut last_error = BackendError::NotFound("leaf not yet sequenced".into());

        for attempt in 1..=attempts {
            match self.current_or_refresh(cancel).await {
                Ok(observed) if observed.root.tree_size > 0 => {
                    let tree_size = observed.root.tree_size;
                    let lookup = self.backend.get_inclusion_proof_by_hash(
                        self.config.tree_id,
                        &leaf_hash,
                        tree_size,
                    );
                    match cancel.run(lookup).await {
                        Err(interrupt) => {
                            return Err(interrupted(interrupt, "await_inclusion", 0, 1))
                        }
                        Ok(Ok(proofs)) => {
                            if let Err(e) =
                                self.verifier.verify_inclusion(&observed.root, &leaf_hash, &proofs)
                            {
                                warn!(
                                    tree_size = tree_size,
                                    error = %e,
                                    "SECURITY: Backend returned a proof that fails its own root"
                                );
                                return Err(LogClientError::BackendInconsistency(e.to_string()));
                            }
                            return Ok(LeafInclusion {
                                leaf_hash,
                                proofs,
                                root: observed.root,
                                signed_root: observed.signed,
                            });
                        }
                        Ok(Err(e)) if e.is_transient() => {
                            debug!(attempt = attempt, tree_size = tree_size, error = %e, "Proof not ready");
                            last_error = e;
                        }
                        Ok(Err(e)) => return Err(e.into()),
                    }
                }
                Ok(_) => {}
                Err(LogClientError::Backend(e)) if e.is_transient() => {
                    debug!(attempt = attempt, error = %e, "No root to look up against yet");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                cancel
                    .sleep(self.config.proof_poll_interval)
                    .await
                    .map_err(|interrupt| interrupted(interrupt, "await_inclusion", 0, 1))?;
                // A failed refresh leaves the cached root in place for the next lookup
                match self.refresh(cancel).await {
                    Ok(_) => {}
                    Err(LogClientError::Backend(e)) if e.is_transient() => {
                        debug!(attempt = attempt, error = %e, "Root refresh failed, keeping cached root");
                        last_error = e;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Err(LogClientError::Backend(last_error))
    }
}

/// Map an interrupted wait onto the caller-facing error
fn interrupted(
    interrupt: Interrupt,
    operation: &'static str,
    completed: u64,
    expected: u64,
) -> LogClientError {
    match interrupt {
        Interrupt::Cancelled => LogClientError::Cancelled,
        Interrupt::DeadlineExceeded => LogClientError::Timeout {
            operation,
            completed,
            expected,
        },
    }
}

/// Drop repeated leaves, keeping first occurrences in order
fn dedupe(leaves: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut seen = HashSet::new();
    leaves
        .into_iter()
        .filter(|leaf| seen.insert(LeafKey::for_leaf(leaf)))
        .collect()
}
