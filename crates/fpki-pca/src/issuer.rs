//! Policy certificate issuer
//!
//! Per subject, a certificate moves `NoRecord -> Presigned -> Valid`:
//!
//! - `submit_request` verifies a request, picks the trust window and stores
//!   a signed pre-certificate as the subject's pending entry
//! - `on_proof_received` checks a proof of logging against the pending
//!   pre-certificate and, if it holds, makes the certificate valid
//!
//! Proofs that match no pending pre-certificate, or that fail verification,
//! are quarantined for inspection and never dropped. A proof's root must be
//! the issuer's trusted root or be linked to it by a consistency proof; the
//! first root an issuer ever sees is trusted on first use.
//!
//! All state sits behind one lock. A request and a proof for the same
//! subject can race; the lock orders them. Every change is written to the
//! `IssuerStore` before it is applied in memory.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fpki_core::{
    Certificate, ConsistencyProof, DomainName, IssuanceRequest, IssuanceTerms, KeyPair, LeafKey,
    LogRoot, ProofVerifier, PublicKey, Rfc6962Hasher, Spt, VerificationError,
};
use fpki_logclient::{Cancellation, LogSubmissionEngine};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::PcaConfig;
use crate::error::{PcaError, Result};
use crate::storage::IssuerStore;

/// Outcome of one `flush_to_log` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Pre-certificates handed to the log
    pub submitted: usize,
    /// Subjects whose certificate became valid
    pub validated: Vec<DomainName>,
    /// Subjects whose proof was quarantined
    pub quarantined: Vec<DomainName>,
    /// Pre-certificates put back for the next flush
    pub requeued: usize,
    /// Size of the log root the issuer trusts after the flush
    pub tree_size: u64,
}

#[derive(Debug)]
struct IssuerState {
    presigned: HashMap<DomainName, Certificate>,
    valid: HashMap<DomainName, Certificate>,
    recently_validated: HashMap<DomainName, Certificate>,
    quarantined: Vec<Spt>,
    /// Serialized pre-certificates not yet proven in the log
    outbox: Vec<Vec<u8>>,
    trusted_root: LogRoot,
}

impl IssuerState {
    fn empty() -> Self {
        Self {
            presigned: HashMap::new(),
            valid: HashMap::new(),
            recently_validated: HashMap::new(),
            quarantined: Vec::new(),
            outbox: Vec::new(),
            trusted_root: LogRoot::empty(&Rfc6962Hasher),
        }
    }
}

/// Policy certificate authority
#[derive(Debug)]
pub struct Issuer {
    config: PcaConfig,
    cool_off: ChronoDuration,
    validity: ChronoDuration,
    key: KeyPair,
    log_key: Option<PublicKey>,
    store: Arc<dyn IssuerStore>,
    verifier: ProofVerifier,
    state: Mutex<IssuerState>,
    /// Serializes `flush_to_log` so the trusted root only moves under one flush
    flushing: Mutex<()>,
}

impl Issuer {
    /// Create an issuer with no prior state
    pub fn new(config: PcaConfig, key: KeyPair, store: Arc<dyn IssuerStore>) -> Result<Self> {
        Self::with_state(config, key, store, IssuerState::empty())
    }

    /// Rebuild an issuer from everything `store` holds
    ///
    /// Pending pre-certificates go back into the outbox; resubmitting a
    /// leaf the log already holds is harmless.
    pub async fn restore(
        config: PcaConfig,
        key: KeyPair,
        store: Arc<dyn IssuerStore>,
    ) -> Result<Self> {
        let presigned = store.list_presigned().await?;
        let outbox = presigned
            .iter()
            .map(Certificate::leaf_bytes)
            .collect::<fpki_core::Result<Vec<_>>>()?;

        let state = IssuerState {
            presigned: by_subject(presigned),
            valid: by_subject(store.list_valid().await?),
            recently_validated: by_subject(store.list_recently_validated().await?),
            quarantined: store.list_quarantined().await?,
            outbox,
            trusted_root: store
                .get_trusted_root()
                .await?
                .unwrap_or_else(|| LogRoot::empty(&Rfc6962Hasher)),
        };

        info!(
            store = store.description(),
            presigned = state.presigned.len(),
            valid = state.valid.len(),
            quarantined = state.quarantined.len(),
            tree_size = state.trusted_root.tree_size,
            "Restored issuer state"
        );

        Self::with_state(config, key, store, state)
    }

    fn with_state(
        config: PcaConfig,
        key: KeyPair,
        store: Arc<dyn IssuerStore>,
        state: IssuerState,
    ) -> Result<Self> {
        let cool_off = ChronoDuration::from_std(config.cool_off)
            .map_err(|e| PcaError::InvalidConfig(format!("cool_off: {}", e)))?;
        let validity = ChronoDuration::from_std(config.validity)
            .map_err(|e| PcaError::InvalidConfig(format!("validity: {}", e)))?;

        info!(
            ca_name = %config.ca_name,
            key = %key.public_key().fingerprint(),
            cool_off_secs = config.cool_off.as_secs(),
            "Issuer initialized"
        );

        Ok(Self {
            config,
            cool_off,
            validity,
            key,
            log_key: None,
            store,
            verifier: ProofVerifier::new(),
            state: Mutex::new(state),
            flushing: Mutex::new(()),
        })
    }

    /// Require proofs of logging to carry a tree head signed by `log_key`
    pub fn with_log_key(mut self, log_key: PublicKey) -> Self {
        self.log_key = Some(log_key);
        self
    }

    pub fn config(&self) -> &PcaConfig {
        &self.config
    }

    /// Key that verifies `Certificate::issuer_signature`
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    /// Verify a request and issue a pre-certificate for it
    ///
    /// The certificate is usable immediately only if the subject already
    /// holds a valid certificate and the request's prior-key signature
    /// verifies against that certificate's key. Otherwise `not_before` is
    /// pushed out by the cool-off period. A pending pre-certificate for the
    /// same subject is replaced and will never become valid.
    pub async fn submit_request(&self, request: &IssuanceRequest) -> Result<Certificate> {
        if let Err(e) = request.verify_signature() {
            warn!(
                subject = %request.subject,
                error = %e,
                "SECURITY: Rejected request not signed by its own key"
            );
            return Err(PcaError::InvalidSignature(e.to_string()));
        }

        let mut state = self.state.lock().await;

        let now = Utc::now();
        let continuity = state
            .valid
            .get(&request.subject)
            .is_some_and(|valid| proves_continuity(request, valid));
        let not_before = if continuity {
            now
        } else {
            shift(now, self.cool_off)?
        };

        let serial_number = self
            .store
            .next_serial()
            .await
            .map_err(|e| PcaError::SerialAllocation(e.to_string()))?;

        let terms = IssuanceTerms {
            ca_name: self.config.ca_name.clone(),
            not_before,
            not_after: shift(now, self.validity)?,
            serial_number,
        };
        let cert = Certificate::presign(request, terms, &self.key)?;
        let leaf = cert.leaf_bytes()?;

        self.store.put_presigned(&cert).await?;
        if let Some(orphan) = state.presigned.insert(cert.subject.clone(), cert.clone()) {
            info!(
                subject = %cert.subject,
                orphaned_serial = orphan.serial_number,
                "Replaced pending pre-certificate"
            );
        }
        state.outbox.push(leaf);

        info!(
            subject = %cert.subject,
            serial = serial_number,
            continuity = continuity,
            not_before = %not_before,
            "Issued pre-certificate"
        );
        Ok(cert)
    }

    /// Attach a proof of logging to the subject's pending pre-certificate
    ///
    /// Returns the now valid certificate. A proof with no pending
    /// pre-certificate yields `NotFound`; one that does not cover the
    /// pending pre-certificate, or whose root is not anchored to the
    /// trusted root, yields the verification failure. Either way the proof
    /// is quarantined.
    ///
    /// Without a consistency proof the SPT's root must equal the trusted
    /// root, unless nothing is trusted yet.
    pub async fn on_proof_received(&self, spt: Spt) -> Result<Certificate> {
        self.accept_proof(spt, None).await
    }

    /// Like `on_proof_received`, with `consistency` linking the SPT's root
    /// and the trusted root in whichever direction they differ
    ///
    /// A root newer than the trusted root becomes the trusted root.
    pub async fn on_proof_received_with_consistency(
        &self,
        spt: Spt,
        consistency: &ConsistencyProof,
    ) -> Result<Certificate> {
        self.accept_proof(spt, Some(consistency)).await
    }

    async fn accept_proof(
        &self,
        spt: Spt,
        consistency: Option<&ConsistencyProof>,
    ) -> Result<Certificate> {
        let mut state = self.state.lock().await;

        let Some(pending) = state.presigned.get(&spt.subject).cloned() else {
            warn!(
                subject = %spt.subject,
                log_id = %spt.log_id,
                tree_size = spt.tree_head_serial_number,
                "SECURITY: Proof of logging matches no pending pre-certificate"
            );
            let subject = spt.subject.to_string();
            self.quarantine(&mut state, spt).await?;
            return Err(PcaError::NotFound(format!(
                "no pending pre-certificate for '{}'",
                subject
            )));
        };

        let anchored = match self.check_proof(&pending, &spt, &state.trusted_root, consistency) {
            Ok(anchored) => anchored,
            Err(e) => {
                warn!(
                    subject = %spt.subject,
                    serial = pending.serial_number,
                    error = %e,
                    "SECURITY: Proof of logging does not cover the pending pre-certificate"
                );
                self.quarantine(&mut state, spt).await?;
                return Err(e);
            }
        };

        let mut cert = pending;
        cert.attach_proof(spt)?;

        if let Some(root) = &anchored {
            self.store.put_trusted_root(root).await?;
        }
        self.store.put_valid(&cert).await?;
        self.store.put_recently_validated(&cert).await?;
        self.store.remove_presigned(&cert.subject).await?;

        if let Some(root) = anchored {
            debug!(tree_size = root.tree_size, "Trusted root advanced by proof of logging");
            state.trusted_root = root;
        }
        state.presigned.remove(&cert.subject);
        state.valid.insert(cert.subject.clone(), cert.clone());
        state.recently_validated.insert(cert.subject.clone(), cert.clone());

        info!(
            subject = %cert.subject,
            serial = cert.serial_number,
            "Certificate is now valid"
        );
        Ok(cert)
    }

    /// Take the certificate validated for `subject` since the last drain
    pub async fn drain_recently_validated(&self, subject: &DomainName) -> Result<Certificate> {
        let mut state = self.state.lock().await;
        if !state.recently_validated.contains_key(subject) {
            return Err(PcaError::NotFound(format!(
                "no newly validated certificate for '{}'",
                subject
            )));
        }

        self.store.remove_recently_validated(subject).await?;
        state
            .recently_validated
            .remove(subject)
            .ok_or_else(|| PcaError::NotFound(subject.to_string()))
    }

    pub async fn valid_certificate(&self, subject: &DomainName) -> Option<Certificate> {
        self.state.lock().await.valid.get(subject).cloned()
    }

    pub async fn presigned(&self, subject: &DomainName) -> Option<Certificate> {
        self.state.lock().await.presigned.get(subject).cloned()
    }

    pub async fn quarantined_proofs(&self) -> Vec<Spt> {
        self.state.lock().await.quarantined.clone()
    }

    /// Pre-certificates waiting for the next `flush_to_log`
    pub async fn pending_submissions(&self) -> usize {
        self.state.lock().await.outbox.len()
    }

    /// Newest log root the issuer has verified
    pub async fn trusted_root(&self) -> LogRoot {
        self.state.lock().await.trusted_root.clone()
    }

    /// Log every pending pre-certificate and deliver the resulting proofs
    ///
    /// The log's latest root must extend the root the issuer trusts.
    /// Each proof is checked at the root it was fetched at and carried to
    /// the latest root by a consistency proof before it becomes an SPT.
    /// Leaves without a proof stay queued for the next flush.
    pub async fn flush_to_log(
        &self,
        engine: &LogSubmissionEngine,
        cancel: &Cancellation,
    ) -> Result<FlushReport> {
        let _flushing = self.flushing.lock().await;
        let leaves = std::mem::take(&mut self.state.lock().await.outbox);
        if leaves.is_empty() {
            return Ok(FlushReport {
                tree_size: self.trusted_root().await.tree_size,
                ..FlushReport::default()
            });
        }

        let mut report = FlushReport {
            submitted: leaves.len(),
            ..FlushReport::default()
        };
        debug!(leaves = leaves.len(), "Flushing pre-certificates to the log");

        let proven = match engine.queue_and_prove(leaves.clone(), cancel).await {
            Ok(proven) => proven,
            Err(e) => {
                warn!(error = %e, may_have_landed = e.may_have_landed(), "Log flush failed");
                self.requeue(leaves).await;
                return Err(e.into());
            }
        };
        let latest = proven.latest_root.clone();

        if let Err(e) = self.advance_trusted_root(engine, &latest, cancel).await {
            self.requeue(leaves).await;
            return Err(e);
        }
        report.tree_size = latest.tree_size;

        let mut by_key: HashMap<LeafKey, Vec<u8>> = leaves
            .into_iter()
            .map(|leaf| (LeafKey::for_leaf(&leaf), leaf))
            .collect();
        let mut retry = Vec::new();
        let mut consistency: BTreeMap<u64, ConsistencyProof> = BTreeMap::new();

        for (key, inclusion) in proven.proven {
            let Some(leaf) = by_key.remove(&key) else {
                continue;
            };
            let cert = match Certificate::from_bytes(&leaf) {
                Ok(cert) => cert,
                Err(e) => {
                    error!(leaf = %key, error = %e, "Dropping undecodable pre-certificate");
                    continue;
                }
            };

            let fetched_at = inclusion.root.tree_size;
            if !consistency.contains_key(&fetched_at) {
                match engine
                    .fetch_consistency_proof(&inclusion.root, &latest, cancel)
                    .await
                {
                    Ok(proof) => {
                        consistency.insert(fetched_at, proof);
                    }
                    Err(e) => {
                        warn!(leaf = %key, error = %e, "No consistency proof for leaf root");
                        retry.push(leaf);
                        continue;
                    }
                }
            }
            let Some(proof) = consistency.get(&fetched_at) else {
                retry.push(leaf);
                continue;
            };
            let spt = Spt::from_inclusion(
                cert.subject.clone(),
                &self.config.ca_name,
                &self.config.log_id,
                &inclusion.signed_root,
                &inclusion.proofs,
            )?;

            if let Err(e) = self.verifier.verify_inclusion_across_growth(
                &inclusion.root,
                &latest,
                proof,
                &inclusion.leaf_hash,
                &inclusion.proofs,
            ) {
                error!(
                    subject = %cert.subject,
                    fetched_at = fetched_at,
                    latest = latest.tree_size,
                    error = %e,
                    "SECURITY: Log proof does not hold at the latest root"
                );
                self.quarantine(&mut *self.state.lock().await, spt).await?;
                report.quarantined.push(cert.subject);
                continue;
            }

            match self.on_proof_received_with_consistency(spt, proof).await {
                Ok(valid) => report.validated.push(valid.subject),
                Err(
                    PcaError::NotFound(_)
                    | PcaError::Verification(_)
                    | PcaError::InvalidSignature(_),
                ) => report.quarantined.push(cert.subject),
                Err(e) => {
                    warn!(subject = %cert.subject, error = %e, "Could not record proof of logging");
                    retry.push(leaf);
                }
            }
        }

        for (key, e) in &proven.failed {
            if let Some(leaf) = by_key.remove(key) {
                debug!(leaf = %key, error = %e, "Requeueing unproven pre-certificate");
                retry.push(leaf);
            }
        }

        report.requeued = retry.len();
        self.requeue(retry).await;

        info!(
            submitted = report.submitted,
            validated = report.validated.len(),
            quarantined = report.quarantined.len(),
            requeued = report.requeued,
            tree_size = report.tree_size,
            "Log flush complete"
        );
        Ok(report)
    }

    async fn advance_trusted_root(
        &self,
        engine: &LogSubmissionEngine,
        latest: &LogRoot,
        cancel: &Cancellation,
    ) -> Result<()> {
        let trusted = self.trusted_root().await;
        let proof = engine.fetch_consistency_proof(&trusted, latest, cancel).await?;
        let next = self.verifier.verify_root_progression(&trusted, latest, &proof)?;

        self.store.put_trusted_root(&next).await?;
        let mut state = self.state.lock().await;
        // A proof delivered directly may have advanced it meanwhile
        if next.tree_size >= state.trusted_root.tree_size {
            state.trusted_root = next;
        }
        Ok(())
    }

    /// Check `spt` against the pending pre-certificate and the trusted root
    ///
    /// Returns the root to trust from now on, if it moves.
    fn check_proof(
        &self,
        pending: &Certificate,
        spt: &Spt,
        trusted: &LogRoot,
        consistency: Option<&ConsistencyProof>,
    ) -> Result<Option<LogRoot>> {
        if let Some(log_key) = &self.log_key {
            spt.verify_log_signature(log_key)
                .map_err(|e| PcaError::InvalidSignature(format!("tree head: {}", e)))?;
        }
        let malformed = |e: fpki_core::FpkiError| VerificationError::MalformedProof(e.to_string());
        let root = spt.log_root().map_err(malformed)?;
        let proofs = spt.inclusion_proofs().map_err(malformed)?;
        let leaf_hash = pending.leaf_hash()?;
        self.verifier.verify_inclusion(&root, &leaf_hash, &proofs)?;
        self.anchor(trusted, &root, consistency)
    }

    fn anchor(
        &self,
        trusted: &LogRoot,
        root: &LogRoot,
        consistency: Option<&ConsistencyProof>,
    ) -> Result<Option<LogRoot>> {
        if trusted.tree_size == 0 {
            return Ok(Some(root.clone()));
        }
        if root.tree_size == trusted.tree_size {
            if root.root_hash == trusted.root_hash {
                return Ok(None);
            }
            return Err(VerificationError::ConsistencyMismatch(format!(
                "root differs from the trusted root at tree size {}",
                root.tree_size
            ))
            .into());
        }
        let Some(proof) = consistency else {
            return Err(VerificationError::ConsistencyMismatch(format!(
                "nothing links tree size {} to the trusted tree size {}",
                root.tree_size, trusted.tree_size
            ))
            .into());
        };
        if root.tree_size > trusted.tree_size {
            Ok(Some(self.verifier.verify_root_progression(trusted, root, proof)?))
        } else {
            self.verifier.verify_root_progression(root, trusted, proof)?;
            Ok(None)
        }
    }

    async fn quarantine(&self, state: &mut IssuerState, spt: Spt) -> Result<()> {
        self.store.push_quarantined(&spt).await?;
        state.quarantined.push(spt);
        Ok(())
    }

    async fn requeue(&self, leaves: Vec<Vec<u8>>) {
        if !leaves.is_empty() {
            self.state.lock().await.outbox.extend(leaves);
        }
    }
}

/// Whether `request` is signed by the previous key of `valid`'s holder
fn proves_continuity(request: &IssuanceRequest, valid: &Certificate) -> bool {
    if request.prior_key_signature.is_none() {
        return false;
    }
    let verified = valid
        .public_key()
        .and_then(|key| request.verify_prior_key_signature(&key));
    match verified {
        Ok(()) => true,
        Err(e) => {
            warn!(
                subject = %request.subject,
                error = %e,
                "SECURITY: Prior key signature does not match the valid certificate"
            );
            false
        }
    }
}

fn shift(at: DateTime<Utc>, by: ChronoDuration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(by)
        .ok_or_else(|| PcaError::InvalidConfig(format!("{} past {} is out of range", by, at)))
}

fn by_subject(certs: Vec<Certificate>) -> HashMap<DomainName, Certificate> {
    certs
        .into_iter()
        .map(|cert| (cert.subject.clone(), cert))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use fpki_core::{DomainOwner, MerkleTree, SignedLogRoot};

    fn issuer() -> Issuer {
        Issuer::new(
            PcaConfig::new("pca"),
            KeyPair::generate().unwrap(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn domain(name: &str) -> DomainName {
        DomainName::parse(name).unwrap()
    }

    /// Log `cert` after some unrelated leaves and wrap the proof as an SPT
    fn spt_for(cert: &Certificate, log_key: &KeyPair) -> Spt {
        let mut tree = MerkleTree::new();
        tree.push(b"unrelated");
        let index = tree.push(&cert.leaf_bytes().unwrap());
        spt_at(&tree, index, &cert.subject, log_key)
    }

    /// SPT for the leaf at `index`, signed at the tree's current size
    fn spt_at(tree: &MerkleTree, index: u64, subject: &DomainName, log_key: &KeyPair) -> Spt {
        let signed = SignedLogRoot::sign(tree.len(), tree.root(), Utc::now(), log_key).unwrap();
        let proof = tree.inclusion_proof(index, tree.len()).unwrap();
        Spt::from_inclusion(subject.clone(), "pca", "log", &signed, &[proof]).unwrap()
    }

    #[tokio::test]
    async fn test_first_request_gets_cool_off() {
        let issuer = issuer();
        let mut owner = DomainOwner::new();
        let request = owner.build_request(&domain("example.com"), 1).unwrap();

        let before = Utc::now();
        let cert = issuer.submit_request(&request).await.unwrap();

        assert!(cert.not_before >= before + ChronoDuration::days(7));
        assert_eq!(cert.serial_number, 1);
        assert!(issuer.presigned(&domain("example.com")).await.is_some());
        assert_eq!(issuer.pending_submissions().await, 1);
    }

    #[tokio::test]
    async fn test_tampered_request_is_rejected() {
        let issuer = issuer();
        let mut owner = DomainOwner::new();
        let mut request = owner.build_request(&domain("example.com"), 1).unwrap();
        request.version = 2;

        let result = issuer.submit_request(&request).await;
        assert!(matches!(result, Err(PcaError::InvalidSignature(_))));
        assert!(issuer.presigned(&domain("example.com")).await.is_none());
        assert_eq!(issuer.pending_submissions().await, 0);
    }

    #[tokio::test]
    async fn test_proof_validates_pending_certificate() {
        let log_key = KeyPair::generate().unwrap();
        let issuer = issuer().with_log_key(log_key.public_key());
        let mut owner = DomainOwner::new();
        let request = owner.build_request(&domain("example.com"), 1).unwrap();
        let pre = issuer.submit_request(&request).await.unwrap();

        let cert = issuer.on_proof_received(spt_for(&pre, &log_key)).await.unwrap();

        assert!(cert.is_valid());
        cert.verify_issuer_signature(&issuer.public_key()).unwrap();
        cert.verify_proofs(&ProofVerifier::new()).unwrap();
        assert!(issuer.presigned(&domain("example.com")).await.is_none());
        assert_eq!(
            issuer.valid_certificate(&domain("example.com")).await,
            Some(cert.clone())
        );

        let drained = issuer.drain_recently_validated(&domain("example.com")).await.unwrap();
        assert_eq!(drained, cert);
        assert!(matches!(
            issuer.drain_recently_validated(&domain("example.com")).await,
            Err(PcaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_continuity_skips_cool_off() {
        let log_key = KeyPair::generate().unwrap();
        let issuer = issuer().with_log_key(log_key.public_key());
        let mut owner = DomainOwner::new();
        let subject = domain("example.com");

        let first = issuer
            .submit_request(&owner.build_request(&subject, 1).unwrap())
            .await
            .unwrap();
        issuer.on_proof_received(spt_for(&first, &log_key)).await.unwrap();

        let before = Utc::now();
        let second = issuer
            .submit_request(&owner.build_request(&subject, 2).unwrap())
            .await
            .unwrap();
        let after = Utc::now();

        assert!(second.not_before >= before && second.not_before <= after);
        assert_eq!(second.serial_number, 2);
    }

    #[tokio::test]
    async fn test_foreign_prior_key_gets_cool_off() {
        let log_key = KeyPair::generate().unwrap();
        let issuer = issuer().with_log_key(log_key.public_key());
        let subject = domain("example.com");

        let mut owner = DomainOwner::new();
        let first = issuer
            .submit_request(&owner.build_request(&subject, 1).unwrap())
            .await
            .unwrap();
        issuer.on_proof_received(spt_for(&first, &log_key)).await.unwrap();

        // Someone else with their own rotated keys asks for the same domain
        let mut attacker = DomainOwner::new();
        attacker.build_request(&subject, 1).unwrap();
        let hijack = attacker.build_request(&subject, 2).unwrap();
        assert!(hijack.prior_key_signature.is_some());

        let before = Utc::now();
        let cert = issuer.submit_request(&hijack).await.unwrap();
        assert!(cert.not_before >= before + ChronoDuration::days(7));
    }

    #[tokio::test]
    async fn test_unmatched_proof_is_quarantined() {
        let issuer = issuer();
        let log_key = KeyPair::generate().unwrap();
        let other = self::issuer();
        let mut owner = DomainOwner::new();
        let foreign = other
            .submit_request(&owner.build_request(&domain("example.com"), 1).unwrap())
            .await
            .unwrap();

        let result = issuer.on_proof_received(spt_for(&foreign, &log_key)).await;

        assert!(matches!(result, Err(PcaError::NotFound(_))));
        assert_eq!(issuer.quarantined_proofs().await.len(), 1);
        assert!(issuer.valid_certificate(&domain("example.com")).await.is_none());
        assert!(issuer.presigned(&domain("example.com")).await.is_none());
    }

    #[tokio::test]
    async fn test_proof_for_other_leaf_is_quarantined() {
        let issuer = issuer();
        let log_key = KeyPair::generate().unwrap();
        let subject = domain("example.com");
        let mut owner = DomainOwner::new();

        let orphan = issuer
            .submit_request(&owner.build_request(&subject, 1).unwrap())
            .await
            .unwrap();
        issuer
            .submit_request(&owner.build_request(&subject, 2).unwrap())
            .await
            .unwrap();

        let result = issuer.on_proof_received(spt_for(&orphan, &log_key)).await;

        assert!(matches!(result, Err(PcaError::Verification(_))));
        assert_eq!(issuer.quarantined_proofs().await.len(), 1);
        assert!(issuer.presigned(&subject).await.is_some());
        assert!(issuer.valid_certificate(&subject).await.is_none());
    }

    #[tokio::test]
    async fn test_log_key_is_enforced() {
        let log_key = KeyPair::generate().unwrap();
        let issuer = issuer().with_log_key(log_key.public_key());
        let mut owner = DomainOwner::new();
        let pre = issuer
            .submit_request(&owner.build_request(&domain("example.com"), 1).unwrap())
            .await
            .unwrap();

        let forged = spt_for(&pre, &KeyPair::generate().unwrap());
        assert!(matches!(
            issuer.on_proof_received(forged).await,
            Err(PcaError::InvalidSignature(_))
        ));
        issuer.on_proof_received(spt_for(&pre, &log_key)).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_proof_root_is_trusted_on_first_use() {
        let log_key = KeyPair::generate().unwrap();
        let store = Arc::new(MemoryStore::new());
        let issuer = Issuer::new(PcaConfig::new("pca"), KeyPair::generate().unwrap(), store.clone())
            .unwrap()
            .with_log_key(log_key.public_key());
        let mut owner = DomainOwner::new();
        let pre = issuer
            .submit_request(&owner.build_request(&domain("a.example"), 1).unwrap())
            .await
            .unwrap();
        assert_eq!(issuer.trusted_root().await.tree_size, 0);

        let spt = spt_for(&pre, &log_key);
        let root = spt.log_root().unwrap();
        issuer.on_proof_received(spt).await.unwrap();

        assert_eq!(issuer.trusted_root().await, root);
        assert_eq!(store.get_trusted_root().await.unwrap(), Some(root));
    }

    #[tokio::test]
    async fn test_proof_from_foreign_tree_is_quarantined() {
        let issuer = issuer();
        let log_key = KeyPair::generate().unwrap();
        let mut owner = DomainOwner::new();
        let first = issuer
            .submit_request(&owner.build_request(&domain("a.example"), 1).unwrap())
            .await
            .unwrap();
        issuer.on_proof_received(spt_for(&first, &log_key)).await.unwrap();
        let trusted = issuer.trusted_root().await;

        let subject = domain("b.example");
        let pre = issuer
            .submit_request(&owner.build_request(&subject, 1).unwrap())
            .await
            .unwrap();

        // Same size as the trusted tree, different history
        let same_size = issuer.on_proof_received(spt_for(&pre, &log_key)).await;
        assert!(matches!(
            same_size,
            Err(PcaError::Verification(VerificationError::ConsistencyMismatch(_)))
        ));

        // Larger tree built by whoever holds the proof, with its own
        // consistency proof that cannot reach the trusted root
        let mut tree = MerkleTree::new();
        tree.push(b"made up");
        tree.push(b"history");
        let index = tree.push(&pre.leaf_bytes().unwrap());
        let consistency = tree.consistency_proof(2, 3).unwrap();
        let larger = issuer
            .on_proof_received_with_consistency(spt_at(&tree, index, &subject, &log_key), &consistency)
            .await;
        assert!(matches!(
            larger,
            Err(PcaError::Verification(VerificationError::ConsistencyMismatch(_)))
        ));
        let unlinked = issuer.on_proof_received(spt_at(&tree, index, &subject, &log_key)).await;
        assert!(matches!(
            unlinked,
            Err(PcaError::Verification(VerificationError::ConsistencyMismatch(_)))
        ));

        assert_eq!(issuer.quarantined_proofs().await.len(), 3);
        assert!(issuer.presigned(&subject).await.is_some());
        assert!(issuer.valid_certificate(&subject).await.is_none());
        assert_eq!(issuer.trusted_root().await, trusted);
    }

    #[tokio::test]
    async fn test_consistency_proof_carries_trust_forward() {
        let log_key = KeyPair::generate().unwrap();
        let issuer = issuer().with_log_key(log_key.public_key());
        let mut owner = DomainOwner::new();
        let mut tree = MerkleTree::new();

        let a = issuer
            .submit_request(&owner.build_request(&domain("a.example"), 1).unwrap())
            .await
            .unwrap();
        let b = issuer
            .submit_request(&owner.build_request(&domain("b.example"), 1).unwrap())
            .await
            .unwrap();
        let a_index = tree.push(&a.leaf_bytes().unwrap());
        let early = spt_at(&tree, a_index, &a.subject, &log_key);
        tree.push(b"someone else");
        let b_index = tree.push(&b.leaf_bytes().unwrap());

        // Newer root first, then a proof at an older root linked back to it
        issuer
            .on_proof_received(spt_at(&tree, b_index, &b.subject, &log_key))
            .await
            .unwrap();
        assert_eq!(issuer.trusted_root().await.tree_size, 3);

        let backwards = tree.consistency_proof(1, 3).unwrap();
        issuer
            .on_proof_received_with_consistency(early, &backwards)
            .await
            .unwrap();
        assert_eq!(issuer.trusted_root().await.tree_size, 3);

        let c = issuer
            .submit_request(&owner.build_request(&domain("c.example"), 1).unwrap())
            .await
            .unwrap();
        let c_index = tree.push(&c.leaf_bytes().unwrap());
        let forwards = tree.consistency_proof(3, 4).unwrap();
        issuer
            .on_proof_received_with_consistency(
                spt_at(&tree, c_index, &c.subject, &log_key),
                &forwards,
            )
            .await
            .unwrap();
        assert_eq!(issuer.trusted_root().await.tree_size, 4);
        assert!(issuer.quarantined_proofs().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_keeps_state_and_serials() {
        let store = Arc::new(MemoryStore::new());
        let key = KeyPair::generate().unwrap();
        let log_key = KeyPair::generate().unwrap();
        let issuer = Issuer::new(PcaConfig::new("pca"), key.clone(), store.clone())
            .unwrap()
            .with_log_key(log_key.public_key());
        let mut owner = DomainOwner::new();

        let valid = issuer
            .submit_request(&owner.build_request(&domain("a.example"), 1).unwrap())
            .await
            .unwrap();
        issuer.on_proof_received(spt_for(&valid, &log_key)).await.unwrap();
        issuer
            .submit_request(&owner.build_request(&domain("b.example"), 1).unwrap())
            .await
            .unwrap();
        drop(issuer);

        let restored = Issuer::restore(PcaConfig::new("pca"), key, store).await.unwrap();
        assert!(restored.valid_certificate(&domain("a.example")).await.is_some());
        assert!(restored.presigned(&domain("b.example")).await.is_some());
        assert_eq!(restored.pending_submissions().await, 1);
        assert_eq!(restored.trusted_root().await.tree_size, 2);

        let next = restored
            .submit_request(&owner.build_request(&domain("c.example"), 1).unwrap())
            .await
            .unwrap();
        assert_eq!(next.serial_number, 3);
    }

    #[test]
    fn test_out_of_range_cool_off_is_rejected() {
        let config = PcaConfig::new("pca").with_cool_off(std::time::Duration::from_secs(u64::MAX));
        let result = Issuer::new(config, KeyPair::generate().unwrap(), Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(PcaError::InvalidConfig(_))));
    }
}
