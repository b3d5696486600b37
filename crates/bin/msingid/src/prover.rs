//! prover dispatch
//!
//! The external prover is an opaque HTTP endpoint: `prove` turns
//! assembled inputs into a proof (deriving the nullifier through its
//! trusted path to device material), `submit` settles it. Transient
//! failures retry with exponential backoff; a spend whose submission
//! ultimately fails stays spent and lands on the orphan ledger for the
//! operator.
//!
//! Mock mode synthesizes deterministic placeholders and labels every
//! observable field `is_mock`; config refuses to enable it outside
//! demo mode.

use crate::clock::Clock;
use crate::config::ProverCfg;
use crate::counters::Counters;
use crate::error::{ProverError, SubmitError};
use crate::events::{EventHub, EventKind};
use crate::store::NullifierStore;
use msingi_core::nullifier::SpendMode;
use msingi_core::{Hash, Nullifier};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DISPATCH_QUEUE_CAP: usize = 64;
pub const DISPATCH_WORKERS: usize = 2;
/// first retry delay; doubles per attempt
pub const BACKOFF_BASE_MS: u64 = 500;

/// public proof inputs before the prover derives the nullifier
#[derive(Clone, Debug, Serialize)]
pub struct ProofInputs {
    #[serde(with = "msingi_core::hex32")]
    pub data_hash: Hash,
    pub epoch: u64,
    #[serde(with = "msingi_core::hex32")]
    pub merkle_root: Hash,
}

/// what the settlement layer sees
#[derive(Clone, Debug, Serialize)]
pub struct PublicInputs {
    #[serde(with = "msingi_core::hex32")]
    pub nullifier: Hash,
    #[serde(with = "msingi_core::hex32")]
    pub data_hash: Hash,
    pub epoch: u64,
    #[serde(with = "msingi_core::hex32")]
    pub merkle_root: Hash,
}

/// private witness; intentionally not Debug, it never reaches a log line
#[derive(Clone, Serialize)]
pub struct Witness {
    #[serde(with = "msingi_core::hex32")]
    pub commitment: Hash,
    /// the server never observed the key; the prover fills these
    pub pk_placeholder: String,
    pub blinding_placeholder: String,
    pub siblings: Vec<String>,
    pub path_bits: Vec<bool>,
    /// 16 sensor bytes, little-endian, hex
    pub sensor_le: String,
    /// raw r||s as received from the wire
    pub signature: String,
    pub timestamp_s: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Proof {
    pub proof_b64: String,
    pub nullifier: String,
    pub is_mock: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub is_mock: bool,
}

#[derive(Clone)]
pub struct ProverClient {
    http: reqwest::Client,
    url: Option<String>,
    timeout_ms: u64,
    mock: bool,
}

impl ProverClient {
    pub fn new(cfg: &ProverCfg) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: cfg.url.clone(),
            timeout_ms: cfg.timeout_ms,
            mock: cfg.mock,
        }
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    pub async fn prove(
        &self,
        inputs: &ProofInputs,
        witness: &Witness,
    ) -> Result<Proof, ProverError> {
        if self.mock {
            return Ok(self.mock_prove(inputs, witness));
        }
        let url = self.endpoint("prove")?;
        let body = serde_json::json!({ "public": inputs, "witness": witness });
        let response = self
            .http
            .post(url)
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_prove(e))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ProverError::Transient(format!("prover returned {}", status)));
        }
        if !status.is_success() {
            return Err(ProverError::Permanent(format!("prover returned {}", status)));
        }
        response
            .json()
            .await
            .map_err(|e| ProverError::Permanent(format!("bad prover response: {}", e)))
    }

    pub async fn submit(
        &self,
        proof_b64: &str,
        public: &PublicInputs,
    ) -> Result<TxReceipt, SubmitError> {
        if self.mock {
            return Ok(self.mock_submit(public));
        }
        let url = self
            .endpoint("submit")
            .map_err(|e| SubmitError::Permanent(e.to_string()))?;
        let body = serde_json::json!({ "proof_b64": proof_b64, "public": public });
        let response = self
            .http
            .post(url)
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    SubmitError::Transient(e.to_string())
                } else {
                    SubmitError::Permanent(e.to_string())
                }
            })?;
        let status = response.status();
        if status.is_server_error() {
            return Err(SubmitError::Transient(format!(
                "submitter returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(SubmitError::Permanent(format!(
                "submitter returned {}",
                status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SubmitError::Permanent(format!("bad submit response: {}", e)))
    }

    fn endpoint(&self, path: &str) -> Result<String, ProverError> {
        let base = self
            .url
            .as_deref()
            .ok_or_else(|| ProverError::Permanent("prover url not configured".into()))?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), path))
    }

    fn classify_prove(&self, e: reqwest::Error) -> ProverError {
        if e.is_timeout() {
            ProverError::Timeout(self.timeout_ms)
        } else if e.is_connect() {
            ProverError::Transient(e.to_string())
        } else {
            ProverError::Permanent(e.to_string())
        }
    }

    /// deterministic placeholder proof; the commitment stands in for the
    /// device secret when deriving the mock nullifier
    fn mock_prove(&self, inputs: &ProofInputs, witness: &Witness) -> Proof {
        let nullifier =
            msingi_core::hash::nullifier_hash(&witness.commitment, inputs.epoch as u32);
        let mut hasher = Sha256::new();
        hasher.update(b"msingi:mock-proof:");
        hasher.update(inputs.data_hash);
        hasher.update(inputs.epoch.to_be_bytes());
        hasher.update(inputs.merkle_root);
        let digest: Hash = hasher.finalize().into();
        Proof {
            proof_b64: base64::engine::general_purpose::STANDARD.encode(digest),
            nullifier: hex::encode(nullifier),
            is_mock: true,
        }
    }

    fn mock_submit(&self, public: &PublicInputs) -> TxReceipt {
        let mut hasher = Sha256::new();
        hasher.update(b"msingi:mock-tx:");
        hasher.update(public.nullifier);
        hasher.update(public.epoch.to_be_bytes());
        let digest: Hash = hasher.finalize().into();
        TxReceipt {
            tx_hash: format!("0x{}", hex::encode(digest)),
            is_mock: true,
        }
    }
}

/// retry delay for attempt n (1-based)
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1).min(6))
}

/// a dispatch that exhausted its retries after the spend was recorded
#[derive(Clone, Debug, Serialize)]
pub struct Orphan {
    pub nullifier: String,
    pub epoch: u64,
    pub reason: String,
    pub at_ms: u64,
}

#[derive(Clone, Default)]
pub struct OrphanLedger(Arc<Mutex<Vec<Orphan>>>);

impl OrphanLedger {
    pub fn push(&self, orphan: Orphan) {
        warn!(
            "orphaned dispatch: {} epoch {}: {}",
            orphan.nullifier, orphan.epoch, orphan.reason
        );
        self.0.lock().unwrap().push(orphan);
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn list(&self) -> Vec<Orphan> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub enum DispatchJob {
    /// packet pipeline: prove, spend the returned nullifier, submit
    Auto {
        inputs: ProofInputs,
        witness: Witness,
    },
    /// claim flow: the spend already happened, submit only
    Manual {
        public: PublicInputs,
        proof_b64: String,
    },
}

// Witness is deliberately not Debug; keep the job's Debug from leaking it
impl std::fmt::Debug for Witness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Witness(..)")
    }
}

#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<DispatchJob>,
}

impl DispatcherHandle {
    /// hand a job to the workers; Err means the queue is full or closed
    pub fn enqueue(&self, job: DispatchJob) -> Result<(), DispatchJob> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => job,
            mpsc::error::TrySendError::Closed(job) => job,
        })
    }
}

pub struct Dispatcher {
    client: ProverClient,
    store: Arc<NullifierStore>,
    counters: Arc<Counters>,
    hub: EventHub,
    orphans: OrphanLedger,
    clock: Clock,
    max_attempts: u32,
    /// auto dispatches currently running, keyed by (commitment, epoch);
    /// the nullifier is not known until the prover answers, so this is
    /// the identity that serializes a contribution's dispatch
    in_flight: Mutex<HashSet<(Hash, u64)>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        client: ProverClient,
        store: Arc<NullifierStore>,
        counters: Arc<Counters>,
        hub: EventHub,
        orphans: OrphanLedger,
        clock: Clock,
        max_attempts: u32,
        shutdown: watch::Receiver<bool>,
    ) -> (DispatcherHandle, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_CAP);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let dispatcher = Arc::new(Dispatcher {
            client,
            store,
            counters,
            hub,
            orphans,
            clock,
            max_attempts,
            in_flight: Mutex::new(HashSet::new()),
        });

        let mut handles = Vec::with_capacity(DISPATCH_WORKERS);
        for worker in 0..DISPATCH_WORKERS {
            let dispatcher = dispatcher.clone();
            let rx = rx.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = shutdown.changed() => None,
                        }
                    };
                    match job {
                        Some(job) => dispatcher.process(job).await,
                        None => break,
                    }
                }
                debug!("dispatch worker {} stopped", worker);
            }));
        }

        (DispatcherHandle { tx }, handles)
    }

    async fn process(&self, job: DispatchJob) {
        match job {
            DispatchJob::Auto { inputs, witness } => self.process_auto(inputs, witness).await,
            DispatchJob::Manual { public, proof_b64 } => {
                self.process_manual(public, proof_b64).await
            }
        }
    }

    /// claim the dispatch slot for a contribution; false means another
    /// worker is already proving the same (commitment, epoch)
    fn begin_auto(&self, key: (Hash, u64)) -> bool {
        self.in_flight.lock().unwrap().insert(key)
    }

    fn finish_auto(&self, key: &(Hash, u64)) {
        self.in_flight.lock().unwrap().remove(key);
    }

    async fn process_auto(&self, inputs: ProofInputs, witness: Witness) {
        let key = (witness.commitment, inputs.epoch);
        if !self.begin_auto(key) {
            // a retransmitted reading; its dispatch is already running
            debug!(
                "contribution already dispatching for epoch {}, nothing to settle",
                inputs.epoch
            );
            return;
        }
        self.run_auto(inputs, witness).await;
        self.finish_auto(&key);
    }

    async fn run_auto(&self, inputs: ProofInputs, witness: Witness) {
        let proof = match self.prove_with_retry(&inputs, &witness).await {
            Ok(proof) => proof,
            Err(e) => {
                error!("prove failed for epoch {}: {}", inputs.epoch, e);
                self.hub.publish(EventKind::PacketError {
                    detail: format!("prove failed: {}", e),
                });
                return;
            }
        };

        let nullifier = match Nullifier::from_hex(&proof.nullifier) {
            Some(n) => n,
            None => {
                error!("prover returned malformed nullifier");
                self.hub.publish(EventKind::PacketError {
                    detail: "prover returned malformed nullifier".into(),
                });
                return;
            }
        };

        // the spend must be durable before the settlement dispatch
        match self
            .store
            .try_spend(nullifier, inputs.epoch, inputs.data_hash, SpendMode::Auto)
        {
            Ok(_) => {
                self.counters.nullifiers_spent.fetch_add(1, Ordering::Relaxed);
            }
            Err(crate::error::SpendError::AlreadySpent { .. }) => {
                // a replayed contribution; nothing to settle
                debug!("nullifier {} already spent for epoch {}", nullifier, inputs.epoch);
                return;
            }
            Err(e) => {
                error!("spend failed: {}", e);
                self.hub.publish(EventKind::PacketError {
                    detail: format!("spend failed: {}", e),
                });
                return;
            }
        }

        let public = PublicInputs {
            nullifier: nullifier.to_bytes(),
            data_hash: inputs.data_hash,
            epoch: inputs.epoch,
            merkle_root: inputs.merkle_root,
        };
        self.submit_and_report(&public, &proof.proof_b64).await;
    }

    async fn process_manual(&self, public: PublicInputs, proof_b64: String) {
        self.submit_and_report(&public, &proof_b64).await;
    }

    async fn prove_with_retry(
        &self,
        inputs: &ProofInputs,
        witness: &Witness,
    ) -> Result<Proof, ProverError> {
        let mut attempt = 1;
        loop {
            match self.client.prove(inputs, witness).await {
                Ok(proof) => return Ok(proof),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!("prove attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn submit_and_report(&self, public: &PublicInputs, proof_b64: &str) {
        let mut attempt = 1;
        let receipt = loop {
            match self.client.submit(proof_b64, public).await {
                Ok(receipt) => break receipt,
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "submit attempt {}/{} failed: {}",
                        attempt, self.max_attempts, e
                    );
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    // spend stays recorded; flag for the operator
                    self.orphans.push(Orphan {
                        nullifier: hex::encode(public.nullifier),
                        epoch: public.epoch,
                        reason: e.to_string(),
                        at_ms: self.clock.now_ms(),
                    });
                    return;
                }
            }
        };

        let now_ms = self.clock.now_ms();
        self.counters.proofs_generated.fetch_add(1, Ordering::Relaxed);
        self.counters.last_proof_ms.store(now_ms, Ordering::Relaxed);
        info!(
            "proof submitted for epoch {}: tx {}{}",
            public.epoch,
            &receipt.tx_hash[..receipt.tx_hash.len().min(18)],
            if receipt.is_mock { " (mock)" } else { "" }
        );
        self.hub.publish(EventKind::ProofSubmitted {
            nullifier: hex::encode(public.nullifier),
            epoch: public.epoch,
            tx_hash: receipt.tx_hash,
            is_mock: receipt.is_mock,
        });
    }
}
