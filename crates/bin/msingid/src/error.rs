use msingi_core::{FrameError, MerkleError, SensorRangeError};
use thiserror::Error;

/// per-packet rejection; contained, counted, published, never fatal
#[derive(Error, Debug)]
pub enum Reject {
    #[error("{0}")]
    Frame(#[from] FrameError),

    #[error("{0}")]
    Range(#[from] SensorRangeError),

    #[error("stale timestamp: {age_s}s skew exceeds {max_skew_s}s")]
    Stale { age_s: i64, max_skew_s: u64 },

    #[error("commitment not registered")]
    Unregistered,

    #[error("enrollment rate limited for source {src_addr}")]
    EnrollmentRateLimited { src_addr: u16 },

    #[error("registry: {0}")]
    Registry(#[from] MerkleError),
}

impl Reject {
    /// short reason published on the event stream
    pub fn label(&self) -> &'static str {
        match self {
            Reject::Frame(_) => "frame",
            Reject::Range(_) => "range",
            Reject::Stale { .. } => "stale",
            Reject::Unregistered => "unregistered",
            Reject::EnrollmentRateLimited { .. } => "enrollment_rate_limited",
            Reject::Registry(_) => "registry",
        }
    }
}

/// nullifier store admission failures
#[derive(Error, Debug)]
pub enum SpendError {
    #[error("nullifier already spent for epoch {epoch}")]
    AlreadySpent { epoch: u64 },

    #[error("epoch {epoch} outside claim window [{min}, {max}]")]
    EpochOutOfWindow { epoch: u64, min: u64, max: u64 },

    #[error("store io: {0}")]
    Storage(#[from] std::io::Error),

    #[error("store corrupt at line {line}: {detail}")]
    Corrupt { line: usize, detail: String },
}

/// serial ingress failures; the port loop restarts on these
#[derive(Error, Debug)]
pub enum IngressError {
    #[error("serial io: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response to {cmd} within {timeout_ms} ms")]
    CommandTimeout { cmd: String, timeout_ms: u64 },

    #[error("{cmd} rejected: {response}")]
    CommandRejected { cmd: String, response: String },

    #[error("transport closed")]
    Eof,
}

#[derive(Error, Debug)]
pub enum ProverError {
    #[error("prover timeout after {0} ms")]
    Timeout(u64),

    #[error("prover transient: {0}")]
    Transient(String),

    #[error("prover permanent: {0}")]
    Permanent(String),
}

impl ProverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProverError::Timeout(_) | ProverError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("submit transient: {0}")]
    Transient(String),

    #[error("submit permanent: {0}")]
    Permanent(String),
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Transient(_))
    }
}

/// configuration problems; always rejected at startup, exit code 3
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("environment {key}={value} invalid: {detail}")]
    Env {
        key: &'static str,
        value: String,
        detail: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// wall clock ran backwards relative to restored state; startup-fatal
#[derive(Error, Debug)]
#[error("clock rollback: restored state stamped {stamped_ms} ms but now is {now_ms} ms")]
pub struct ClockRollback {
    pub stamped_ms: u64,
    pub now_ms: u64,
}

/// startup classification: corrupt state exits 2, anything else exits 1
pub trait MerkleErrorExt {
    fn is_corrupt(&self) -> bool;
}

impl MerkleErrorExt for MerkleError {
    fn is_corrupt(&self) -> bool {
        matches!(
            self,
            MerkleError::SnapshotCorrupt(_) | MerkleError::DepthMismatch { .. }
        )
    }
}
