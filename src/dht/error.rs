use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("message missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}`: {reason}")]
    TypeMismatch {
        field: &'static str,
        reason: &'static str,
    },

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("info hash must be 20 bytes (40 hex characters)")]
    InvalidInfoHash,

    #[error("endpoint port must be nonzero")]
    InvalidEndpoint,

    #[error("bucket size {0} out of range 1..=100")]
    InvalidBucketSize(usize),

    #[error("bind failed on port {port} and on an ephemeral port: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("bootstrap failed: no bootstrap node reachable")]
    BootstrapFailed,
}

impl DhtError {
    /// True for a field that was present but of the wrong kind or length;
    /// everything else parse-related counts as malformed.
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, DhtError::TypeMismatch { .. })
    }
}
