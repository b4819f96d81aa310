use std::io;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failures surfaced by the client.
///
/// Every variant is caught at the reconciler boundary and converted into a
/// terminal failed record; the UI only ever reads the persisted
/// `status`/`error` fields and needs no classification logic of its own.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure reaching the job service.
    #[error("cannot connect to server")]
    Network(#[source] reqwest::Error),

    /// The service rejected the request payload. The detail is the
    /// service-provided message, reported verbatim.
    #[error("{detail}")]
    Validation { detail: String },

    /// The polled job id is unknown to the service. Terminal.
    #[error("job not found: {job_id}")]
    NotFound { job_id: String },

    /// No status update observed within the staleness window.
    #[error("server is not responding")]
    Staleness,

    /// The service answered with a body the client could not interpret.
    #[error("malformed response from server: {reason}")]
    MalformedResponse { reason: String },

    /// State store I/O failure.
    #[error("state store: {context}")]
    Store {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// State store (de)serialization failure.
    #[error("state store serialization failed")]
    StoreSerialization(#[from] serde_json::Error),
}

impl ClientError {
    pub(crate) fn store(context: &'static str, source: io::Error) -> Self {
        Self::Store { context, source }
    }
}
