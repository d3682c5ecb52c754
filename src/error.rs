use thiserror::Error;

/// Failures talking to the remote collection service.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("transport error calling {path}: {source}")]
    Transport {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} answered HTTP {status}")]
    Status { path: &'static str, status: reqwest::StatusCode },

    #[error("could not decode {path} response: {source}")]
    Decode {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned an empty body")]
    EmptyArtifact { path: &'static str },
}

impl CollectorError {
    /// Whether the collector could not be reached at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, CollectorError::Transport { .. })
    }
}
