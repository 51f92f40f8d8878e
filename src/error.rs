// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::formats::Digest;

/// Failures surfaced by the append pipeline.
///
/// Registry RPC failures are collapsed into `Network`; the transport may
/// retry idempotent requests underneath, but no retry loop exists here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported manifest: {0}")]
    UnsupportedManifest(String),

    #[error("no image matched the platform filter")]
    NoMatchingImage,

    #[error("registry request failed: {message}")]
    Network {
        status: Option<u16>,
        message: String,
    },

    #[error("unknown blob {0}")]
    BlobUnknown(Digest),

    #[error("blob commit returned digest {returned}, expected {expected}")]
    CorruptTransfer { expected: Digest, returned: Digest },

    #[error("malformed layer: {0}")]
    MalformedLayer(String),

    #[error("cannot apply patch: {0}")]
    InvalidPatch(String),

    #[error("interrupted")]
    Cancelled,

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            status: None,
            message: message.into(),
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, rep) => {
                let url = rep.get_url().to_owned();
                let body = rep.into_string().unwrap_or_default();
                let body = body.trim();
                let message = if body.is_empty() {
                    format!("{}: HTTP {}", url, code)
                } else {
                    format!("{}: HTTP {}: {:.512}", url, code, body)
                };
                Error::Network {
                    status: Some(code),
                    message,
                }
            }
            ureq::Error::Transport(err) => Error::network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Fatal(err.to_string())
    }
}
