use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::render::RenderError;

pub type Result<T> = std::result::Result<T, TileliteError>;

#[derive(Debug, Error)]
pub enum TileliteError {
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid value {value:?} for option `{key}`: {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to encode response: {0}")]
    Encode(String),

    #[error("dispatch queue is closed")]
    QueueClosed,

    #[error("renderer initialization failed: {0}")]
    Renderer(#[from] RenderError),
}

impl TileliteError {
    pub(crate) fn invalid_option(key: &str, value: &str, reason: impl Into<String>) -> Self {
        TileliteError::InvalidOption {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
