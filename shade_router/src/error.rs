// Error taxonomy for the router.
//
// Transport and handshake failures end the connection; validation failures
// are answered with `BadRequest` and the connection stays open. Policy
// rejections (spam gate, mutes) and lookup misses never become errors at
// all: the command handlers turn them into silent no-ops so a hostile peer
// learns nothing about why a request went nowhere.

use std::io;

use shade_protocol::{CryptoError, Status};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid request: {0}")]
    Invalid(&'static str),

    #[error("could not allocate a unique session id")]
    DuplicateSession,

    #[error("unknown session")]
    UnknownSession,

    #[error("router does not relay transfers")]
    NotTransferCapable,

    #[error("config: {0}")]
    Config(String),
}

impl RouterError {
    /// The status a client sees for this error.
    pub fn status(&self) -> Status {
        match self {
            RouterError::Invalid(_) => Status::BadRequest,
            RouterError::NotTransferCapable => Status::NotImplemented,
            RouterError::UnknownSession
            | RouterError::Codec(_)
            | RouterError::Crypto(_)
            | RouterError::DuplicateSession => Status::Unauthorized,
            RouterError::Io(_) | RouterError::Config(_) => Status::NotFound,
        }
    }

    /// Whether the connection survives this error.
    pub fn keeps_connection(&self) -> bool {
        matches!(self, RouterError::Invalid(_))
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_keep_the_connection() {
        let err = RouterError::Invalid("origin");
        assert_eq!(err.status(), Status::BadRequest);
        assert!(err.keeps_connection());
    }

    #[test]
    fn transport_errors_close() {
        let err = RouterError::from(CryptoError::Decrypt);
        assert_eq!(err.status(), Status::Unauthorized);
        assert!(!err.keeps_connection());
        assert_eq!(
            RouterError::NotTransferCapable.status(),
            Status::NotImplemented
        );
    }
}
