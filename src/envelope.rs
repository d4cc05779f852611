//! Response framing.
//!
//! The ABI only transports "here are N bytes", so every response carries a one byte tag:
//!
//! | Offset | Ok     | Err                                      |
//! |--------|--------|------------------------------------------|
//! | 0      | `0x00` | `0x01`                                   |
//! | 1..    | payload| error kind code, then a UTF-8 message    |
//!
//! A zero-length response is never a success.

use std::fmt;

use crate::{Error, OwnedBuffer, Result};

const TAG_OK: u8 = 0x00;
const TAG_ERR: u8 = 0x01;

/// Category of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// The error code was not recognised.
    Unknown = 0,
    /// The request or method could not be read.
    InvalidRequest = 1,
    /// The service does not implement the method.
    UnknownMethod = 2,
    /// The receiving side is not running.
    NotStarted = 3,
    /// Nothing is there to answer the request.
    Unavailable = 4,
    /// The receiving side failed unexpectedly.
    Internal = 5,
    /// The operation itself failed.
    Application = 6,
}

impl ErrorKind {
    /// Wire code of the kind.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Kind for a wire code. Unrecognised codes map to [`ErrorKind::Unknown`].
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::InvalidRequest,
            2 => Self::UnknownMethod,
            3 => Self::NotStarted,
            4 => Self::Unavailable,
            5 => Self::Internal,
            6 => Self::Application,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::InvalidRequest => "invalid request",
            Self::UnknownMethod => "unknown method",
            Self::NotStarted => "not started",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
            Self::Application => "application",
        };
        f.write_str(s)
    }
}

/// An error one side of the boundary reports to the other inside a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct ServiceError {
    /// Category of the error.
    pub kind: ErrorKind,
    /// Human readable description.
    pub message: String,
}

impl ServiceError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The method is not implemented.
    pub fn unknown_method(method: &str) -> Self {
        Self::new(ErrorKind::UnknownMethod, format!("method `{method}` is not implemented"))
    }

    /// The operation failed.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Application, message)
    }

    /// Something went wrong that the caller cannot fix.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<Error> for ServiceError {
    fn from(err: Error) -> Self {
        match err {
            Error::Service(err) => err,
            Error::NullBuffer(_) => Self::new(ErrorKind::InvalidRequest, err.to_string()),
            Error::Revoked | Error::Reentrant { .. } => {
                Self::new(ErrorKind::Unavailable, err.to_string())
            }
            err => Self::internal(err.to_string()),
        }
    }
}

/// Encode a result as envelope bytes.
#[must_use]
pub fn encode(result: &std::result::Result<Vec<u8>, ServiceError>) -> Vec<u8> {
    match result {
        Ok(payload) => {
            let mut out = Vec::with_capacity(payload.len() + 1);
            out.push(TAG_OK);
            out.extend_from_slice(payload);
            out
        }
        Err(err) => {
            let mut out = Vec::with_capacity(err.message.len() + 2);
            out.push(TAG_ERR);
            out.push(err.kind.code());
            out.extend_from_slice(err.message.as_bytes());
            out
        }
    }
}

/// Encode a result straight into a C allocation ready to be handed over.
#[must_use]
pub fn encode_owned(result: &std::result::Result<Vec<u8>, ServiceError>) -> OwnedBuffer {
    OwnedBuffer::from_slice(&encode(result))
}

/// Decode envelope bytes, returning the payload of an `Ok` envelope.
///
/// # Errors
///
/// [`Error::EmptyResponse`] for no bytes, [`Error::MalformedResponse`] for an unknown tag or a
/// truncated error, and [`Error::Service`] for an `Err` envelope.
pub fn decode(bytes: &[u8]) -> Result<&[u8]> {
    match bytes.split_first() {
        None => Err(Error::EmptyResponse),
        Some((&TAG_OK, payload)) => Ok(payload),
        Some((&TAG_ERR, rest)) => {
            let (&code, message) = rest.split_first().ok_or_else(|| {
                Error::MalformedResponse("error response without a kind".to_string())
            })?;
            Err(ServiceError {
                kind: ErrorKind::from_code(code),
                message: String::from_utf8_lossy(message).into_owned(),
            }
            .into())
        }
        Some((tag, _)) => Err(Error::MalformedResponse(format!(
            "unknown response tag {tag:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_payload_may_be_empty() {
        let bytes = encode(&Ok(Vec::new()));
        assert_eq!(bytes, [TAG_OK]);
        assert_eq!(decode(&bytes).unwrap(), b"");
    }

    #[test]
    fn error_keeps_kind_and_message() {
        let bytes = encode(&Err(ServiceError::unknown_method("nope")));
        let Err(Error::Service(err)) = decode(&bytes) else {
            panic!("expected a service error");
        };
        assert_eq!(err.kind, ErrorKind::UnknownMethod);
        assert_eq!(err.message, "method `nope` is not implemented");
    }

    #[test]
    fn empty_response_is_an_error() {
        assert!(matches!(decode(&[]), Err(Error::EmptyResponse)));
    }

    #[test]
    fn malformed_responses_are_rejected() {
        assert!(matches!(decode(&[0x07, 1, 2]), Err(Error::MalformedResponse(_))));
        assert!(matches!(decode(&[TAG_ERR]), Err(Error::MalformedResponse(_))));
    }

    #[test]
    fn unrecognised_kind_decodes_as_unknown() {
        let Err(Error::Service(err)) = decode(&[TAG_ERR, 200, b'x']) else {
            panic!("expected a service error");
        };
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.message, "x");
    }

    #[test]
    fn null_buffers_become_invalid_requests() {
        let err = ServiceError::from(Error::NullBuffer(2));
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }
}
