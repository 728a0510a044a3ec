use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Error names that cross proc boundaries.
///
/// The name travels as-is inside a failed [`crate::CallResult`], so the
/// string form is part of the protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    ProcNotFound,
    Forbidden,
    Unauthorized,
    BadRequest,
    ValidationError,
    Conflict,
    Crash,
    InitFailure,
    ImportFailed,
    InstantiationFailed,
    CallFailed,
}

impl ErrorKind {
    /// Status used when an error of this kind is surfaced over HTTP.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound | ErrorKind::ProcNotFound => 404,
            ErrorKind::Forbidden => 403,
            ErrorKind::Unauthorized => 401,
            ErrorKind::BadRequest | ErrorKind::ValidationError => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Crash
            | ErrorKind::InitFailure
            | ErrorKind::ImportFailed
            | ErrorKind::InstantiationFailed
            | ErrorKind::CallFailed => 500,
        }
    }
}

/// An error as it arrives from another proc: just a name and a message.
///
/// Plants may return their own names (anything not in [`ErrorKind`]); those
/// are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            name: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_str(&self.name).ok()
    }

    pub fn http_status(&self) -> u16 {
        self.kind().map(|k| k.http_status()).unwrap_or(500)
    }
}
