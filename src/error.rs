use grow_wire::{ErrorKind, RemoteError};
use thiserror::Error;

pub type Result<T, E = GrowError> = std::result::Result<T, E>;

/// Every failure the runtime itself can produce.
///
/// Errors that crossed a proc boundary arrive as [`GrowError::Remote`] and
/// keep whatever name the remote side gave them.
#[derive(Debug, Error)]
pub enum GrowError {
    #[error("plant `{0}` not found")]
    PlantNotFound(String),

    #[error("method `{plant}.{method}()` not found")]
    MethodNotFound { plant: String, method: String },

    #[error("no proc hosts plant `{0}`")]
    ProcNotFound(String),

    #[error("communication secret rejected")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid field: {0}")]
    Validation(String),

    #[error("proc `{0}` crashed")]
    Crash(String),

    #[error("{plant}: {reason}")]
    InitFailure { plant: String, reason: String },

    #[error("plant `{0}` is not registered in the catalog")]
    ImportFailed(String),

    #[error("could not instantiate `{plant}`: {reason}")]
    InstantiationFailed { plant: String, reason: String },

    #[error("bridge call failed: {0}")]
    CallFailed(String),

    #[error("cyclic injection between plants: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("port to `{0}` is closed")]
    PortClosed(String),

    #[error("port `{0}` already has a message handler")]
    PortInUse(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GrowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GrowError::PlantNotFound(_) | GrowError::MethodNotFound { .. } => ErrorKind::NotFound,
            GrowError::ProcNotFound(_) => ErrorKind::ProcNotFound,
            GrowError::Forbidden => ErrorKind::Forbidden,
            GrowError::BadRequest(_) | GrowError::Json(_) => ErrorKind::BadRequest,
            GrowError::Validation(_) | GrowError::Config(_) => ErrorKind::ValidationError,
            GrowError::Crash(_) | GrowError::PortClosed(_) => ErrorKind::Crash,
            GrowError::InitFailure { .. } | GrowError::CyclicDependency(_) => ErrorKind::InitFailure,
            GrowError::ImportFailed(_) => ErrorKind::ImportFailed,
            GrowError::InstantiationFailed { .. } => ErrorKind::InstantiationFailed,
            GrowError::CallFailed(_) | GrowError::Io(_) => ErrorKind::CallFailed,
            GrowError::PortInUse(_) => ErrorKind::Conflict,
            GrowError::Remote(remote) => remote.kind().unwrap_or(ErrorKind::CallFailed),
        }
    }

    /// Name carried on the wire. Remote errors keep their original name.
    pub fn name(&self) -> String {
        match self {
            GrowError::Remote(remote) => remote.name.clone(),
            other => other.kind().to_string(),
        }
    }

    pub fn to_remote(&self) -> RemoteError {
        match self {
            GrowError::Remote(remote) => remote.clone(),
            other => RemoteError::new(other.kind(), other.to_string()),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            GrowError::Remote(remote) => remote.http_status(),
            other => other.kind().http_status(),
        }
    }

    /// Turns a plant's own error into its wire form.
    ///
    /// Runtime and remote errors keep their name; anything else a plant
    /// raised is reported under the generic name `error`.
    pub fn from_plant(err: &anyhow::Error) -> RemoteError {
        if let Some(remote) = err.downcast_ref::<RemoteError>() {
            return remote.clone();
        }
        if let Some(grow) = err.downcast_ref::<GrowError>() {
            return grow.to_remote();
        }
        RemoteError::named("error", format!("{err:#}"))
    }
}

impl From<reqwest::Error> for GrowError {
    fn from(err: reqwest::Error) -> Self {
        GrowError::CallFailed(err.to_string())
    }
}
