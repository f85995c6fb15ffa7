use thiserror::Error;

/// The full error taxonomy for the sync engine.
///
/// No variant here is allowed to crash the daemon loop (see `scheduler.rs`);
/// only one-shot CLI invocations turn these into a nonzero exit code.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Lizenz ungültig oder abgelaufen")]
    LicenseInvalid,

    #[error("Device-ID stimmt nicht überein")]
    DeviceMismatch,

    #[error("Lizenzschlüssel stimmt nicht überein")]
    KeyMismatch,

    #[error("Lizenz abgelaufen")]
    Expired,

    #[error("Sync in Lizenz nicht freigeschaltet")]
    FeatureDisabled,

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("server rejected request: HTTP {status}: {message}")]
    ServerRejection { status: u16, message: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("remote row could not be applied to local schema: {0}")]
    SchemaMismatch(String),

    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
