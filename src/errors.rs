use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FulcrumError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(fulcrum::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(fulcrum::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(fulcrum::serde))]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    #[diagnostic(code(fulcrum::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(fulcrum::jose))]
    Jose(String),

    #[error("{0}")]
    #[diagnostic(code(fulcrum::other))]
    Other(String),
}

impl From<josekit::JoseError> for FulcrumError {
    fn from(value: josekit::JoseError) -> Self {
        FulcrumError::Jose(value.to_string())
    }
}

/// Failures of the device authorization state machine that are not protocol
/// outcomes. Token-endpoint outcomes (`authorization_pending`, `slow_down`, ...)
/// are values, see [`crate::device::endpoint::TokenErrorCode`].
#[derive(Debug, Error, Diagnostic)]
pub enum DeviceFlowError {
    #[error("Device authorization already has a conflicting decision")]
    #[diagnostic(
        code(fulcrum::device::conflict),
        help("An approved request cannot be denied and a denied request cannot be approved")
    )]
    Conflict,

    #[error("Device authorization is no longer pending")]
    #[diagnostic(code(fulcrum::device::not_pending))]
    NotPending,

    #[error("Could not allocate a unique user_code after {attempts} attempts")]
    #[diagnostic(
        code(fulcrum::device::code_space_exhausted),
        help("Run the reclamation job or raise device.code_generation_attempts")
    )]
    CodeSpaceExhausted { attempts: u32 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] FulcrumError),
}

impl From<sea_orm::DbErr> for DeviceFlowError {
    fn from(value: sea_orm::DbErr) -> Self {
        DeviceFlowError::Storage(FulcrumError::Db(value))
    }
}
