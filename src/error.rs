use thiserror::Error;

/// Errors surfaced by the background. The `Display` text is what crosses a
/// port as the `error` field of a response frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    #[error("Unknown connection from {0}")]
    UnknownConnection(String),
    #[error("Connection with {0} is not open")]
    PortNotConnected(String),
    #[error("The source {0} has not been authorized for this account")]
    OriginNotAuthorized(String),
    #[error("Unable to find request with id {0}")]
    RequestNotFound(String),
    #[error("{0}")]
    InvalidPassword(String),
    #[error("Invalid seed or derivation path: {0}")]
    InvalidSeedOrPath(String),
    #[error("\"{0}\" is not a valid derivation path")]
    InvalidDerivationPath(String),
    #[error("Embedded passwords (///) are not supported in derivation paths")]
    UnsupportedDerivationSyntax,
    #[error("Soft derivation paths are not allowed on {0}")]
    UnsupportedSoftDerivation(String),
    #[error("Unable to find account {0}")]
    AccountNotFound(String),
    #[error("Account {0} already exists")]
    AccountExists(String),
    #[error("Account {0} is external and cannot sign with a password")]
    ExternalAccount(String),
    #[error("Unsupported signed extension {0}")]
    UnsupportedSignedExtension(String),
    #[error("Stored value under {0} does not match its schema")]
    SchemaValidationFailure(String),
    #[error("{0}")]
    Rejected(String),
    #[error("Unable to handle message of type {0}")]
    UnknownMessage(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl ExtensionError {
    pub fn invalid_password() -> Self {
        ExtensionError::InvalidPassword("invalid password".to_string())
    }

    pub fn cancelled() -> Self {
        ExtensionError::Rejected("Cancelled".to_string())
    }
}

impl From<serde_json::Error> for ExtensionError {
    fn from(err: serde_json::Error) -> Self {
        ExtensionError::InvalidRequest(err.to_string())
    }
}

impl From<sled::Error> for ExtensionError {
    fn from(err: sled::Error) -> Self {
        ExtensionError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for ExtensionError {
    fn from(err: std::io::Error) -> Self {
        ExtensionError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExtensionError>;
