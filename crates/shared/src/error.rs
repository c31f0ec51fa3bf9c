use serde::{Deserialize, Serialize};

/// The kind of entity a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Session,
    Message,
    Plugin,
    Tool,
    Server,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Session => "Session",
            Self::Message => "Message",
            Self::Plugin => "Plugin",
            Self::Tool => "Tool",
            Self::Server => "Server",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationErrorKind {
    SizeExceeded,
    UnsupportedFormat,
    Empty,
    Malformed,
}

/// A single content-unit validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind:?} on '{field}': {message}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn size_exceeded(field: &str, limit: usize, actual: usize) -> Self {
        Self {
            kind: ValidationErrorKind::SizeExceeded,
            field: field.to_string(),
            message: format!("{} exceeds the limit of {} (got {})", field, limit, actual),
        }
    }

    pub fn unsupported_format(field: &str, format: &str, allowed: &[&str]) -> Self {
        Self {
            kind: ValidationErrorKind::UnsupportedFormat,
            field: field.to_string(),
            message: format!("format '{}' is not supported (allowed: {})", format, allowed.join(", ")),
        }
    }

    pub fn empty(field: &str) -> Self {
        Self {
            kind: ValidationErrorKind::Empty,
            field: field.to_string(),
            message: format!("{} must not be empty", field),
        }
    }

    pub fn malformed(field: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ValidationErrorKind::Malformed,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum KoraError {
    #[error("Unauthenticated: no user context available")]
    Unauthenticated,
    #[error("{kind} not found: {id}")]
    NotFound { kind: ResourceKind, id: String },
    #[error("Duplicate id: {0}")]
    DuplicateId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Validation error: {0}")]
    Validation(ValidationError),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Timeout occurred: {0}")]
    Timeout(String),
    #[error("Plugin '{0}' is not active")]
    NotActive(String),
    #[error("Plugin '{0}' is in error state")]
    PluginInErrorState(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KoraError {
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable machine-readable code, used as `ToolError.code`.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::NotFound { .. } => "NotFound",
            Self::DuplicateId(_) => "DuplicateId",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Validation(_) => "ValidationError",
            Self::Connection(_) => "ConnectionError",
            Self::ToolNotFound(_) => "ToolNotFound",
            Self::Timeout(_) => "TIMEOUT",
            Self::NotActive(_) => "NotActive",
            Self::PluginInErrorState(_) => "PluginInErrorState",
            Self::Execution(_) => "ExecutionError",
            Self::Persistence(_) => "PersistenceError",
            Self::Internal(_) => "InternalError",
        }
    }
}

impl From<ValidationError> for KoraError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

pub type KoraResult<T> = std::result::Result<T, KoraError>;
