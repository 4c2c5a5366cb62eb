// iSECTECH Security Integrations - Error Handling
// Typed error kinds for integration orchestration and event collection
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::collections::HashMap;
use std::fmt;

/// Result type alias for integration operations
pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Error type shared by the registry, manager, deployer and collectors
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrationError {
    /// Required field missing, empty, or out of range
    InvalidInput(String),

    /// Schema, security, or compliance validation failed
    ValidationFailed(String),

    /// Unknown integration ID or platform type
    NotFound(String),

    /// Duplicate registration or identifier
    AlreadyExists(String),

    /// Lock acquisition, buffer full, or deadline exceeded
    Timeout(String),

    /// The caller cancelled the operation
    Cancelled(String),

    /// Rate limiter refused the operation
    RateLimited(String),

    /// Transient unavailability of a remote dependency (connection refused, reset)
    Unavailable(String),

    /// Failure reported by a platform, producer, or other collaborator
    Dependency {
        /// Operation that was being performed
        operation: String,
        /// Underlying error, kept for classification
        source: Box<IntegrationError>,
    },

    /// Concurrent deployment cap reached
    CapacityExceeded(String),

    /// Invalid state transition (already running, paused, not running)
    Lifecycle(String),

    /// Configuration loading or validation errors
    Configuration(String),

    /// Serialization/deserialization errors
    Serialization(String),

    /// Internal logic errors
    Internal(String),
}

/// Error kind tag used for branching and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    ValidationFailed,
    NotFound,
    AlreadyExists,
    Timeout,
    Cancelled,
    RateLimited,
    Unavailable,
    DependencyFailure,
    CapacityExceeded,
    Lifecycle,
    Configuration,
    Serialization,
    Internal,
}

impl IntegrationError {
    /// Wrap a collaborator error with the operation that produced it
    pub fn dependency(operation: impl Into<String>, source: IntegrationError) -> Self {
        IntegrationError::Dependency {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Get the kind tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntegrationError::InvalidInput(_) => ErrorKind::InvalidInput,
            IntegrationError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            IntegrationError::NotFound(_) => ErrorKind::NotFound,
            IntegrationError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            IntegrationError::Timeout(_) => ErrorKind::Timeout,
            IntegrationError::Cancelled(_) => ErrorKind::Cancelled,
            IntegrationError::RateLimited(_) => ErrorKind::RateLimited,
            IntegrationError::Unavailable(_) => ErrorKind::Unavailable,
            IntegrationError::Dependency { .. } => ErrorKind::DependencyFailure,
            IntegrationError::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            IntegrationError::Lifecycle(_) => ErrorKind::Lifecycle,
            IntegrationError::Configuration(_) => ErrorKind::Configuration,
            IntegrationError::Serialization(_) => ErrorKind::Serialization,
            IntegrationError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Innermost error, following dependency wrappers
    pub fn root_cause(&self) -> &IntegrationError {
        match self {
            IntegrationError::Dependency { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether a caller may retry the failed operation.
    ///
    /// Dependency failures inherit the classification of the error they wrap.
    pub fn is_retryable(&self) -> bool {
        self.root_cause().kind().is_retryable()
    }
}

impl ErrorKind {
    /// Transient kinds that a retry loop may attempt again
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Cancelled | ErrorKind::RateLimited | ErrorKind::Unavailable
        )
    }
}

impl fmt::Display for IntegrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrationError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            IntegrationError::ValidationFailed(msg) => write!(f, "Validation failed: {}", msg),
            IntegrationError::NotFound(msg) => write!(f, "Not found: {}", msg),
            IntegrationError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            IntegrationError::Timeout(msg) => write!(f, "Timeout error: {}", msg),
            IntegrationError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            IntegrationError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            IntegrationError::Unavailable(msg) => write!(f, "Dependency unavailable: {}", msg),
            IntegrationError::Dependency { operation, source } => {
                write!(f, "Dependency failure during {}: {}", operation, source)
            }
            IntegrationError::CapacityExceeded(msg) => write!(f, "Capacity exceeded: {}", msg),
            IntegrationError::Lifecycle(msg) => write!(f, "Lifecycle error: {}", msg),
            IntegrationError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            IntegrationError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            IntegrationError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for IntegrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IntegrationError::Dependency { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// Conversion implementations for common error types
impl From<std::io::Error> for IntegrationError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => IntegrationError::Unavailable(err.to_string()),
            std::io::ErrorKind::TimedOut => IntegrationError::Timeout(err.to_string()),
            _ => IntegrationError::Internal(format!("I/O error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for IntegrationError {
    fn from(err: serde_json::Error) -> Self {
        IntegrationError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for IntegrationError {
    fn from(err: serde_yaml::Error) -> Self {
        IntegrationError::Serialization(format!("YAML error: {}", err))
    }
}

impl From<toml::de::Error> for IntegrationError {
    fn from(err: toml::de::Error) -> Self {
        IntegrationError::Configuration(format!("Invalid TOML: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for IntegrationError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        IntegrationError::Timeout(err.to_string())
    }
}

/// Error context for structured failure logging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component where the error occurred
    pub component: String,
    /// Operation that was being performed
    pub operation: String,
    /// Additional context information
    pub context: HashMap<String, String>,
    /// Timestamp when the error occurred
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(component: &str, operation: &str) -> Self {
        Self {
            component: component.to_string(),
            operation: operation.to_string(),
            context: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Add context information
    pub fn with_context(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    /// Emit the error with its context as a structured log record
    pub fn log(&self, error: &IntegrationError) {
        let entry = serde_json::json!({
            "component": self.component,
            "operation": self.operation,
            "error": error.to_string(),
            "kind": error.kind().to_string(),
            "retryable": error.is_retryable(),
            "timestamp": self.timestamp.to_rfc3339(),
            "context": self.context,
        });

        if error.is_retryable() {
            tracing::warn!("Retryable failure: {}", entry);
        } else {
            tracing::error!("Operation failed: {}", entry);
        }
    }
}

/// Utility macro for building errors from a format string
#[macro_export]
macro_rules! integration_error {
    ($variant:ident, $msg:expr) => {
        $crate::error::IntegrationError::$variant($msg.to_string())
    };
    ($variant:ident, $fmt:expr, $($arg:tt)*) => {
        $crate::error::IntegrationError::$variant(format!($fmt, $($arg)*))
    };
}
