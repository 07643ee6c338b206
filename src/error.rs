//! Error handling for the telemetry agent.

/// A specialized `Result` type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// The main error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sensor or counter reading could not be parsed
    #[error("Failed to parse reading: {0}")]
    ParseError(String),

    /// Radio driver reported a failure
    #[error("Radio error: {0}")]
    Radio(String),

    /// A hardware sensor could not be read
    #[error("Sensor error: {0}")]
    Sensor(String),

    /// Allocation failed; recoverable by a collection pass
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Publish transport error
    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Initial link or transport bring-up failed
    #[error("Initialization failed: {0}")]
    Init(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A loop iteration panicked
    #[error("Iteration panicked: {0}")]
    Panic(String),
}

impl AgentError {
    /// Create a new parse error
    pub fn parse_error(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a new radio error
    pub fn radio_error(msg: impl Into<String>) -> Self {
        Self::Radio(msg.into())
    }

    /// Create a new sensor error
    pub fn sensor_error(msg: impl Into<String>) -> Self {
        Self::Sensor(msg.into())
    }

    /// Create a new out-of-memory error
    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// Create a new initialization error
    pub fn init_error(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    /// Create a new configuration error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        Self::Panic(panic_message(payload))
    }

    /// Whether this error is handled by reclaiming memory rather than tearing down connections.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }
}

/// Text carried by a panic payload, when it is a string.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
