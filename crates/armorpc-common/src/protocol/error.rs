use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS verification failed: {0}")]
    TlsVerification(String),

    #[error("connection pool exhausted after {0}ms")]
    PoolExhausted(u64),

    #[error("connection pool is shut down")]
    PoolClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server fault {code}: {message}")]
    Fault {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether this is a well-formed error reported by the remote
    /// application, as opposed to a failure of the channel itself.
    pub fn is_fault(&self) -> bool {
        matches!(self, RpcError::Fault { .. })
    }

    pub fn fault_code(&self) -> Option<i64> {
        match self {
            RpcError::Fault { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the connection this error occurred on must not be reused.
    pub fn marks_unhealthy(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::Io(_) | RpcError::TlsVerification(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
