use thiserror::Error;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const UNAUTHORIZED: i32 = -32001;
pub const NOT_INITIALIZED: i32 = -32002;
pub const RATE_LIMITED: i32 = -32003;
pub const TOOL_EXECUTION_FAILED: i32 = -32005;
pub const SERVICE_UNAVAILABLE: i32 = -32006;

/// Every failure a client can observe on the wire.
///
/// Messages are client-facing: they must never carry credentials or
/// internal details such as panic payloads.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Unknown tool: {0}")]
    ToolNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Server not initialized")]
    NotInitialized,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl McpError {
    pub fn code(&self) -> i32 {
        match self {
            McpError::Parse(_) => PARSE_ERROR,
            McpError::InvalidRequest(_) => INVALID_REQUEST,
            McpError::MethodNotFound(_) | McpError::ToolNotFound(_) => METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => INVALID_PARAMS,
            McpError::NotInitialized => NOT_INITIALIZED,
            McpError::Unauthorized(_) => UNAUTHORIZED,
            McpError::RateLimited { .. } => RATE_LIMITED,
            McpError::ToolExecutionFailed(_) => TOOL_EXECUTION_FAILED,
            McpError::ServiceUnavailable(_) => SERVICE_UNAVAILABLE,
            McpError::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Structured payload attached to the error object, if any.
    pub fn data(&self) -> Option<serde_json::Value> {
        match self {
            McpError::RateLimited { retry_after_secs } => {
                Some(serde_json::json!({ "retry_after_secs": retry_after_secs }))
            }
            _ => None,
        }
    }

    /// Tool-level failures are counted as errors by the metrics collector;
    /// gatekeeping rejections are tracked separately.
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            McpError::ToolExecutionFailed(_) | McpError::ServiceUnavailable(_) | McpError::Internal(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, McpError>;
