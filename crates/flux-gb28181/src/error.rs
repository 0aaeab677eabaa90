use thiserror::Error;

/// 对话关联字段缺失
///
/// 按提取顺序只报告第一个缺失的字段
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("Call-ID header missing in request")]
    MissingCallId,

    #[error("tag parameter missing in request From header")]
    MissingFromTag,

    #[error("tag parameter missing in response To header")]
    MissingToTag,

    #[error("branch parameter missing in request Via header")]
    MissingBranch,
}

#[derive(Error, Debug)]
pub enum GbError {
    /// 非法的 PTZ 方向或变倍组合
    #[error("Invalid PTZ command: {0}")]
    InvalidCommand(String),

    #[error("Dialog correlation failed: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(String),

    /// 同一通道已有进行中的点播
    #[error("Channel busy: {0}")]
    ChannelBusy(String),

    /// 设备返回了非 2xx 最终响应
    #[error("Request rejected by device: {status} {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout waiting for response: {0}")]
    Timeout(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// 缓存不可用
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Document error: {0}")]
    Document(String),

    #[error("Failed to parse SIP message: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GbError>;

impl GbError {
    pub fn transport(msg: impl Into<String>) -> Self {
        GbError::Transport(msg.into())
    }

    pub fn cache(msg: impl Into<String>) -> Self {
        GbError::Cache(msg.into())
    }
}
