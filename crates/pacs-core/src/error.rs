//! 错误定义模块

use thiserror::Error;

/// PACS网络层统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("网络连接错误: {0}")]
    Connectivity(String),

    #[error("请求超时: {0}")]
    Timeout(String),

    #[error("认证失败 (HTTP {status}): {message}")]
    Authentication { status: u16, message: String },

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("HTTP错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("操作已取消")]
    Cancelled,

    /// 本地组件未运行或已关闭，与远端连接无关
    #[error("服务不可用: {0}")]
    Unavailable(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// 错误分类
///
/// 决定失败是否可以重试，以及是否终止所属的操作。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 超时、DNS/TCP失败，可重试
    Connectivity,
    /// 401/403，刷新凭据之前不可重试
    Authentication,
    /// 404，对单个对象是终止性的，不影响所属任务
    NotFound,
    /// 响应体格式错误、不支持的SOP类
    Protocol,
    Other,
}

impl PacsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity(_) | Self::Timeout(_) => ErrorKind::Connectivity,
            Self::Io(e) if is_transient_io(e) => ErrorKind::Connectivity,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::Protocol,
            Self::Http { status, .. } if *status >= 500 => ErrorKind::Connectivity,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    /// 错误是否应计入连接的错误统计
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Unavailable(_))
    }

    /// 根据HTTP状态码构造错误
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Authentication { status, message },
            404 => Self::NotFound(message),
            _ => Self::Http { status, message },
        }
    }
}

fn is_transient_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind as Io;
    matches!(
        e.kind(),
        Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::TimedOut
            | Io::BrokenPipe
    )
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
