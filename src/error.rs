/// 自定义错误类型
///
/// 会话内部的所有失败都以 ProxyError 的形式向上传播，
/// 由连接处理器在会话边界统一记录并终止该会话
use std::io;
use thiserror::Error;

/// 代理前端的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 客户端或上游连接的 I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP 协议错误（请求格式不正确等）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SOCKS 握手失败
    #[error("SOCKS handshake failed: {0}")]
    Socks(String),

    /// 没有规则匹配请求，或规则指向不存在的后端
    #[error("Routing error: {0}")]
    Routing(String),

    /// 请求体超过后端声明的上限
    #[error("Request body of {size} bytes exceeds backend limit of {limit} bytes")]
    BodyTooLarge { size: u64, limit: u64 },

    /// 伪造证书失败
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// TLS 握手或配置错误
    #[error("TLS error: {0}")]
    Tls(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 会话已关闭（读取被取消）
    #[error("Session {0} closed")]
    SessionClosed(u32),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建协议错误
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 创建 SOCKS 错误
    pub fn socks(msg: impl Into<String>) -> Self {
        Self::Socks(msg.into())
    }

    /// 创建路由错误
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// 创建证书错误
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 检查是否为路由错误
    pub fn is_routing(&self) -> bool {
        matches!(self, Self::Routing(_))
    }

    /// 检查是否为请求体超限
    pub fn is_body_too_large(&self) -> bool {
        matches!(self, Self::BodyTooLarge { .. })
    }

    /// 检查是否因会话关闭而中断
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed(_))
    }
}
