/// 会话事件定义
///
/// 请求泵把客户端数据封装为事件交给后端，
/// 后端再通过会话的事件队列把响应以事件形式送回
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};

/// 会话标识
pub type SessionId = u32;

/// 会话事件（构造后不可变）
#[derive(Debug, Clone)]
pub struct Event {
    /// 所属会话
    pub session_id: SessionId,
    /// 事件内容
    pub payload: Payload,
}

/// 事件内容
#[derive(Debug, Clone)]
pub enum Payload {
    /// 打开原始隧道（SOCKS 目标地址）
    TunnelOpen { addr: String },
    /// HTTP 请求
    Request(HttpRequestEvent),
    /// 原始字节块
    Chunk(Bytes),
    /// HTTP 响应
    Response(HttpResponseEvent),
    /// 关闭隧道
    Close,
    /// 后端报告的错误
    Error { code: u32, reason: String },
}

impl Event {
    pub fn new(session_id: SessionId, payload: Payload) -> Self {
        Self {
            session_id,
            payload,
        }
    }

    pub fn tunnel_open(session_id: SessionId, addr: impl Into<String>) -> Self {
        Self::new(session_id, Payload::TunnelOpen { addr: addr.into() })
    }

    pub fn chunk(session_id: SessionId, content: impl Into<Bytes>) -> Self {
        Self::new(session_id, Payload::Chunk(content.into()))
    }

    pub fn close(session_id: SessionId) -> Self {
        Self::new(session_id, Payload::Close)
    }

    pub fn error(session_id: SessionId, code: u32, reason: impl Into<String>) -> Self {
        Self::new(
            session_id,
            Payload::Error {
                code,
                reason: reason.into(),
            },
        )
    }

    pub fn request(session_id: SessionId, request: HttpRequestEvent) -> Self {
        Self::new(session_id, Payload::Request(request))
    }

    pub fn response(session_id: SessionId, response: HttpResponseEvent) -> Self {
        Self::new(session_id, Payload::Response(response))
    }

    /// 事件类型名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self.payload {
            Payload::TunnelOpen { .. } => "tunnel-open",
            Payload::Request(_) => "request",
            Payload::Chunk(_) => "chunk",
            Payload::Response(_) => "response",
            Payload::Close => "close",
            Payload::Error { .. } => "error",
        }
    }
}

/// HTTP 请求事件
#[derive(Debug, Clone)]
pub struct HttpRequestEvent {
    /// 请求方法
    pub method: Method,
    /// 规范化后的目标 URL（CONNECT 为 host:port）
    pub url: String,
    /// 请求的目标主机（可能带端口）
    pub host: String,
    /// 请求头（已去除 Proxy-Connection）
    pub headers: HeaderMap,
    /// 已缓冲的请求体
    pub content: Bytes,
}

impl HttpRequestEvent {
    /// 是否为 CONNECT 请求
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// 请求体是否以 chunk 事件的形式流式发送
    pub fn is_streaming(&self) -> bool {
        self.headers
            .get(TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// 目标地址 host:port
    pub fn target(&self) -> String {
        if self.is_connect() {
            return self.url.clone();
        }
        match url::Url::parse(&self.url) {
            Ok(url) => {
                let host = url.host_str().unwrap_or(&self.host);
                let port = url.port_or_known_default().unwrap_or(80);
                if host.contains(':') && !host.starts_with('[') {
                    format!("[{}]:{}", host, port)
                } else {
                    format!("{}:{}", host, port)
                }
            }
            Err(_) => self.host.clone(),
        }
    }

    /// 请求使用的 scheme
    pub fn scheme(&self) -> &str {
        if self.url.starts_with("https://") {
            "https"
        } else {
            "http"
        }
    }

    /// 编码为发往源站的请求（origin-form 请求行）
    pub fn encode(&self) -> Bytes {
        let path = match url::Url::parse(&self.url) {
            Ok(url) if !self.is_connect() => {
                let mut path = url.path().to_string();
                if let Some(query) = url.query() {
                    path.push('?');
                    path.push_str(query);
                }
                path
            }
            _ => self.url.clone(),
        };

        let mut buf = BytesMut::with_capacity(256 + self.content.len());
        buf.put_slice(format!("{} {} HTTP/1.1\r\n", self.method, path).as_bytes());
        put_headers(&mut buf, &self.headers);
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.content);
        buf.freeze()
    }
}

/// HTTP 响应事件
#[derive(Debug, Clone)]
pub struct HttpResponseEvent {
    /// 状态码
    pub status: StatusCode,
    /// 响应头
    pub headers: HeaderMap,
    /// 响应体
    pub content: Bytes,
}

impl HttpResponseEvent {
    pub fn new(status: StatusCode, headers: HeaderMap, content: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            content: content.into(),
        }
    }

    /// 纯文本响应
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(status, headers, body.into())
    }

    /// 序列化为 HTTP/1.1 文本格式
    ///
    /// 未声明 Content-Length 且非 chunked 时按响应体长度补齐
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.content.len());
        buf.put_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason().unwrap_or("")
            )
            .as_bytes(),
        );
        put_headers(&mut buf, &self.headers);
        if !self.headers.contains_key(CONTENT_LENGTH)
            && !self.headers.contains_key(TRANSFER_ENCODING)
        {
            buf.put_slice(format!("content-length: {}\r\n", self.content.len()).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.content);
        buf.freeze()
    }
}

fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
}
