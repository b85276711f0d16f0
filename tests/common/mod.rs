//! Common utilities for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use split_tunnel::backend::{Backend, BackendRegistry, Features};
use split_tunnel::config::{ListenerConfig, RuleConfig};
use split_tunnel::event::{Event, HttpResponseEvent, Payload};
use split_tunnel::mitm::CertProvider;
use split_tunnel::server::ProxyServer;
use split_tunnel::session::ProxySession;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// 测试后端的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 对普通请求回复 200，CONNECT 不做处理
    Respond,
    /// 隧道：TunnelOpen / CONNECT 标记 hijacked，chunk 原样回显
    Tunnel,
    /// CONNECT 标记 ssl_hijacked，普通请求回复 200
    Intercept,
    /// 收到请求后立即发送 close
    CloseOnRequest,
}

/// 记录收到的所有事件的后端
pub struct RecordingBackend {
    mode: Mode,
    features: Features,
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl RecordingBackend {
    pub fn new(mode: Mode) -> Arc<Self> {
        Self::with_limit(mode, -1)
    }

    pub fn with_limit(mode: Mode, max_request_body: i64) -> Arc<Self> {
        Arc::new(Self {
            mode,
            features: Features { max_request_body },
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }

    /// 等待至少 count 个事件
    pub async fn wait_for(&self, count: usize, wait: Duration) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return events;
            }
            let _ = timeout(remaining, self.notify.notified()).await;
        }
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn serve(&self, session: &Arc<ProxySession>, event: Event) {
        let id = session.id();
        match (&self.mode, &event.payload) {
            (Mode::Respond | Mode::Intercept, Payload::Request(req)) if !req.is_connect() => {
                let body = format!("{} {} {}", req.method, req.url, req.content.len());
                session.publish(Event::response(id, HttpResponseEvent::text(StatusCode::OK, body)));
            }
            (Mode::Intercept, Payload::Request(_)) => session.set_ssl_hijacked(true),
            (Mode::Tunnel, Payload::TunnelOpen { .. }) => session.set_hijacked(true),
            (Mode::Tunnel, Payload::Request(req)) if req.is_connect() => session.set_hijacked(true),
            (Mode::Tunnel, Payload::Chunk(data)) => {
                session.publish(Event::chunk(id, data.clone()));
            }
            (Mode::CloseOnRequest, Payload::Request(_)) => {
                session.publish(Event::close(id));
            }
            _ => {}
        }

        self.events.lock().push(event);
        self.notify.notify_one();
    }

    fn features(&self) -> Features {
        self.features
    }
}

/// 单条规则：hosts 为空时匹配所有主机
pub fn rule(hosts: &[&str], backend: &str) -> RuleConfig {
    RuleConfig {
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        methods: vec![],
        backend: backend.to_string(),
    }
}

/// 在随机端口上启动代理
pub async fn start_proxy(
    backends: Vec<(&str, Arc<dyn Backend>)>,
    rules: Vec<RuleConfig>,
    certs: Option<Arc<dyn CertProvider>>,
) -> (ProxyServer, SocketAddr) {
    let mut registry = BackendRegistry::new();
    for (name, backend) in backends {
        registry.register(name, backend).unwrap();
    }

    let server = ProxyServer::new(Arc::new(registry), certs);
    server
        .start(&[ListenerConfig {
            local: "127.0.0.1:0".to_string(),
            rules,
        }])
        .await
        .expect("Failed to start proxy");
    let addr = server.local_addrs()[0];
    (server, addr)
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// 先发言的服务端：连接建立即发送 greeting，之后回显
pub async fn start_greeting_server(greeting: &'static [u8]) -> SocketAddr {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind greeting server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if socket.write_all(greeting).await.is_err() {
                    return;
                }
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// 返回固定响应的 HTTP 源站，请求行通过通道回报
pub async fn start_http_origin(body: &'static str) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind origin server");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut reader = tokio::io::BufReader::new(socket);
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).await.is_err() {
                    return;
                }
                // 跳过请求头
                loop {
                    let mut line = String::new();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) if line == "\r\n" => break,
                        Ok(_) => {}
                    }
                }
                let _ = tx.send(request_line.trim_end().to_string());

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let mut socket = reader.into_inner();
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, rx)
}

/// 读取一个 HTTP 响应（依赖 Content-Length），返回状态码和响应体
pub async fn read_response<R>(reader: &mut R) -> (u16, Vec<u8>)
where
    R: AsyncBufRead + Unpin,
{
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await.unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line {:?}", status_line));

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line == "\r\n" || line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap();
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.unwrap();
    (status, body)
}

/// 读取直到对端关闭，返回读到的字节
pub async fn read_until_closed<R>(stream: &mut R, wait: Duration) -> Result<Vec<u8>, String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    match timeout(wait, stream.read_to_end(&mut buf)).await {
        Ok(Ok(_)) => Ok(buf),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => Ok(buf),
        Ok(Err(e)) => Err(format!("read failed: {}", e)),
        Err(_) => Err("Timeout waiting for connection close".to_string()),
    }
}

/// 信任指定 CA 的 TLS 连接器
pub fn tls_connector(ca_pem: &str) -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// 连接代理
pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr)
        .await
        .expect("Failed to connect to proxy")
}
