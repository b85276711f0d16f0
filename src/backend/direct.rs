use super::{Backend, Features};
use crate::config::BackendConfig;
use crate::event::{Event, HttpRequestEvent, HttpResponseEvent, Payload, SessionId};
use crate::routing::{split_host_port, HostPattern};
use crate::session::ProxySession;
use crate::stream::BoxedStream;
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// 上游读取缓冲区大小
const RELAY_BUFFER_SIZE: usize = 8192;

/// 上游 TCP keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// 会话当前使用的上游连接
struct Upstream {
    /// 连接标识（tunnel:host:port 或 scheme://host:port）
    key: String,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    relay: JoinHandle<()>,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

/// 直连后端：由本进程直接连接目标地址
pub struct DirectBackend {
    intercept: Vec<HostPattern>,
    features: Features,
    connect_timeout: Duration,
    tls: TlsConnector,
    upstreams: Mutex<HashMap<SessionId, Arc<Upstream>>>,
}

impl DirectBackend {
    pub fn new(intercept: Vec<HostPattern>, features: Features, connect_timeout: Duration) -> Self {
        Self {
            intercept,
            features,
            connect_timeout,
            tls: TlsConnector::from(native_client_config()),
            upstreams: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let intercept = config
            .intercept
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<HostPattern>>>()
            .with_context(|| format!("Backend '{}': invalid intercept pattern", config.name))?;

        Ok(Self::new(
            intercept,
            Features {
                max_request_body: config.max_request_body,
            },
            Duration::from_secs(config.connect_timeout_secs),
        ))
    }

    /// CONNECT 目标是否需要拦截
    pub fn should_intercept(&self, target: &str) -> bool {
        let (host, _) = split_host_port(target);
        self.intercept.iter().any(|p| p.matches(host))
    }

    /// 当前活跃的上游连接数
    pub fn active_upstreams(&self) -> usize {
        self.upstreams.lock().len()
    }

    async fn dial(&self, target: &str, use_tls: bool) -> Result<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| anyhow::anyhow!("Connect to {} timed out after {:?}", target, self.connect_timeout))?
            .with_context(|| format!("Failed to connect to {}", target))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on {}: {}", target, e);
        }

        if !use_tls {
            return Ok(Box::new(stream));
        }

        let (host, _) = split_host_port(target);
        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("Invalid TLS server name: {}", host))?;
        let tls_stream = self
            .tls
            .connect(server_name, stream)
            .await
            .with_context(|| format!("TLS handshake with {} failed", target))?;
        Ok(Box::new(tls_stream))
    }

    /// 安装新的上游连接，替换（并停止）旧连接
    fn install(&self, session: &Arc<ProxySession>, key: String, stream: BoxedStream) {
        let (reader, writer) = tokio::io::split(stream);
        let relay = tokio::spawn(relay_upstream(session.clone(), reader));
        let upstream = Arc::new(Upstream {
            key,
            writer: tokio::sync::Mutex::new(writer),
            relay,
        });
        self.upstreams.lock().insert(session.id(), upstream);
    }

    fn current(&self, id: SessionId) -> Option<Arc<Upstream>> {
        self.upstreams.lock().get(&id).cloned()
    }

    fn remove(&self, id: SessionId) -> Option<Arc<Upstream>> {
        self.upstreams.lock().remove(&id)
    }

    async fn write_upstream(&self, session: &Arc<ProxySession>, data: &[u8]) {
        let id = session.id();
        let Some(upstream) = self.current(id) else {
            debug!("Session:{} dropped {} bytes without upstream", id, data.len());
            return;
        };

        let result = {
            let mut writer = upstream.writer.lock().await;
            match writer.write_all(data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            warn!("Session:{} write to upstream {} failed: {}", id, upstream.key, e);
            self.remove(id);
            session.publish(Event::error(id, 502, format!("upstream write failed: {}", e)));
        }
    }

    async fn open_tunnel(&self, session: &Arc<ProxySession>, addr: &str) {
        let id = session.id();
        match self.dial(addr, false).await {
            Ok(stream) => {
                info!("Session:{} tunnel opened to {}", id, addr);
                session.set_hijacked(true);
                self.install(session, format!("tunnel:{}", addr), stream);
            }
            Err(e) => {
                warn!("Session:{} tunnel to {} failed: {:#}", id, addr, e);
                session.publish(Event::error(id, 502, e.to_string()));
            }
        }
    }

    async fn forward_request(&self, session: &Arc<ProxySession>, req: HttpRequestEvent) {
        let id = session.id();
        let target = req.target();
        let key = format!("{}://{}", req.scheme(), target);

        let reuse = self
            .current(id)
            .map(|upstream| upstream.key == key)
            .unwrap_or(false);
        if !reuse {
            match self.dial(&target, req.scheme() == "https").await {
                Ok(stream) => self.install(session, key, stream),
                Err(e) => {
                    warn!("Session:{} connect to {} failed: {:#}", id, target, e);
                    self.remove(id);
                    session.publish(Event::response(
                        id,
                        HttpResponseEvent::text(StatusCode::BAD_GATEWAY, format!("{:#}", e)),
                    ));
                    return;
                }
            }
        }

        self.write_upstream(session, &req.encode()).await;
    }
}

#[async_trait]
impl Backend for DirectBackend {
    async fn serve(&self, session: &Arc<ProxySession>, event: Event) {
        let id = session.id();
        match event.payload {
            Payload::TunnelOpen { addr } => self.open_tunnel(session, &addr).await,
            Payload::Request(req) if req.is_connect() => {
                if self.should_intercept(&req.url) {
                    info!("Session:{} intercepting TLS for {}", id, req.url);
                    session.set_ssl_hijacked(true);
                } else {
                    self.open_tunnel(session, &req.url).await;
                }
            }
            Payload::Request(req) => self.forward_request(session, req).await,
            Payload::Chunk(content) => self.write_upstream(session, &content).await,
            Payload::Close => {
                if let Some(upstream) = self.remove(id) {
                    debug!("Session:{} closing upstream {}", id, upstream.key);
                }
            }
            other => warn!("Session:{} unexpected event for direct backend: {:?}", id, other),
        }
    }

    fn features(&self) -> Features {
        self.features
    }
}

/// 把上游数据作为 chunk 事件送回会话，上游关闭时发送 close
async fn relay_upstream(session: Arc<ProxySession>, mut reader: ReadHalf<BoxedStream>) {
    let id = session.id();
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if !session.publish(Event::chunk(id, buf[..n].to_vec())) {
                    return;
                }
            }
            Err(e) => {
                debug!("Session:{} upstream read failed: {}", id, e);
                break;
            }
        }
    }
    session.publish(Event::close(id));
}

/// 使用系统 CA 的上游 TLS 配置
fn native_client_config() -> Arc<rustls::ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for err in &native_certs.errors {
        warn!("Failed to load a native certificate: {}", err);
    }
    for cert in native_certs.certs {
        root_store.add(cert).ok();
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}
