/// 客户端连接处理
///
/// 每个连接由两个循环驱动：
/// - 请求泵：读取客户端数据，解析成事件交给后端
/// - 消费循环：从会话事件队列读取后端的事件，写回客户端
///
/// 连接开始时探测一次协议（SOCKS 或 HTTP 代理），HTTP 代理模式下
/// CONNECT 请求可以把连接切换为原始隧道或本地终结的 TLS
use crate::error::{ProxyError, Result};
use crate::event::{Event, HttpRequestEvent, Payload, SessionId};
use crate::mitm::CertProvider;
use crate::queue::{EventQueue, QueueError, POLL_INTERVAL};
use crate::routing::{split_host_port, RouteRequest, Router};
use crate::session::{BackendBinding, ProxySession, SessionState};
use crate::socks::{self, SocksVersion};
use crate::stream::{BoxedStream, Rewind};
use crate::wire::{self, BodyKind, BodyReader, RequestHead};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::HeaderValue;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// 客户端读取缓冲区大小
pub const READ_BUFFER_SIZE: usize = 8192;

/// CONNECT 成功后发给客户端的应答
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// TLS 拦截握手超时
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type ClientReader = BufReader<ReadHalf<BoxedStream>>;

/// 连接处理所需的共享组件（每个监听端点一份）
pub struct ConnContext {
    pub router: Router,
    /// TLS 拦截证书，未配置时拦截请求会终止会话
    pub certs: Option<Arc<dyn CertProvider>>,
}

impl ConnContext {
    pub fn new(router: Router, certs: Option<Arc<dyn CertProvider>>) -> Self {
        Self { router, certs }
    }
}

impl std::fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnContext")
            .field("router", &self.router)
            .field("certs", &self.certs.is_some())
            .finish()
    }
}

/// 客户端连接的写端
///
/// 消费循环、CONNECT 应答和 TLS 升级共用同一个写端；
/// 关闭后写端被移除，之后的写入全部失败
#[derive(Clone)]
pub struct ClientWriter {
    inner: Arc<Mutex<Option<WriteHalf<BoxedStream>>>>,
}

impl ClientWriter {
    fn new(writer: WriteHalf<BoxedStream>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut slot = self.inner.lock().await;
        match slot.as_mut() {
            Some(writer) => {
                writer.write_all(data).await?;
                writer.flush().await
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "client connection closed",
            )),
        }
    }

    /// 关闭并释放写端
    pub async fn shutdown(&self) {
        let writer = self.inner.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// 处理一个客户端连接直到会话结束
pub async fn serve_proxy_conn(
    stream: BoxedStream,
    id: SessionId,
    ctx: Arc<ConnContext>,
) -> Result<()> {
    let (session, queue) = ProxySession::new(id);
    let mut buffered = BufReader::with_capacity(READ_BUFFER_SIZE, stream);

    // 协议探测：只窥视第一个字节，不消费
    let first = match buffered.fill_buf().await {
        Ok([]) => {
            debug!("Session:{} closed before sending any data", id);
            session.close();
            return Ok(());
        }
        Ok(buf) => buf[0],
        Err(e) => {
            session.close();
            return Err(e.into());
        }
    };

    let socks_target = match SocksVersion::detect(first) {
        Some(version) => match socks_handshake(&session, &mut buffered, version).await {
            Ok(target) => Some(target),
            Err(e) => {
                session.close();
                return Err(e);
            }
        },
        None => {
            session.set_state(SessionState::HttpProxy);
            None
        }
    };

    // 探测时缓冲的字节需要回放给后续读取
    let leftover = Bytes::copy_from_slice(buffered.buffer());
    let inner = buffered.into_inner();
    let stream: BoxedStream = if leftover.is_empty() {
        inner
    } else {
        Box::new(Rewind::new(leftover, inner))
    };
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::with_capacity(READ_BUFFER_SIZE, read_half);
    let writer = ClientWriter::new(write_half);

    let consumer = tokio::spawn(consume_events(session.clone(), queue, writer.clone()));

    let result = match socks_target {
        Some(target) => pump_socks(&session, &ctx, reader, &target).await,
        None => pump_http(&session, &ctx, reader, &writer).await,
    };

    teardown(&session, &writer).await;
    if let Err(e) = consumer.await {
        warn!("Session:{} consumer task failed: {}", id, e);
    }

    match result {
        Err(e) if e.is_session_closed() => Ok(()),
        other => other,
    }
}

async fn socks_handshake(
    session: &ProxySession,
    stream: &mut BufReader<BoxedStream>,
    version: SocksVersion,
) -> Result<String> {
    let request = socks::handshake(stream, version).await?;
    request
        .grant(stream, SocketAddr::from(([0, 0, 0, 0], 0)))
        .await?;

    session.set_hijacked(true);
    session.set_state(SessionState::SocksTunnel);
    info!(
        "Session:{} SOCKS{} tunnel to {}",
        session.id(),
        match version {
            SocksVersion::V4 => "4",
            SocksVersion::V5 => "5",
        },
        request.target
    );
    Ok(request.target)
}

/// 会话结束：通知后端、触发关闭信号、关闭客户端连接
async fn teardown(session: &Arc<ProxySession>, writer: &ClientWriter) {
    let id = session.id();
    if let Some(binding) = session.backend() {
        binding.backend.serve(session, Event::close(id)).await;
    }
    session.close();
    writer.shutdown().await;
    debug!("Session:{} closed", id);
}

/// 消费循环：把后端事件写回客户端
async fn consume_events(session: Arc<ProxySession>, mut queue: EventQueue, writer: ClientWriter) {
    let id = session.id();

    loop {
        let event = match queue.read(POLL_INTERVAL).await {
            Ok(event) => event,
            Err(QueueError::Timeout) => continue,
            Err(QueueError::Closed) => break,
        };

        let kind = event.kind();
        match event.payload {
            Payload::Error { code, reason } => {
                warn!("Session:{} backend error {}: {}", id, code, reason);
                close_client(&session, &writer).await;
                break;
            }
            Payload::Close => {
                debug!("Session:{} backend closed the session", id);
                close_client(&session, &writer).await;
                break;
            }
            Payload::Chunk(data) => {
                if let Err(e) = writer.write_all(&data).await {
                    debug!("Session:{} write to client failed: {}", id, e);
                    close_client(&session, &writer).await;
                    break;
                }
            }
            Payload::Response(response) => {
                info!("Session:{} response {}", id, response.status.as_u16());
                if let Err(e) = writer.write_all(&response.encode()).await {
                    debug!("Session:{} write to client failed: {}", id, e);
                    close_client(&session, &writer).await;
                    break;
                }
            }
            _ => warn!("Session:{} ignored unexpected {} event", id, kind),
        }
    }
}

async fn close_client(session: &ProxySession, writer: &ClientWriter) {
    // 先触发信号，让请求泵中挂起的读取（包括 TLS 握手）立即返回
    session.close();
    writer.shutdown().await;
}

/// SOCKS 模式：先通知后端打开隧道，再转发原始字节
async fn pump_socks(
    session: &Arc<ProxySession>,
    ctx: &ConnContext,
    mut reader: ClientReader,
    target: &str,
) -> Result<()> {
    let binding = ctx
        .router
        .resolve(session, &RouteRequest::connect(target))?;
    binding
        .backend
        .serve(session, Event::tunnel_open(session.id(), target))
        .await;
    pump_raw(session, &binding, &mut reader).await
}

/// 原始隧道：每次最多读取 READ_BUFFER_SIZE 字节，作为 chunk 事件转发
async fn pump_raw(
    session: &Arc<ProxySession>,
    binding: &BackendBinding,
    reader: &mut ClientReader,
) -> Result<()> {
    let id = session.id();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = session.guard(reader.read(&mut buf)).await??;
        if n == 0 {
            debug!("Session:{} client finished sending", id);
            return Ok(());
        }
        binding
            .backend
            .serve(session, Event::chunk(id, Bytes::copy_from_slice(&buf[..n])))
            .await;
    }
}

/// HTTP 代理模式的请求泵
async fn pump_http(
    session: &Arc<ProxySession>,
    ctx: &ConnContext,
    mut reader: ClientReader,
    writer: &ClientWriter,
) -> Result<()> {
    let id = session.id();

    loop {
        if session.is_hijacked() {
            let binding = session
                .backend()
                .cloned()
                .ok_or_else(|| ProxyError::routing("tunnel without a bound backend"))?;
            return pump_raw(session, &binding, &mut reader).await;
        }

        let head = match session.guard(wire::read_request_head(&mut reader)).await?? {
            Some(head) => head,
            None => {
                debug!("Session:{} client closed between requests", id);
                return Ok(());
            }
        };

        let host = head.host().unwrap_or_default();
        let route = if head.is_connect() {
            RouteRequest::connect(&host)
        } else {
            RouteRequest::new(head.method.clone(), &host)
        };
        let binding = ctx.router.resolve(session, &route)?;

        let mut request = HttpRequestEvent {
            method: head.method.clone(),
            url: normalize_url(&head, session.is_ssl_hijacked())?,
            host,
            headers: head.headers.clone(),
            content: Bytes::new(),
        };
        request.headers.remove("proxy-connection");
        debug!("Session:{} {} {}", id, request.method, request.url);

        if head.is_connect() {
            dispatch_connect(session, &binding, request, writer).await?;
            if session.is_ssl_hijacked() && session.state() != SessionState::TlsIntercepted {
                reader = upgrade_tls(session, ctx, reader, writer, &head.target).await?;
            }
            continue;
        }

        let limit = binding.backend.features().body_limit();
        match (head.body_kind()?, limit) {
            (BodyKind::Length(size), Some(limit)) if size > limit => {
                return Err(ProxyError::BodyTooLarge { size, limit });
            }
            (BodyKind::Length(size), _) => {
                let mut body = BodyReader::raw(BodyKind::Length(size));
                request.content = session.guard(body.read_to_end(&mut reader, None)).await??;
                dispatch(session, &binding, request).await;
            }
            (BodyKind::Chunked, None) => {
                // 长度未知且不限制：先发请求头，再按读取顺序流式转发原始 chunked 报文
                dispatch(session, &binding, request).await;
                let mut body = BodyReader::raw(BodyKind::Chunked);
                while let Some(chunk) = session.guard(body.next_chunk(&mut reader)).await?? {
                    binding.backend.serve(session, Event::chunk(id, chunk)).await;
                }
            }
            (BodyKind::Chunked, Some(limit)) => {
                let mut body = BodyReader::decoded(BodyKind::Chunked);
                let content = session
                    .guard(body.read_to_end(&mut reader, Some(limit)))
                    .await??;
                request.headers.remove(TRANSFER_ENCODING);
                request
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(content.len()));
                request.content = content;
                dispatch(session, &binding, request).await;
            }
            (BodyKind::Empty, _) => dispatch(session, &binding, request).await,
        }

    }
}

/// CONNECT 请求：持有客户端写端直到 200 应答写出
///
/// 后端在处理 CONNECT 时就可能开始转发上游数据（服务端先发言的协议），
/// 这些数据由消费循环写出，必须排在应答之后
async fn dispatch_connect(
    session: &Arc<ProxySession>,
    binding: &BackendBinding,
    request: HttpRequestEvent,
    writer: &ClientWriter,
) -> Result<()> {
    let mut slot = writer.inner.lock().await;
    dispatch(session, binding, request).await;

    if session.is_hijacked() || session.is_ssl_hijacked() {
        let client = slot
            .as_mut()
            .ok_or(ProxyError::SessionClosed(session.id()))?;
        client.write_all(CONNECTION_ESTABLISHED).await?;
        client.flush().await?;
    }
    Ok(())
}

async fn dispatch(session: &Arc<ProxySession>, binding: &BackendBinding, request: HttpRequestEvent) {
    binding
        .backend
        .serve(session, Event::request(session.id(), request))
        .await;
}

/// 规范化请求目标
///
/// CONNECT 保持 host:port；相对路径补全 scheme 和 Host
fn normalize_url(head: &RequestHead, ssl_hijacked: bool) -> Result<String> {
    if head.is_connect() || head.is_absolute() {
        return Ok(head.target.clone());
    }

    let host = head
        .host_header()
        .ok_or_else(|| ProxyError::protocol(format!("missing Host header for {}", head.target)))?;
    let scheme = if ssl_hijacked { "https" } else { "http" };
    Ok(format!("{}://{}{}", scheme, host, head.target))
}

/// 把客户端连接升级为本地终结的 TLS
///
/// 缓冲区中尚未读取的字节（客户端可能已经发出的 ClientHello）会回放给 TLS 层
async fn upgrade_tls(
    session: &ProxySession,
    ctx: &ConnContext,
    reader: ClientReader,
    writer: &ClientWriter,
    target: &str,
) -> Result<ClientReader> {
    let id = session.id();
    let certs = ctx
        .certs
        .as_ref()
        .ok_or_else(|| ProxyError::Tls("interception requested but no CA is configured".into()))?;
    let (host, _) = split_host_port(target);
    let config = certs.server_config(host)?;

    let mut slot = writer.inner.lock().await;
    let write_half = slot.take().ok_or(ProxyError::SessionClosed(id))?;

    let leftover = Bytes::copy_from_slice(reader.buffer());
    let stream = reader.into_inner().unsplit(write_half);
    let stream = Rewind::new(leftover, stream);

    let handshake = tokio::time::timeout(
        TLS_HANDSHAKE_TIMEOUT,
        TlsAcceptor::from(config).accept(stream),
    );
    let tls_stream = match session.guard(handshake).await? {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::Tls(format!("handshake for {} failed: {}", host, e))),
        Err(_) => {
            return Err(ProxyError::Tls(format!(
                "handshake for {} timed out after {:?}",
                host, TLS_HANDSHAKE_TIMEOUT
            )))
        }
    };

    let stream: BoxedStream = Box::new(tls_stream);
    let (read_half, write_half) = tokio::io::split(stream);
    *slot = Some(write_half);
    session.set_state(SessionState::TlsIntercepted);
    info!("Session:{} TLS intercepted for {}", id, host);

    Ok(BufReader::with_capacity(READ_BUFFER_SIZE, read_half))
}
