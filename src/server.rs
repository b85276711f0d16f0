/// 监听端点管理
///
/// 每个监听端点一个接受循环，每个接受的连接在独立任务中处理。
/// 停止时只关闭监听套接字，已接受的会话继续运行直到自然结束
use crate::backend::BackendRegistry;
use crate::config::{AppConfig, ListenerConfig};
use crate::conn::{serve_proxy_conn, ConnContext};
use crate::error::ProxyError;
use crate::mitm::{CaCertProvider, CertProvider};
use crate::routing::Router;
use anyhow::{bail, Context, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 接受失败后的重试间隔
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// 代理前端
pub struct ProxyServer {
    registry: Arc<BackendRegistry>,
    certs: Option<Arc<dyn CertProvider>>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<CancellationToken>,
    next_id: Arc<AtomicU32>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
}

impl ProxyServer {
    pub fn new(registry: Arc<BackendRegistry>, certs: Option<Arc<dyn CertProvider>>) -> Self {
        Self {
            registry,
            certs,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(CancellationToken::new()),
            next_id: Arc::new(AtomicU32::new(1)),
            tasks: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
        }
    }

    /// 根据配置构建后端注册表和证书提供者
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let registry = BackendRegistry::from_config(&config.backends)?;
        let certs = match &config.mitm {
            Some(mitm) => {
                let provider = CaCertProvider::from_config(mitm)?;
                Some(Arc::new(provider) as Arc<dyn CertProvider>)
            }
            None => None,
        };
        Ok(Self::new(Arc::new(registry), certs))
    }

    /// 绑定所有端点并开始接受连接
    ///
    /// 任一端点绑定失败时整体失败，已绑定的端点随之释放
    pub async fn start(&self, listeners: &[ListenerConfig]) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            bail!("Proxy server is already running");
        }

        let mut bound = Vec::with_capacity(listeners.len());
        for config in listeners {
            let router = Router::from_config(config, self.registry.clone())
                .with_context(|| format!("Invalid rules for listener {}", config.local))?;
            let listener = TcpListener::bind(&config.local)
                .await
                .with_context(|| format!("Failed to bind listener to {}", config.local))?;
            let addr = listener
                .local_addr()
                .with_context(|| format!("Failed to get local address of {}", config.local))?;
            let ctx = Arc::new(ConnContext::new(router, self.certs.clone()));
            bound.push((listener, addr, ctx));
        }

        let token = CancellationToken::new();
        *self.shutdown.lock() = token.clone();
        self.running.store(true, Ordering::Release);

        let mut tasks = self.tasks.lock();
        let mut addrs = self.local_addrs.lock();
        addrs.clear();
        for (listener, addr, ctx) in bound {
            info!("Listening on {}", addr);
            addrs.push(addr);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                addr,
                ctx,
                self.running.clone(),
                token.clone(),
                self.next_id.clone(),
            )));
        }

        Ok(())
    }

    /// 停止接受新连接
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Stopping proxy listeners");
        }
        self.shutdown.lock().cancel();
    }

    /// 等待所有接受循环退出
    pub async fn wait(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Listener task failed: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 实际绑定的地址
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.shutdown.get_mut().cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    addr: SocketAddr,
    ctx: Arc<ConnContext>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    next_id: Arc<AtomicU32>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accept_result = listener.accept() => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        debug!("Session:{} accepted from {} on {}", id, peer_addr, addr);

                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_proxy_conn(Box::new(stream), id, ctx).await {
                                log_session_error(id, &e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Listener {}: accept error: {}", addr, e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    info!("Listener {} stopped", addr);
}

fn log_session_error(id: u32, e: &ProxyError) {
    match e {
        ProxyError::Routing(_) | ProxyError::BodyTooLarge { .. } => {
            warn!("Session:{} aborted: {}", id, e)
        }
        ProxyError::Io(_) => debug!("Session:{} connection error: {}", id, e),
        _ => error!("Session:{} failed: {}", id, e),
    }
}
