/// 代理会话
///
/// 每个接受的连接对应一个会话，由请求泵和消费循环共同持有。
/// 两个循环之间只通过事件队列、原子标志和关闭信号通信
use crate::backend::Backend;
use crate::error::{ProxyError, Result};
use crate::event::{Event, SessionId};
use crate::queue::{EventQueue, EventSender};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// 尚未完成协议探测
    Init = 0,
    /// HTTP 代理模式
    HttpProxy = 1,
    /// SOCKS 原始隧道
    SocksTunnel = 2,
    /// 已升级为本地终结的 TLS
    TlsIntercepted = 3,
    /// 已关闭（终态）
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::HttpProxy,
            2 => Self::SocksTunnel,
            3 => Self::TlsIntercepted,
            _ => Self::Closed,
        }
    }
}

/// 会话绑定的后端
#[derive(Clone)]
pub struct BackendBinding {
    /// 后端名称
    pub name: String,
    /// 后端实例
    pub backend: Arc<dyn Backend>,
}

impl std::fmt::Debug for BackendBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendBinding")
            .field("name", &self.name)
            .field("features", &self.backend.features())
            .finish()
    }
}

/// 代理会话
pub struct ProxySession {
    id: SessionId,
    hijacked: AtomicBool,
    ssl_hijacked: AtomicBool,
    state: AtomicU8,
    binding: OnceLock<BackendBinding>,
    events: EventSender,
    closed: CancellationToken,
}

impl ProxySession {
    /// 创建会话及其事件队列
    pub fn new(id: SessionId) -> (Arc<Self>, EventQueue) {
        let closed = CancellationToken::new();
        let (events, queue) = EventQueue::new(closed.clone());
        let session = Arc::new(Self {
            id,
            hijacked: AtomicBool::new(false),
            ssl_hijacked: AtomicBool::new(false),
            state: AtomicU8::new(SessionState::Init as u8),
            binding: OnceLock::new(),
            events,
            closed,
        });
        (session, queue)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 是否处于原始隧道模式
    pub fn is_hijacked(&self) -> bool {
        self.hijacked.load(Ordering::Acquire)
    }

    /// 切换到原始隧道模式（后端处理 CONNECT 时调用）
    pub fn set_hijacked(&self, value: bool) {
        self.hijacked.store(value, Ordering::Release);
    }

    /// 是否需要拦截 TLS
    pub fn is_ssl_hijacked(&self) -> bool {
        self.ssl_hijacked.load(Ordering::Acquire)
    }

    /// 标记需要拦截 TLS（后端处理 CONNECT 时调用）
    pub fn set_ssl_hijacked(&self, value: bool) {
        self.ssl_hijacked.store(value, Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 更新状态，Closed 之后不再变化
    pub fn set_state(&self, state: SessionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SessionState::Closed as u8).then_some(state as u8)
            });
    }

    /// 当前绑定的后端
    pub fn backend(&self) -> Option<&BackendBinding> {
        self.binding.get()
    }

    /// 绑定后端，已绑定时保持原绑定不变
    pub fn bind(&self, name: &str, backend: Arc<dyn Backend>) -> &BackendBinding {
        self.binding.get_or_init(|| BackendBinding {
            name: name.to_string(),
            backend,
        })
    }

    /// 向会话事件队列投递事件（后端调用）
    pub fn publish(&self, event: Event) -> bool {
        if self.is_closed() {
            return false;
        }
        self.events.send(event)
    }

    /// 触发关闭信号
    pub fn close(&self) {
        self.set_state(SessionState::Closed);
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 等待关闭信号
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// 在关闭信号触发时取消 fut
    pub async fn guard<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProxyError::SessionClosed(self.id)),
            value = fut => Ok(value),
        }
    }
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("hijacked", &self.is_hijacked())
            .field("ssl_hijacked", &self.is_ssl_hijacked())
            .field("backend", &self.backend().map(|b| b.name.as_str()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Features;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        async fn serve(&self, _session: &Arc<ProxySession>, _event: Event) {}

        fn features(&self) -> Features {
            Features::default()
        }
    }

    #[test]
    fn test_bind_is_idempotent() {
        let (session, _queue) = ProxySession::new(1);
        assert!(session.backend().is_none());

        session.bind("first", Arc::new(NullBackend));
        let binding = session.bind("second", Arc::new(NullBackend));
        assert_eq!(binding.name, "first");
        assert_eq!(session.backend().unwrap().name, "first");

        let text = format!("{:?}", session.backend().unwrap());
        assert!(text.contains("first"));
        assert!(text.contains("max_request_body: -1"));
    }

    #[test]
    fn test_closed_state_is_terminal() {
        let (session, _queue) = ProxySession::new(2);
        assert_eq!(session.state(), SessionState::Init);

        session.set_state(SessionState::HttpProxy);
        assert_eq!(session.state(), SessionState::HttpProxy);

        session.close();
        session.set_state(SessionState::TlsIntercepted);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.is_closed());
    }

    #[test]
    fn test_flags() {
        let (session, _queue) = ProxySession::new(3);
        assert!(!session.is_hijacked());
        assert!(!session.is_ssl_hijacked());

        session.set_hijacked(true);
        session.set_ssl_hijacked(true);
        assert!(session.is_hijacked());
        assert!(session.is_ssl_hijacked());
    }

    #[tokio::test]
    async fn test_publish_after_close_is_dropped() {
        let (session, mut queue) = ProxySession::new(4);
        assert!(session.publish(Event::close(4)));
        assert!(queue.read(Duration::from_millis(50)).await.is_ok());

        session.close();
        assert!(!session.publish(Event::close(4)));
    }

    #[tokio::test]
    async fn test_guard_cancelled_by_close() {
        let (session, _queue) = ProxySession::new(5);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .guard(tokio::time::sleep(Duration::from_secs(30)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close();
        let result = waiter.await.unwrap();
        assert!(result.unwrap_err().is_session_closed());
    }
}
