use super::{Backend, Features};
use crate::event::{Event, HttpResponseEvent, Payload};
use crate::session::ProxySession;
use async_trait::async_trait;
use http::StatusCode;
use std::sync::Arc;
use tracing::info;

/// 拒绝后端：对命中的请求直接返回 403
#[derive(Debug, Default)]
pub struct BlockBackend {
    features: Features,
}

impl BlockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明请求体上限（超限的请求在到达后端前即被终止）
    pub fn with_features(features: Features) -> Self {
        Self { features }
    }
}

#[async_trait]
impl Backend for BlockBackend {
    async fn serve(&self, session: &Arc<ProxySession>, event: Event) {
        let id = session.id();
        match event.payload {
            Payload::TunnelOpen { addr } => {
                info!("Session:{} blocked tunnel to {}", id, addr);
                session.publish(Event::error(id, 403, format!("tunnel to {} is blocked", addr)));
            }
            Payload::Request(req) => {
                info!("Session:{} blocked {} {}", id, req.method, req.url);
                let body = format!("Access to {} is blocked by proxy rules", req.host);
                session.publish(Event::response(
                    id,
                    HttpResponseEvent::text(StatusCode::FORBIDDEN, body),
                ));
                if req.is_connect() {
                    session.publish(Event::close(id));
                }
            }
            // 被拒绝请求的后续数据直接丢弃
            Payload::Chunk(_) | Payload::Close => {}
            other => {
                info!("Session:{} ignored {:?} in block backend", id, other);
            }
        }
    }

    fn features(&self) -> Features {
        self.features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HttpRequestEvent;
    use crate::queue::POLL_INTERVAL;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn request(method: Method, url: &str) -> HttpRequestEvent {
        HttpRequestEvent {
            method,
            url: url.to_string(),
            host: "ads.example.com".to_string(),
            headers: HeaderMap::new(),
            content: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn test_block_plain_request() {
        let (session, mut queue) = ProxySession::new(1);
        let backend = BlockBackend::new();
        backend
            .serve(&session, Event::request(1, request(Method::GET, "http://ads.example.com/")))
            .await;

        let event = queue.read(POLL_INTERVAL).await.unwrap();
        match event.payload {
            Payload::Response(resp) => assert_eq!(resp.status, StatusCode::FORBIDDEN),
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(queue
            .read(std::time::Duration::from_millis(20))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_block_connect_closes() {
        let (session, mut queue) = ProxySession::new(2);
        let backend = BlockBackend::new();
        backend
            .serve(&session, Event::request(2, request(Method::CONNECT, "ads.example.com:443")))
            .await;

        assert_eq!(queue.read(POLL_INTERVAL).await.unwrap().kind(), "response");
        assert_eq!(queue.read(POLL_INTERVAL).await.unwrap().kind(), "close");
        assert!(!session.is_hijacked());
    }

    #[tokio::test]
    async fn test_block_tunnel_open() {
        let (session, mut queue) = ProxySession::new(3);
        BlockBackend::new()
            .serve(&session, Event::tunnel_open(3, "10.0.0.5:80"))
            .await;

        match queue.read(POLL_INTERVAL).await.unwrap().payload {
            Payload::Error { code, reason } => {
                assert_eq!(code, 403);
                assert!(reason.contains("10.0.0.5:80"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
