/// 会话事件队列
///
/// 先进先出的信箱：后端持有发送端，消费循环独占接收端。
/// 读取带有限等待，并且在会话关闭信号触发时立即返回
use crate::event::Event;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 消费循环的轮询间隔
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 队列读取结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// 等待超时，没有事件
    Timeout,
    /// 会话已关闭或所有发送端都已释放
    Closed,
}

/// 事件发送端（可克隆，交给后端）
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// 投递事件，接收端已释放时返回 false
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// 事件接收端
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<Event>,
    closed: CancellationToken,
}

impl EventQueue {
    /// 创建队列，closed 为会话关闭信号
    pub fn new(closed: CancellationToken) -> (EventSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, Self { rx, closed })
    }

    /// 读取下一个事件，最多等待 wait
    pub async fn read(&mut self, wait: Duration) -> Result<Event, QueueError> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(QueueError::Closed),
            result = tokio::time::timeout(wait, self.rx.recv()) => match result {
                Ok(Some(event)) => Ok(event),
                Ok(None) => Err(QueueError::Closed),
                Err(_) => Err(QueueError::Timeout),
            },
        }
    }
}
