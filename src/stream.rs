/// 客户端连接的流抽象
///
/// 客户端连接在生命周期内可能从明文 TCP 升级为 TLS，
/// 统一装箱为 BoxedStream 以便在升级前后使用同一套读写逻辑
use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 双向字节流
pub trait ProxyIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 ProxyIo
impl<T> ProxyIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 装箱后的客户端连接
pub type BoxedStream = Box<dyn ProxyIo>;

/// 回放读取器
///
/// 先返回已经从内部流读出但尚未消费的字节，再继续读取内部流。
/// 协议探测和 TLS 升级时用来保证缓冲区中的数据不会丢失
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    /// 创建新的回放读取器
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }

    /// 获取尚未回放的字节数
    #[cfg(test)]
    fn pending(&self) -> usize {
        self.prefix.as_ref().map(|p| p.len()).unwrap_or(0)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if buf.remaining() == 0 {
                self.prefix = Some(prefix);
                return Poll::Ready(Ok(()));
            }

            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);

            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_replays_prefix_first() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut rewind = Rewind::new(Bytes::from_static(b"hello"), server);
        assert_eq!(rewind.pending(), 5);

        let mut out = String::new();
        rewind.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert_eq!(rewind.pending(), 0);
    }

    #[tokio::test]
    async fn test_rewind_small_reads() {
        let (_client, server) = tokio::io::duplex(64);
        let mut rewind = Rewind::new(b"abcdef".to_vec(), server);

        let mut buf = [0u8; 4];
        let n = rewind.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(rewind.pending(), 2);

        let n = rewind.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_rewind_empty_prefix_passes_through() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut rewind = Rewind::new(Vec::new(), server);
        assert_eq!(rewind.pending(), 0);

        rewind.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
