/// HTTP/1.x 请求解析
///
/// 从缓冲读取器中逐个读取请求头，并按 Content-Length 或 chunked
/// 编码读取请求体。请求体可以按原始报文流式读取，也可以解码后整体缓冲
use crate::error::{ProxyError, Result};
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// 请求头最大字节数
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// 最大请求头数量
pub const MAX_HEADERS: usize = 100;

/// 单次读取的请求体块大小
pub const CHUNK_SIZE: usize = 8192;

/// chunked 编码中单行（块大小行、trailer）的最大长度
const MAX_LINE_SIZE: usize = 4096;

/// 已解析的请求头
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// 请求行中的 request-target
    pub target: String,
    /// HTTP 次版本号（0 或 1）
    pub version: u8,
    pub headers: HeaderMap,
}

/// 请求体长度类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// 没有请求体
    Empty,
    /// 声明了 Content-Length
    Length(u64),
    /// chunked 编码，长度未知
    Chunked,
}

impl RequestHead {
    /// Host 头
    pub fn host_header(&self) -> Option<&str> {
        self.headers.get(HOST).and_then(|v| v.to_str().ok())
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// request-target 是否为绝对 URL
    pub fn is_absolute(&self) -> bool {
        let lower = self.target.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    /// 请求的目标主机（可能带端口）
    pub fn host(&self) -> Option<String> {
        if self.is_connect() {
            return Some(self.target.clone());
        }
        if self.is_absolute() {
            if let Ok(url) = url::Url::parse(&self.target) {
                let host = url.host_str()?;
                return Some(match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                });
            }
        }
        self.host_header().map(str::to_string)
    }

    /// 请求体类型
    pub fn body_kind(&self) -> Result<BodyKind> {
        if self.is_connect() {
            return Ok(BodyKind::Empty);
        }

        let chunked = self
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return Ok(BodyKind::Chunked);
        }

        match self.headers.get(CONTENT_LENGTH) {
            Some(value) => {
                let length = value
                    .to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .ok_or_else(|| ProxyError::protocol("invalid Content-Length"))?;
                Ok(if length == 0 {
                    BodyKind::Empty
                } else {
                    BodyKind::Length(length)
                })
            }
            None => Ok(BodyKind::Empty),
        }
    }
}

/// 读取一个请求头
///
/// 连接在请求之间干净关闭时返回 None
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);

    loop {
        let remaining = (MAX_HEAD_SIZE - buf.len()) as u64;
        if remaining == 0 {
            return Err(ProxyError::protocol("request head too large"));
        }

        let start = buf.len();
        let n = (&mut *reader).take(remaining).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::protocol("unexpected EOF in request head"));
        }

        // 请求行之前的空行忽略
        if start == 0 && (buf == b"\r\n" || buf == b"\n") {
            buf.clear();
            continue;
        }

        if buf.ends_with(b"\r\n\r\n") || buf.ends_with(b"\n\n") {
            break;
        }
    }

    parse_request_head(&buf).map(Some)
}

/// 解析完整的请求头字节
pub fn parse_request_head(buf: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::protocol("incomplete request head"))
        }
        Err(e) => return Err(ProxyError::protocol(format!("malformed request: {}", e))),
    }

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| ProxyError::protocol("invalid request method"))?;
    let target = req
        .path
        .ok_or_else(|| ProxyError::protocol("missing request target"))?
        .to_string();
    let version = req.version.unwrap_or(1);

    let mut map = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ProxyError::protocol(format!("invalid header name: {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ProxyError::protocol(format!("invalid value for header {}", header.name)))?;
        map.append(name, value);
    }

    Ok(RequestHead {
        method,
        target,
        version,
        headers: map,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Fixed(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailer,
    Done,
}

/// 请求体读取器
///
/// raw 模式返回线上的原始字节（包括 chunked 分帧），
/// decoded 模式只返回解码后的数据
#[derive(Debug)]
pub struct BodyReader {
    state: BodyState,
    decode: bool,
}

impl BodyReader {
    /// 按原始报文读取
    pub fn raw(kind: BodyKind) -> Self {
        Self::new(kind, false)
    }

    /// 读取并解码 chunked 分帧
    pub fn decoded(kind: BodyKind) -> Self {
        Self::new(kind, true)
    }

    fn new(kind: BodyKind, decode: bool) -> Self {
        let state = match kind {
            BodyKind::Empty => BodyState::Done,
            BodyKind::Length(n) => BodyState::Fixed(n),
            BodyKind::Chunked => BodyState::ChunkSize,
        };
        Self { state, decode }
    }

    pub fn is_done(&self) -> bool {
        self.state == BodyState::Done
    }

    /// 读取下一块数据（最多 CHUNK_SIZE 字节），请求体结束时返回 None
    pub async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match self.state {
                BodyState::Done => return Ok(None),
                BodyState::Fixed(remaining) => {
                    if remaining == 0 {
                        self.state = BodyState::Done;
                        return Ok(None);
                    }
                    let data = read_data(reader, remaining).await?;
                    self.state = BodyState::Fixed(remaining - data.len() as u64);
                    return Ok(Some(data));
                }
                BodyState::ChunkSize => {
                    let line = read_line(reader).await?;
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        BodyState::Trailer
                    } else {
                        BodyState::ChunkData(size)
                    };
                    if !self.decode {
                        return Ok(Some(line));
                    }
                }
                BodyState::ChunkData(remaining) => {
                    let data = read_data(reader, remaining).await?;
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 {
                        BodyState::ChunkEnd
                    } else {
                        BodyState::ChunkData(left)
                    };
                    return Ok(Some(data));
                }
                BodyState::ChunkEnd => {
                    let line = read_line(reader).await?;
                    if line.as_ref() != b"\r\n" && line.as_ref() != b"\n" {
                        return Err(ProxyError::protocol("missing CRLF after chunk data"));
                    }
                    self.state = BodyState::ChunkSize;
                    if !self.decode {
                        return Ok(Some(line));
                    }
                }
                BodyState::Trailer => {
                    let line = read_line(reader).await?;
                    if line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
                        self.state = BodyState::Done;
                    }
                    if !self.decode {
                        return Ok(Some(line));
                    }
                }
            }
        }
    }

    /// 读取完整请求体，超过 limit 时返回 BodyTooLarge
    pub async fn read_to_end<R>(&mut self, reader: &mut R, limit: Option<u64>) -> Result<Bytes>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next_chunk(reader).await? {
            body.extend_from_slice(&chunk);
            if let Some(limit) = limit {
                if body.len() as u64 > limit {
                    return Err(ProxyError::BodyTooLarge {
                        size: body.len() as u64,
                        limit,
                    });
                }
            }
        }
        Ok(body.freeze())
    }
}

async fn read_data<R>(reader: &mut R, remaining: u64) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let want = remaining.min(CHUNK_SIZE as u64) as usize;
    let mut buf = vec![0u8; want];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(ProxyError::protocol("unexpected EOF in request body"));
    }
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

async fn read_line<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .take(MAX_LINE_SIZE as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(ProxyError::protocol("unexpected EOF in chunked body"));
    }
    if !line.ends_with(b"\n") {
        return Err(ProxyError::protocol("chunked body line too long"));
    }
    Ok(Bytes::from(line))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::protocol("invalid chunk size line"))?;
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| ProxyError::protocol(format!("invalid chunk size: {:?}", size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader(data: &'static [u8]) -> BufReader<&'static [u8]> {
        BufReader::new(data)
    }

    #[tokio::test]
    async fn test_read_request_head() {
        let mut r = reader(b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\nrest");
        let head = read_request_head(&mut r).await.unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://example.com/a");
        assert_eq!(head.version, 1);
        assert_eq!(head.host_header(), Some("example.com"));
        assert!(head.headers.contains_key("proxy-connection"));
        assert_eq!(head.body_kind().unwrap(), BodyKind::Empty);

        let mut rest = String::new();
        r.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "rest");
    }

    #[tokio::test]
    async fn test_read_request_head_eof() {
        let mut r = reader(b"");
        assert!(read_request_head(&mut r).await.unwrap().is_none());

        let mut r = reader(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert!(read_request_head(&mut r).await.is_err());
    }

    #[tokio::test]
    async fn test_read_request_head_malformed() {
        let mut r = reader(b"NOT A REQUEST\r\n\r\n");
        assert!(read_request_head(&mut r).await.is_err());
    }

    #[test]
    fn test_request_host() {
        let head = parse_request_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").unwrap();
        assert!(head.is_connect());
        assert_eq!(head.host().unwrap(), "example.com:443");

        let head = parse_request_head(b"GET http://a.com:8080/x HTTP/1.1\r\nHost: b.com\r\n\r\n").unwrap();
        assert_eq!(head.host().unwrap(), "a.com:8080");

        let head = parse_request_head(b"GET /x HTTP/1.1\r\nHost: b.com\r\n\r\n").unwrap();
        assert!(!head.is_absolute());
        assert_eq!(head.host().unwrap(), "b.com");
    }

    #[test]
    fn test_body_kind() {
        let head = parse_request_head(b"POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n").unwrap();
        assert_eq!(head.body_kind().unwrap(), BodyKind::Length(12));

        let head = parse_request_head(
            b"POST / HTTP/1.1\r\nContent-Length: 12\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.body_kind().unwrap(), BodyKind::Chunked);

        let head = parse_request_head(b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n").unwrap();
        assert!(head.body_kind().is_err());
    }

    #[tokio::test]
    async fn test_fixed_body_in_chunks() {
        static BODY: [u8; 20000] = [7u8; 20000];
        let mut r = BufReader::new(&BODY[..]);
        let mut body = BodyReader::raw(BodyKind::Length(20000));

        let mut sizes = Vec::new();
        while let Some(chunk) = body.next_chunk(&mut r).await.unwrap() {
            assert!(chunk.len() <= CHUNK_SIZE);
            sizes.push(chunk.len());
        }
        assert_eq!(sizes.iter().sum::<usize>(), 20000);
        assert!(body.is_done());
    }

    #[tokio::test]
    async fn test_chunked_raw_and_decoded() {
        const WIRE: &[u8] = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\nNEXT";

        let mut r = reader(WIRE);
        let mut raw = BodyReader::raw(BodyKind::Chunked);
        let mut collected = Vec::new();
        while let Some(chunk) = raw.next_chunk(&mut r).await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, &WIRE[..WIRE.len() - 4]);

        let mut r = reader(WIRE);
        let mut decoded = BodyReader::decoded(BodyKind::Chunked);
        let body = decoded.read_to_end(&mut r, None).await.unwrap();
        assert_eq!(body.as_ref(), b"hello world");

        let mut rest = String::new();
        r.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[tokio::test]
    async fn test_read_to_end_limit() {
        let mut r = reader(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        let err = BodyReader::decoded(BodyKind::Chunked)
            .read_to_end(&mut r, Some(8))
            .await
            .unwrap_err();
        assert!(err.is_body_too_large());
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mut r = reader(b"abc");
        let err = BodyReader::raw(BodyKind::Length(10))
            .read_to_end(&mut r, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }
}
