/// SOCKS4/4a/5 握手
///
/// 只支持 CONNECT 命令，SOCKS5 只支持无认证方式
use crate::error::{ProxyError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 握手超时
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

/// SOCKS4 字符串字段（USERID、4a 域名）最大长度
const MAX_SOCKS4_FIELD: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

impl SocksVersion {
    /// 根据连接的第一个字节判断是否为 SOCKS
    pub fn detect(first: u8) -> Option<Self> {
        match first {
            SOCKS5_VERSION => Some(Self::V5),
            SOCKS4_VERSION => Some(Self::V4),
            _ => None,
        }
    }
}

/// 握手完成后的 CONNECT 请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: SocksVersion,
    /// host:port（IPv6 为 [addr]:port）
    pub target: String,
}

impl SocksRequest {
    /// 发送成功应答
    pub async fn grant<W>(&self, stream: &mut W, bind: SocketAddr) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut reply = Vec::with_capacity(22);
        match self.version {
            SocksVersion::V5 => {
                reply.extend_from_slice(&[SOCKS5_VERSION, REP_SUCCEEDED, 0x00]);
                match bind.ip() {
                    IpAddr::V4(ip) => {
                        reply.push(ATYP_IPV4);
                        reply.extend_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        reply.push(ATYP_IPV6);
                        reply.extend_from_slice(&ip.octets());
                    }
                }
                reply.extend_from_slice(&bind.port().to_be_bytes());
            }
            SocksVersion::V4 => {
                reply.extend_from_slice(&[0x00, SOCKS4_GRANTED]);
                reply.extend_from_slice(&bind.port().to_be_bytes());
                let ip = match bind.ip() {
                    IpAddr::V4(ip) => ip,
                    IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                reply.extend_from_slice(&ip.octets());
            }
        }
        stream.write_all(&reply).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// 执行握手，返回客户端请求的目标
///
/// 调用方已经通过 peek 确定了版本，版本字节仍在流中
pub async fn handshake<S>(stream: &mut S, version: SocksVersion) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        match version {
            SocksVersion::V5 => handshake_v5(stream).await,
            SocksVersion::V4 => handshake_v4(stream).await,
        }
    })
    .await;

    match result {
        Ok(result) => result,
        Err(_) => Err(ProxyError::socks(format!(
            "handshake timeout after {:?}",
            HANDSHAKE_TIMEOUT
        ))),
    }
}

async fn handshake_v5<S>(stream: &mut S) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::socks(format!("unsupported version {}", header[0])));
    }

    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(ProxyError::socks("no authentication methods offered"));
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS5_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        return Err(ProxyError::socks("client does not offer no-auth method"));
    }
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;

    // VER CMD RSV ATYP
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION {
        return Err(ProxyError::socks("invalid request version"));
    }

    let cmd = request[1];
    if cmd != CMD_CONNECT {
        reply_v5_failure(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(ProxyError::socks(format!("unsupported command {}", cmd)));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(ProxyError::socks("empty domain name"));
            }
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| ProxyError::socks("domain name is not UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            format!("[{}]", Ipv6Addr::from(addr))
        }
        atyp => {
            reply_v5_failure(stream, REP_ADDRESS_NOT_SUPPORTED).await?;
            return Err(ProxyError::socks(format!("unsupported address type {}", atyp)));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    Ok(SocksRequest {
        version: SocksVersion::V5,
        target: format!("{}:{}", host, port),
    })
}

async fn reply_v5_failure<S>(stream: &mut S, rep: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [SOCKS5_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

async fn handshake_v4<S>(stream: &mut S) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VN CD DSTPORT DSTIP
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS4_VERSION {
        return Err(ProxyError::socks(format!("unsupported version {}", header[0])));
    }

    let cmd = header[1];
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);

    // USERID 忽略
    read_null_terminated(stream).await?;

    if cmd != CMD_CONNECT {
        stream
            .write_all(&[0x00, SOCKS4_REJECTED, 0, 0, 0, 0, 0, 0])
            .await?;
        stream.flush().await?;
        return Err(ProxyError::socks(format!("unsupported command {}", cmd)));
    }

    // SOCKS4a：0.0.0.x (x != 0) 表示后面跟着域名
    let octets = ip.octets();
    let host = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let domain = read_null_terminated(stream).await?;
        if domain.is_empty() {
            return Err(ProxyError::socks("empty SOCKS4a domain name"));
        }
        String::from_utf8(domain).map_err(|_| ProxyError::socks("domain name is not UTF-8"))?
    } else {
        ip.to_string()
    };

    Ok(SocksRequest {
        version: SocksVersion::V4,
        target: format!("{}:{}", host, port),
    })
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(field);
        }
        if field.len() >= MAX_SOCKS4_FIELD {
            return Err(ProxyError::socks("SOCKS4 field too long"));
        }
        field.push(byte);
    }
}
