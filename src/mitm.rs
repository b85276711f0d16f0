/// TLS 拦截证书
///
/// 用根 CA 为每个被拦截的主机签发叶子证书，并按主机缓存
/// 对应的 rustls 服务端配置
use crate::config::MitmConfig;
use crate::error::{ProxyError, Result};
use anyhow::Context;
use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// 叶子证书有效期（天）
const LEAF_VALIDITY_DAYS: i64 = 365;

/// 根 CA 有效期（天）
const CA_VALIDITY_DAYS: i64 = 3650;

/// 证书生效时间向前回拨，容忍客户端时钟偏差
const CLOCK_SKEW_DAYS: i64 = 1;

/// 默认缓存的主机数，超出后淘汰最久未使用的主机
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// 为被拦截的主机提供 TLS 服务端配置
pub trait CertProvider: Send + Sync {
    /// 返回主机（不含端口）的服务端配置
    fn server_config(&self, host: &str) -> Result<Arc<rustls::ServerConfig>>;
}

/// PEM 编码的 CA 证书和私钥
#[derive(Debug, Clone)]
pub struct GeneratedCa {
    pub cert_pem: String,
    pub key_pem: String,
}

/// 基于根 CA 动态签发证书
pub struct CaCertProvider {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    ca_pem: String,
    cache: Mutex<LruCache<String, Arc<rustls::ServerConfig>>>,
}

impl CaCertProvider {
    /// 从 PEM 文本加载 CA
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::certificate(format!("invalid CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| ProxyError::certificate(format!("invalid CA certificate: {}", e)))?;
        let ca_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::certificate("no certificate in CA PEM"))??;

        Ok(Self {
            issuer,
            ca_der,
            ca_pem: cert_pem.to_string(),
            cache: Mutex::new(new_cache(DEFAULT_CACHE_CAPACITY)),
        })
    }

    /// 从文件加载 CA
    pub fn from_files(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("Failed to read CA certificate: {:?}", cert_path))?;
        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("Failed to read CA key: {:?}", key_path))?;
        let provider = Self::from_pem(&cert_pem, &key_pem)
            .with_context(|| format!("Failed to load CA from {:?}", cert_path))?;
        info!("Loaded interception CA from {:?}", cert_path);
        Ok(provider)
    }

    /// 生成仅在本进程内有效的临时 CA
    pub fn ephemeral() -> Result<Self> {
        let (params, key) = ca_params("split-tunnel Ephemeral CA")?;
        let cert = params
            .clone()
            .self_signed(&key)
            .map_err(|e| ProxyError::certificate(format!("failed to self-sign CA: {}", e)))?;
        let ca_der = cert.der().clone();
        let ca_pem = cert.pem();

        Ok(Self {
            issuer: Issuer::new(params, key),
            ca_der,
            ca_pem,
            cache: Mutex::new(new_cache(DEFAULT_CACHE_CAPACITY)),
        })
    }

    /// 根据配置加载 CA，未配置路径时生成临时 CA
    pub fn from_config(config: &MitmConfig) -> anyhow::Result<Self> {
        match (&config.ca_cert, &config.ca_key) {
            (Some(cert), Some(key)) => Self::from_files(cert, key),
            (None, None) => {
                warn!("No interception CA configured, generating an ephemeral one; clients must trust it explicitly");
                Ok(Self::ephemeral()?)
            }
            _ => anyhow::bail!("mitm.ca_cert and mitm.ca_key must both be set, or both omitted"),
        }
    }

    /// CA 证书（PEM），用于导出给客户端信任
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_pem
    }

    /// 调整缓存容量（至少为 1），已缓存的配置按最近使用顺序保留
    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        let mut cache = self.cache.into_inner();
        cache.resize(cache_capacity(capacity));
        Self {
            cache: Mutex::new(cache),
            ..self
        }
    }

    /// 已缓存的主机数
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    fn forge(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        debug!("Forging certificate for {}", host);

        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::certificate(format!("key generation failed: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into().map_err(|_| {
                ProxyError::certificate(format!("invalid DNS name: {}", host))
            })?),
        };
        params.subject_alt_names = vec![san];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(CLOCK_SKEW_DAYS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key, &self.issuer)
            .map_err(|e| ProxyError::certificate(format!("signing {} failed: {}", host, e)))?;

        let chain = vec![cert.der().clone(), self.ca_der.clone()];
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        // 只支持 HTTP/1.x 的请求解析
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

impl CertProvider for CaCertProvider {
    fn server_config(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        let host = host
            .trim_matches(|c| c == '[' || c == ']')
            .to_ascii_lowercase();
        if host.is_empty() {
            return Err(ProxyError::certificate("empty host"));
        }

        if let Some(config) = self.cache.lock().get(&host) {
            return Ok(config.clone());
        }

        // 签发较慢，不持有锁
        let config = self.forge(&host)?;
        let mut cache = self.cache.lock();
        Ok(cache.get_or_insert(host, || config).clone())
    }
}

impl std::fmt::Debug for CaCertProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaCertProvider")
            .field("cached", &self.cached())
            .finish()
    }
}

fn cache_capacity(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

fn new_cache(capacity: usize) -> LruCache<String, Arc<rustls::ServerConfig>> {
    LruCache::new(cache_capacity(capacity))
}

fn ca_params(common_name: &str) -> Result<(CertificateParams, KeyPair)> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| ProxyError::certificate(format!("CA key generation failed: {}", e)))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("split-tunnel".to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(CLOCK_SKEW_DAYS);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    Ok((params, key))
}

/// 生成新的根 CA
pub fn generate_ca(common_name: &str) -> Result<GeneratedCa> {
    let (params, key) = ca_params(common_name)?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| ProxyError::certificate(format!("failed to self-sign CA: {}", e)))?;

    Ok(GeneratedCa {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}
