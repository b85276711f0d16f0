/// 后端路由
///
/// 按声明顺序逐条匹配规则，第一条命中的规则决定后端名称。
/// 没有规则命中时会话直接终止，不存在默认后端
use crate::backend::BackendRegistry;
use crate::config::{ListenerConfig, RuleConfig};
use crate::error::{ProxyError, Result};
use crate::session::{BackendBinding, ProxySession};
use anyhow::Context;
use http::Method;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// 主机匹配模式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// `*`，匹配任意主机
    Any,
    /// 完全匹配（不区分大小写）
    Exact(String),
    /// `*.example.com`，匹配 example.com 及其所有子域名
    Suffix(String),
    /// CIDR 网段，仅匹配 IP 形式的主机
    Network(IpNetwork),
}

impl FromStr for HostPattern {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("Empty host pattern");
        }
        if s == "*" {
            return Ok(Self::Any);
        }
        if let Some(suffix) = s.strip_prefix("*.") {
            if suffix.is_empty() || suffix.contains('*') {
                anyhow::bail!("Invalid wildcard host pattern: {}", s);
            }
            return Ok(Self::Suffix(suffix.to_ascii_lowercase()));
        }
        if s.contains('/') {
            let network = s
                .parse::<IpNetwork>()
                .with_context(|| format!("Invalid CIDR pattern: {}", s))?;
            return Ok(Self::Network(network));
        }
        if s.contains('*') {
            anyhow::bail!("Wildcards are only supported as a '*.' prefix: {}", s);
        }
        Ok(Self::Exact(s.trim_matches(|c| c == '[' || c == ']').to_ascii_lowercase()))
    }
}

impl HostPattern {
    /// 判断主机（不含端口）是否匹配
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_matches(|c| c == '[' || c == ']');
        match self {
            Self::Any => true,
            Self::Exact(name) => host.eq_ignore_ascii_case(name),
            Self::Suffix(suffix) => {
                let host = host.to_ascii_lowercase();
                host == *suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            Self::Network(network) => host
                .parse::<IpAddr>()
                .map(|ip| network.contains(ip))
                .unwrap_or(false),
        }
    }
}

/// 拆分 host:port，支持 `[v6]:port` 形式
pub fn split_host_port(target: &str) -> (&str, Option<u16>) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (target, None);
    }

    // 不带方括号的多个冒号视为纯 IPv6 地址
    if target.matches(':').count() > 1 {
        return (target, None);
    }

    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (target, None),
        },
        None => (target, None),
    }
}

/// 路由使用的请求摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// 请求方法（SOCKS 隧道为 CONNECT）
    pub method: Method,
    /// 目标主机（不含端口）
    pub host: String,
    /// 目标端口
    pub port: Option<u16>,
}

impl RouteRequest {
    pub fn new(method: Method, target: &str) -> Self {
        let (host, port) = split_host_port(target);
        Self {
            method,
            host: host.to_string(),
            port,
        }
    }

    /// 为 SOCKS 隧道构造的合成 CONNECT 请求
    pub fn connect(target: &str) -> Self {
        Self::new(Method::CONNECT, target)
    }
}

/// 路由规则接口
pub trait RuleMatcher: Send + Sync {
    /// 规则是否接受该请求
    fn matches(&self, request: &RouteRequest) -> bool;

    /// 命中后使用的后端名称
    fn backend(&self) -> &str;
}

/// 基于主机与方法的规则
#[derive(Debug, Clone)]
pub struct HostRule {
    hosts: Vec<HostPattern>,
    methods: Vec<Method>,
    backend: String,
}

impl HostRule {
    /// 匹配所有请求的规则
    pub fn any(backend: impl Into<String>) -> Self {
        Self {
            hosts: Vec::new(),
            methods: Vec::new(),
            backend: backend.into(),
        }
    }

    pub fn with_hosts(mut self, hosts: Vec<HostPattern>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn from_config(config: &RuleConfig) -> anyhow::Result<Self> {
        let hosts = config
            .hosts
            .iter()
            .map(|h| h.parse())
            .collect::<anyhow::Result<Vec<HostPattern>>>()?;
        let methods = config
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .with_context(|| format!("Invalid method in rule: {}", m))
            })
            .collect::<anyhow::Result<Vec<Method>>>()?;

        Ok(Self {
            hosts,
            methods,
            backend: config.backend.clone(),
        })
    }
}

impl RuleMatcher for HostRule {
    fn matches(&self, request: &RouteRequest) -> bool {
        if !self.methods.is_empty() && !self.methods.contains(&request.method) {
            return false;
        }
        self.hosts.is_empty() || self.hosts.iter().any(|p| p.matches(&request.host))
    }

    fn backend(&self) -> &str {
        &self.backend
    }
}

/// 后端路由器（每个监听端点一个）
#[derive(Clone)]
pub struct Router {
    rules: Vec<Arc<dyn RuleMatcher>>,
    registry: Arc<BackendRegistry>,
}

impl Router {
    pub fn new(rules: Vec<Arc<dyn RuleMatcher>>, registry: Arc<BackendRegistry>) -> Self {
        Self { rules, registry }
    }

    pub fn from_config(
        listener: &ListenerConfig,
        registry: Arc<BackendRegistry>,
    ) -> anyhow::Result<Self> {
        let rules = listener
            .rules
            .iter()
            .map(|r| HostRule::from_config(r).map(|rule| Arc::new(rule) as Arc<dyn RuleMatcher>))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(rules, registry))
    }

    /// 第一条命中规则的后端名称
    pub fn select(&self, request: &RouteRequest) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(request))
            .map(|rule| rule.backend())
    }

    /// 为会话解析后端，已绑定时直接返回原绑定
    pub fn resolve(
        &self,
        session: &ProxySession,
        request: &RouteRequest,
    ) -> Result<BackendBinding> {
        if let Some(binding) = session.backend() {
            return Ok(binding.clone());
        }

        let name = self.select(request).ok_or_else(|| {
            ProxyError::routing(format!(
                "no rule matched {} {}",
                request.method, request.host
            ))
        })?;
        let backend = self.registry.get(name).ok_or_else(|| {
            ProxyError::routing(format!("backend '{}' is not registered", name))
        })?;

        debug!("Session:{} rule matched backend '{}'", session.id(), name);
        let binding = session.bind(name, backend);
        info!(
            "Session:{} bound to backend '{}' for {}",
            session.id(),
            binding.name,
            request.host
        );
        Ok(binding.clone())
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("rules", &self.rules.len())
            .field("registry", &self.registry)
            .finish()
    }
}
