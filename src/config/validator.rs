use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::warn;

use super::{AppConfig, BackendConfig, BackendKind, ListenerConfig, MitmConfig};
use crate::routing::{split_host_port, HostPattern};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证监听地址
    ///
    /// 接受 `ip:port` 或 `host:port`（主机名在绑定时解析），
    /// 返回用于重复检查的规范化 (主机, 端口)
    pub fn validate_listen_addr(addr: &str, context: &str) -> Result<(String, u16)> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        if let Ok(parsed) = addr.parse::<SocketAddr>() {
            return Ok((parsed.ip().to_string(), parsed.port()));
        }

        let (host, port) = split_host_port(addr);
        let port = port.with_context(|| format!("{}: listen address '{}' needs a port", context, addr))?;
        if !is_hostname(host) {
            bail!("{}: invalid listen host '{}' in '{}'", context, host, addr);
        }
        Ok((host.to_ascii_lowercase(), port))
    }

    /// 验证主机模式列表
    pub fn validate_patterns(patterns: &[String], context: &str) -> Result<()> {
        for pattern in patterns {
            pattern
                .parse::<HostPattern>()
                .with_context(|| format!("{}: invalid host pattern '{}'", context, pattern))?;
        }
        Ok(())
    }

    /// 验证后端列表
    pub fn validate_backends(backends: &[BackendConfig]) -> Result<()> {
        let mut seen_names = HashSet::new();

        for backend in backends {
            Self::validate_name(&backend.name, "Backend name")?;

            if !seen_names.insert(backend.name.as_str()) {
                bail!(
                    "Duplicate backend name '{}': each backend must have a unique name",
                    backend.name
                );
            }

            let context = format!("Backend '{}'", backend.name);
            Self::validate_patterns(&backend.intercept, &context)?;

            if backend.kind == BackendKind::Block && !backend.intercept.is_empty() {
                warn!("{}: intercept is ignored for block backends", context);
            }
            if backend.kind == BackendKind::Direct && backend.connect_timeout_secs == 0 {
                bail!("{}: connect_timeout_secs must be greater than 0", context);
            }
        }

        Ok(())
    }

    /// 验证监听端点列表
    pub fn validate_listeners(listeners: &[ListenerConfig], backends: &[BackendConfig]) -> Result<()> {
        if listeners.is_empty() {
            bail!("No listeners defined");
        }

        let names: HashSet<&str> = backends.iter().map(|b| b.name.as_str()).collect();
        let mut seen_addrs = HashSet::new();

        for listener in listeners {
            let (host, port) = Self::validate_listen_addr(&listener.local, "Listener")?;

            // 端口 0 每次绑定都会得到不同端口，不参与重复检查
            if port != 0 && !seen_addrs.insert((host, port)) {
                bail!(
                    "Duplicate listener address {}: each listener must use a different address",
                    listener.local
                );
            }

            if listener.rules.is_empty() {
                bail!("Listener {}: at least one rule is required", listener.local);
            }

            for (idx, rule) in listener.rules.iter().enumerate() {
                let context = format!("Listener {} rule #{}", listener.local, idx + 1);
                if !names.contains(rule.backend.as_str()) {
                    bail!("{}: unknown backend '{}'", context, rule.backend);
                }
                Self::validate_patterns(&rule.hosts, &context)?;
                for method in &rule.methods {
                    http::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                        .with_context(|| format!("{}: invalid method '{}'", context, method))?;
                }
            }
        }

        Ok(())
    }

    /// 验证 CA 配置
    pub fn validate_mitm_config(config: &MitmConfig) -> Result<()> {
        match (&config.ca_cert, &config.ca_key) {
            (Some(_), Some(_)) | (None, None) => Ok(()),
            _ => bail!("mitm.ca_cert and mitm.ca_key must both be set, or both omitted to auto-generate"),
        }
    }

    /// 验证完整配置
    pub fn validate_app_config(config: &AppConfig) -> Result<()> {
        Self::validate_backends(&config.backends)?;
        Self::validate_listeners(&config.listeners, &config.backends)?;

        match &config.mitm {
            Some(mitm) => Self::validate_mitm_config(mitm)?,
            None if config.needs_mitm() => {
                bail!("Backends with intercept patterns require a [mitm] section")
            }
            None => {}
        }

        Ok(())
    }
}

fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
