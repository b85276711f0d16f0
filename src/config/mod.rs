// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 由本进程直接连接目标
    #[default]
    Direct,
    /// 拒绝所有请求
    Block,
}

/// 后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 后端名称（规则通过名称引用）
    pub name: String,
    #[serde(default)]
    pub kind: BackendKind,
    /// 需要 TLS 拦截的 CONNECT 主机（仅 direct 后端）
    #[serde(default)]
    pub intercept: Vec<String>,
    /// 可缓冲的最大请求体字节数，负数表示不限制
    #[serde(default = "default_max_request_body")]
    pub max_request_body: i64,
    /// 上游连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_max_request_body() -> i64 {
    -1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// 路由规则配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// 主机模式：精确域名、*.后缀、* 或 CIDR；为空匹配所有主机
    #[serde(default)]
    pub hosts: Vec<String>,
    /// 方法过滤；为空匹配所有方法
    #[serde(default)]
    pub methods: Vec<String>,
    /// 命中后使用的后端名称
    pub backend: String,
}

/// 监听端点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// 本地监听地址（ip:port 或 host:port，主机名在绑定时解析）
    pub local: String,
    /// 按顺序匹配的路由规则
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// TLS 拦截使用的根 CA
///
/// 两个路径都省略时运行时生成临时 CA
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MitmConfig {
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub ca_key: Option<PathBuf>,
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mitm: Option<MitmConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

impl AppConfig {
    /// 从文件加载并验证配置
    pub fn load(path: &str) -> Result<Self> {
        let path = expand_path(path)?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.expand_paths()?;
        Ok(config)
    }

    /// 从 TOML 文本解析并验证配置
    pub fn parse(content: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_app_config(self)
    }

    /// 是否有后端需要 TLS 拦截
    pub fn needs_mitm(&self) -> bool {
        self.backends.iter().any(|b| !b.intercept.is_empty())
    }

    fn expand_paths(&mut self) -> Result<()> {
        if let Some(mitm) = self.mitm.as_mut() {
            if let Some(cert) = mitm.ca_cert.as_mut() {
                *cert = expand_path(&cert.to_string_lossy())?;
            }
            if let Some(key) = mitm.ca_key.as_mut() {
                *key = expand_path(&key.to_string_lossy())?;
            }
        }
        Ok(())
    }

    /// 带注释的示例配置
    pub fn template() -> &'static str {
        TEMPLATE
    }
}

/// 展开 ~ 并转为绝对路径
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(path_buf)
    } else {
        Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path_buf))
    }
}

const TEMPLATE: &str = r#"# split-tunnel 配置示例

# TLS 拦截使用的根 CA（用 `split-tunnel ca` 生成）
# 两项都省略时启动时生成临时 CA，客户端需要另行信任
[mitm]
ca_cert = "~/.split-tunnel/ca.pem"
ca_key = "~/.split-tunnel/ca.key"

# 直连后端
[[backends]]
name = "direct"
kind = "direct"
# CONNECT 到这些主机时做 TLS 拦截
intercept = ["*.example.com"]
# 最大缓冲请求体（字节），-1 表示不限制，chunked 请求体将流式转发
max_request_body = -1
connect_timeout_secs = 10

# 拒绝后端
[[backends]]
name = "reject"
kind = "block"

# local 可以是 ip:port，也可以是 host:port（如 localhost:48100）
[[listeners]]
local = "127.0.0.1:48100"

# 规则按顺序匹配，第一条命中的规则决定后端
[[listeners.rules]]
hosts = ["ads.example.net", "*.tracker.example"]
backend = "reject"

[[listeners.rules]]
hosts = ["10.0.0.0/8", "*.example.com"]
methods = ["GET", "POST", "CONNECT"]
backend = "direct"

# 兜底规则
[[listeners.rules]]
backend = "direct"
"#;
