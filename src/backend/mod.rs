mod block;
mod direct;

pub use block::BlockBackend;
pub use direct::DirectBackend;

use crate::config::{BackendConfig, BackendKind};
use crate::event::Event;
use crate::session::ProxySession;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// 后端声明的能力与限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// 可缓冲的最大请求体字节数，负数表示不限制（倾向流式）
    pub max_request_body: i64,
}

impl Features {
    /// 非负的请求体上限
    pub fn body_limit(&self) -> Option<u64> {
        u64::try_from(self.max_request_body).ok()
    }
}

impl Default for Features {
    fn default() -> Self {
        Self {
            max_request_body: -1,
        }
    }
}

/// 上游后端接口
///
/// serve 不返回处理结果：所有响应都通过会话的事件队列异步送回
#[async_trait]
pub trait Backend: Send + Sync {
    /// 处理会话的一个事件
    async fn serve(&self, session: &Arc<ProxySession>, event: Event);

    /// 后端声明的限制
    fn features(&self) -> Features;
}

/// 后端注册表（启动时构建一次，注入到连接处理器）
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据配置构建注册表
    pub fn from_config(configs: &[BackendConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let backend: Arc<dyn Backend> = match config.kind {
                BackendKind::Direct => Arc::new(DirectBackend::from_config(config)?),
                BackendKind::Block => Arc::new(BlockBackend::with_features(Features {
                    max_request_body: config.max_request_body,
                })),
            };
            info!(
                "Registered backend '{}' ({:?}, max_request_body: {})",
                config.name, config.kind, config.max_request_body
            );
            registry.register(&config.name, backend)?;
        }
        Ok(registry)
    }

    /// 注册后端，名称必须唯一
    pub fn register(&mut self, name: &str, backend: Arc<dyn Backend>) -> Result<()> {
        if self.backends.contains_key(name) {
            bail!("Duplicate backend name '{}'", name);
        }
        self.backends.insert(name.to_string(), backend);
        Ok(())
    }

    /// 按名称查找后端
    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .finish()
    }
}
