/// split-tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod backend;
pub mod cli;
pub mod config;
pub mod conn;
pub mod error;
pub mod event;
pub mod mitm;
pub mod queue;
pub mod routing;
pub mod server;
pub mod session;
pub mod socks;
pub mod stream;
pub mod wire;

// 重新导出常用类型
pub use backend::{Backend, BackendRegistry, BlockBackend, DirectBackend, Features};
pub use config::AppConfig;
pub use conn::{serve_proxy_conn, ConnContext};
pub use error::{ProxyError, Result};
pub use event::{Event, HttpRequestEvent, HttpResponseEvent, Payload, SessionId};
pub use mitm::{CaCertProvider, CertProvider};
pub use queue::{EventQueue, QueueError, POLL_INTERVAL};
pub use routing::{HostPattern, HostRule, Router, RuleMatcher};
pub use server::ProxyServer;
pub use session::{BackendBinding, ProxySession, SessionState};
