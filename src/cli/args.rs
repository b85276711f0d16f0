use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "split-tunnel")]
#[command(author, version, about = "Local SOCKS/HTTP proxy front end with per-host routing and TLS interception", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动代理监听端点
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "split-tunnel.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成 TLS 拦截使用的根 CA
    Ca {
        /// CA 证书输出路径
        #[arg(long, value_name = "PATH", default_value = "ca.pem")]
        cert_out: String,

        /// CA 私钥输出路径
        #[arg(long, value_name = "PATH", default_value = "ca.key")]
        key_out: String,

        /// CA 的 Common Name
        #[arg(long, default_value = "split-tunnel Root CA")]
        common_name: String,
    },
    /// 输出示例配置
    Template {
        /// 输出文件路径（默认输出到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}
