use anyhow::Result;
use serde::Serialize;

use crate::config::{expand_path, AppConfig, BackendKind};

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// 配置中值得提示但不阻止启动的问题
fn collect_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if let Some(mitm) = &config.mitm {
        match (&mitm.ca_cert, &mitm.ca_key) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    warnings.push(format!("CA certificate file not found: {:?}", cert));
                }
                if !key.exists() {
                    warnings.push(format!("CA key file not found: {:?}", key));
                }
            }
            _ => warnings.push(
                "No CA files configured: an ephemeral CA will be generated at startup".to_string(),
            ),
        }
        if !config.needs_mitm() {
            warnings.push("[mitm] is configured but no backend intercepts any host".to_string());
        }
    }

    for backend in &config.backends {
        if backend.kind == BackendKind::Block && !backend.intercept.is_empty() {
            warnings.push(format!(
                "Backend '{}': intercept is ignored for block backends",
                backend.name
            ));
        }
    }

    for listener in &config.listeners {
        let host = listener.local.rsplit_once(':').map(|(h, _)| h).unwrap_or("");
        if host == "0.0.0.0" || host == "[::]" {
            warnings.push(format!(
                "Listener {} is reachable from the network; anyone who can connect can use the proxy",
                listener.local
            ));
        }
    }

    warnings
}

fn details(config: &AppConfig) -> serde_json::Value {
    let backends: Vec<_> = config
        .backends
        .iter()
        .map(|b| {
            serde_json::json!({
                "name": b.name,
                "kind": b.kind,
                "intercept": b.intercept,
                "max_request_body": b.max_request_body,
            })
        })
        .collect();
    let listeners: Vec<_> = config
        .listeners
        .iter()
        .map(|l| {
            serde_json::json!({
                "local": l.local,
                "rules": l.rules.len(),
            })
        })
        .collect();

    serde_json::json!({
        "mitm": config.mitm.is_some(),
        "backends": backends,
        "listeners": listeners,
    })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = expand_path(config_path)?;

    if !path.exists() {
        let message = format!("Configuration file not found: {}", path.display());
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(message.clone()),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ {}", message);
        }
        anyhow::bail!(message);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", path.display());
    }

    match AppConfig::load(&path.to_string_lossy()) {
        Ok(config) => {
            let warnings = collect_warnings(&config);

            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: details(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✓ Number of backends: {}", config.backends.len());
                for backend in &config.backends {
                    println!(
                        "  Backend '{}' ({:?}, max_request_body={}, intercept={})",
                        backend.name,
                        backend.kind,
                        backend.max_request_body,
                        backend.intercept.len()
                    );
                }
                println!("✓ Number of listeners: {}", config.listeners.len());
                for listener in &config.listeners {
                    println!("  Listener {} ({} rules)", listener.local, listener.rules.len());
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Every [[listeners.rules]] backend must name a [[backends]] entry");
                println!("  3. Listener addresses must be ip:port, e.g. 127.0.0.1:48100");
                println!("  4. Backends with intercept patterns need a [mitm] section");
            }

            Err(e)
        }
    }
}
