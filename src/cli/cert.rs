use anyhow::{Context, Result};
use std::path::Path;

use crate::mitm;

/// Generate a root CA for TLS interception
pub fn generate_ca_files(cert_out: &str, key_out: &str, common_name: &str) -> Result<()> {
    let ca = mitm::generate_ca(common_name).context("Failed to generate CA certificate")?;

    write_file(Path::new(cert_out), &ca.cert_pem, false)
        .with_context(|| format!("Failed to write CA certificate to {}", cert_out))?;
    write_file(Path::new(key_out), &ca.key_pem, true)
        .with_context(|| format!("Failed to write CA private key to {}", key_out))?;

    println!("Generated CA certificate: {}", cert_out);
    println!("Generated CA private key: {}", key_out);
    println!("Install {} as a trusted root on clients that should accept intercepted TLS", cert_out);

    Ok(())
}

/// 私钥文件只允许所有者读写
fn write_file(path: &Path, content: &str, private: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    if private {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        return file.write_all(content.as_bytes());
    }

    #[cfg(not(unix))]
    let _ = private;

    std::fs::write(path, content)
}
