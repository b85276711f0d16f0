use anyhow::{Context, Result};

use crate::config::AppConfig;

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    let content = AppConfig::template();

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", content);
    }

    Ok(())
}
