use anyhow::Result;
use colored::Colorize;
use lake_gateway::config::{self, CacheBackend, Config};
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Displays the effective configuration with secrets masked
pub fn show(path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(path)?;
    let sanitized = sanitize_secrets(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&sanitized)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
pub fn validate(path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());
    info!("Validating configuration");

    let cfg = config::load_config(path)?;

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  Listen: {}:{}", cfg.server.host, cfg.server.port);
    println!("  Cache: {}", describe_cache(&cfg));
    println!("  Auth service: {}", cfg.auth.address);
    println!(
        "  Access log: {}",
        if cfg.access_log.enabled { "enabled" } else { "disabled" }
    );

    Ok(())
}

/// Mask secrets for safe display
fn sanitize_secrets(cfg: &Config) -> Config {
    let mut sanitized = cfg.clone();
    if !sanitized.cache.password.is_empty() {
        sanitized.cache.password = mask_secret(&sanitized.cache.password);
    }
    sanitized
}

/// Shows the first and last 2 characters with asterisks in between
/// Example: "s3cr3t-password" -> "s3...rd"
fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 || !secret.is_ascii() {
        return "***".to_string();
    }

    let prefix = &secret[..2];
    let suffix = &secret[secret.len() - 2..];

    format!("{}...{}", prefix, suffix)
}

fn describe_cache(cfg: &Config) -> String {
    match cfg.cache.backend {
        CacheBackend::Redis => format!("redis cluster at {}", cfg.cache.address()),
        CacheBackend::Memory => "in-process memory".to_string(),
    }
}
