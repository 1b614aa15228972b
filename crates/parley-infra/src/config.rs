//! Global configuration loader for Parley.
//!
//! Reads `config.toml` from the data directory (`~/.parley/` in production)
//! and deserializes it into [`GlobalConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use parley_types::config::GlobalConfig;

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`GlobalConfig::default()`].
/// - Unreadable or unparsable file: a warning and the default.
/// - Otherwise the parsed config, with capacities floored at 1.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Channels and semaphores cannot be sized zero.
fn normalize(mut config: GlobalConfig) -> GlobalConfig {
    config.queue_capacity = config.queue_capacity.max(1);
    config.worker_concurrency = config.worker_concurrency.max(1);
    config.event_capacity = config.event_capacity.max(1);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.aggregation_timeout_secs, 30);
        assert_eq!(config.ordinal_label, "消息{n}：");
    }

    #[tokio::test]
    async fn valid_toml_is_parsed_and_partial_fields_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
aggregation_timeout_secs = 10
worker_concurrency = 0
sweep_interval_secs = 0
bind_address = "0.0.0.0:8080"
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.aggregation_timeout_secs, 10);
        assert_eq!(config.worker_concurrency, 1);
        assert_eq!(config.sweep_interval_secs, 0);
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.queue_capacity, 1024);
    }

    #[tokio::test]
    async fn invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.aggregation_timeout_secs, 30);
        assert_eq!(config.retry_claim_ttl_secs, 300);
    }
}
