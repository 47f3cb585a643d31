//! Global configuration loader for Sagaflow.
//!
//! Reads `config.toml` from the data directory and deserializes it into
//! [`GlobalConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use sagaflow_types::config::GlobalConfig;

/// Shortest scheduler tick accepted from configuration.
const MIN_TICK_INTERVAL_MS: u64 = 10;

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`GlobalConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with out-of-range values clamped
///   (see [`sanitize`]).
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
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Clamp values the engine cannot use.
///
/// - `default_retry_count` is at least 1
/// - `backoff_max_ms` is at least `backoff_base_ms`
/// - `tick_interval_ms` is at least 10
pub fn sanitize(mut config: GlobalConfig) -> GlobalConfig {
    if config.engine.default_retry_count == 0 {
        tracing::warn!("engine.default_retry_count = 0 in config, using 1");
        config.engine.default_retry_count = 1;
    }
    if config.engine.backoff_max_ms < config.engine.backoff_base_ms {
        config.engine.backoff_max_ms = config.engine.backoff_base_ms;
    }
    config.scheduler.tick_interval_ms = config.scheduler.tick_interval_ms.max(MIN_TICK_INTERVAL_MS);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_global_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_global_config(tmp.path()).await;
        assert_eq!(config, GlobalConfig::default());
    }

    #[tokio::test]
    async fn load_global_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
default_retry_count = 5
backoff_base_ms = 250
default_step_timeout_secs = 30

[scheduler]
tick_interval_ms = 500
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.engine.default_retry_count, 5);
        assert_eq!(config.engine.backoff_base_ms, 250);
        assert_eq!(config.engine.backoff_max_ms, 30_000);
        assert_eq!(config.engine.default_step_timeout_secs, Some(30));
        assert!(config.engine.checkpoint_each_step);
        assert_eq!(config.scheduler.tick_interval_ms, 500);
    }

    #[tokio::test]
    async fn load_global_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config, GlobalConfig::default());
    }

    #[tokio::test]
    async fn load_global_config_clamps_out_of_range_values() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
default_retry_count = 0
backoff_base_ms = 5000
backoff_max_ms = 100

[scheduler]
tick_interval_ms = 0
"#,
        )
        .await
        .unwrap();

        let config = load_global_config(tmp.path()).await;
        assert_eq!(config.engine.default_retry_count, 1);
        assert_eq!(config.engine.backoff_max_ms, 5_000);
        assert_eq!(config.scheduler.tick_interval_ms, MIN_TICK_INTERVAL_MS);
    }
}
