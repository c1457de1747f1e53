use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Notification broker endpoint, e.g. `tcp://rackmaster:5578`.
    pub transport_url: String,
    /// Document store endpoint.
    pub store_endpoint: String,
    pub allocations_collection: String,
    pub inaugurations_collection: String,
    /// Hard cap on concurrently tracked allocations; reaching it while
    /// another allocation event arrives halts processing.
    pub max_open_allocations: usize,
    pub store_retry_interval_secs: u64,
    pub event_silence_alert_secs: u64,
    pub alert_webhook_url: Option<String>,
    pub structured_logging: bool,
    pub env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            transport_url: "tcp://localhost:5578".to_string(),
            store_endpoint: "http://localhost:9200/".to_string(),
            allocations_collection: "allocations_3".to_string(),
            inaugurations_collection: "inaugurations_4".to_string(),
            max_open_allocations: 150,
            store_retry_interval_secs: 60,
            event_silence_alert_secs: 6 * 60 * 60,
            alert_webhook_url: None,
            structured_logging: false,
            env: "local".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: ServerConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if Url::parse(&self.store_endpoint).is_err() {
            return Err(anyhow::anyhow!(
                "invalid store endpoint: {}",
                self.store_endpoint
            ));
        }
        if self.max_open_allocations == 0 {
            return Err(anyhow::anyhow!("max_open_allocations must be positive"));
        }
        if self.store_retry_interval_secs == 0 {
            return Err(anyhow::anyhow!("store_retry_interval_secs must be positive"));
        }
        Ok(())
    }

    pub fn store_endpoint_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.store_endpoint)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_open_allocations, 150);
        assert_eq!(config.store_retry_interval_secs, 60);
        assert_eq!(config.event_silence_alert_secs, 21600);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
transport_url: tcp://rackmaster:5578
store_endpoint: http://stats-db:9200/
max_open_allocations: 10
alert_webhook_url: http://alerts.internal/hook
"#;
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();
        assert_eq!(config.transport_url, "tcp://rackmaster:5578");
        assert_eq!(config.max_open_allocations, 10);
        assert_eq!(
            config.alert_webhook_url.as_deref(),
            Some("http://alerts.internal/hook")
        );
        // untouched fields keep their defaults
        assert_eq!(config.allocations_collection, "allocations_3");
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_endpoint() {
        let config = ServerConfig {
            store_endpoint: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
