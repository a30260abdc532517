//! Gateway configuration file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use giztoy_mqttsn::{GatewayConfig, PredefinedTopics};
use serde::Deserialize;

/// Configuration file format.
///
/// ```yaml
/// listen: 0.0.0.0:1884
/// broker: 127.0.0.1:1883
/// retry:
///   delay_secs: 10
///   count: 3
/// predefined:
///   - client: "*"
///     id: 1
///     topic: sensors/temp
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub broker: Option<String>,
    pub gateway_id: Option<u8>,
    pub auth: bool,
    pub connect_timeout_secs: Option<u64>,
    pub retry: Option<RetryEntry>,
    pub max_topic_aliases: Option<u16>,
    pub anonymous_prefix: Option<String>,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub predefined: Vec<PredefinedEntry>,
}

#[derive(Debug, Deserialize)]
pub struct RetryEntry {
    pub delay_secs: u64,
    pub count: u32,
}

/// Predefined topic entry. `client: "*"` applies to every client.
#[derive(Debug, Deserialize)]
pub struct PredefinedEntry {
    #[serde(default = "any_client")]
    pub client: String,
    pub id: u16,
    pub topic: String,
}

fn any_client() -> String {
    giztoy_mqttsn::topics::ANY_CLIENT.to_string()
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Build the gateway config; command line addresses win over the file.
    pub fn into_gateway(
        self,
        listen: Option<String>,
        broker: Option<String>,
    ) -> Result<GatewayConfig> {
        let listen = listen
            .or(self.listen)
            .unwrap_or_else(|| "0.0.0.0:1884".to_string());
        let broker = broker
            .or(self.broker)
            .unwrap_or_else(|| "127.0.0.1:1883".to_string());

        let mut config = GatewayConfig::new(listen, broker).with_auth(self.auth);
        if let Some(id) = self.gateway_id {
            config = config.with_gateway_id(id);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(retry) = self.retry {
            anyhow::ensure!(retry.delay_secs > 0, "retry.delay_secs must be positive");
            config = config.with_retry(Duration::from_secs(retry.delay_secs), retry.count);
        }
        if let Some(max) = self.max_topic_aliases {
            config = config.with_max_topic_aliases(max);
        }
        if let Some(prefix) = self.anonymous_prefix {
            config = config.with_anonymous_prefix(prefix);
        }
        if let Some(username) = self.broker_username {
            let password = self.broker_password.unwrap_or_default();
            config = config.with_broker_credentials(username, password);
        }

        let mut predefined = PredefinedTopics::new();
        for entry in &self.predefined {
            anyhow::ensure!(entry.id != 0, "predefined topic {} uses reserved id 0", entry.topic);
            predefined.insert(&entry.client, entry.id, &entry.topic);
        }
        Ok(config.with_predefined(predefined))
    }
}
