//! Configuration types for the fleet sync service

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::circuit::CircuitConfig;
use crate::classifier::{EndpointPolicy, NotFoundPolicy};
use crate::dispatcher::DispatchPolicy;
use crate::queue::QueueConfig;
use crate::stream::StreamConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    /// Default retry policy for reads
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub sections: Vec<SectionConfig>,
    /// Event stream; no stream is opened when absent
    #[serde(default)]
    pub stream: Option<StreamConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

/// Where the device backend lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Ceiling for a single request; expiry is a transient failure
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// One dashboard section backed by one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionConfig {
    pub name: String,
    pub path: String,
    /// Circuit key; defaults to the section name
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Load once when absent
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    #[serde(default)]
    pub not_found: NotFoundPolicy,
    /// Overrides the top-level retry policy
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Stream topics that trigger a refresh; defaults to the section name
    #[serde(default)]
    pub topics: Vec<String>,
}

impl SectionConfig {
    pub fn endpoint_key(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(&self.name)
    }

    pub fn dispatch_policy(&self, default_retry: &RetryPolicy) -> DispatchPolicy {
        DispatchPolicy::new(
            self.retry.clone().unwrap_or_else(|| default_retry.clone()),
            EndpointPolicy {
                not_found: self.not_found,
            },
        )
    }

    pub fn listens_to(&self, topic: &str) -> bool {
        if self.topics.is_empty() {
            topic == self.name
        } else {
            self.topics.iter().any(|t| t == topic)
        }
    }
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_dashboard_port(),
        }
    }
}

impl Config {
    /// Reject configurations that would fail at runtime
    pub fn validate(&self) -> crate::Result<()> {
        if self.backend.base_url.trim().is_empty() {
            return Err(crate::FleetSyncError::Config(
                "backend.base_url must not be empty".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for section in &self.sections {
            if !names.insert(section.name.as_str()) {
                return Err(crate::FleetSyncError::Config(format!(
                    "Duplicate section name '{}'",
                    section.name
                )));
            }
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_true() -> bool {
    true
}

fn default_dashboard_port() -> u16 {
    11130
}

/// Load configuration from a JSON file
pub fn load_config(path: &Path) -> crate::Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::FleetSyncError::Config(format!("Failed to read config file {:?}: {}", path, e))
    })?;
    let config: Config = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
