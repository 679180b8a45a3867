// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

use crate::session_store::StoreLimits;

fn default_gateway_id() -> u8 {
    2
}

fn default_advertise_duration() -> u16 {
    900
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_max_message_length() -> usize {
    255
}

fn default_broker_address() -> String {
    "127.0.0.1".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> u16 {
    60
}

/// Gateway configuration file contents
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Announced in ADVERTISE and GWINFO; 0 disables SEARCHGW answers
    #[serde(default = "default_gateway_id")]
    pub gateway_id: u8,
    /// ADVERTISE period in seconds
    #[serde(default = "default_advertise_duration")]
    pub advertise_duration: u16,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub predefined_topics: Vec<PredefinedTopic>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: default_gateway_id(),
            advertise_duration: default_advertise_duration(),
            heartbeat_ms: default_heartbeat_ms(),
            max_message_length: default_max_message_length(),
            broker: BrokerConfig::default(),
            limits: LimitsConfig::default(),
            predefined_topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_address")]
    pub address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Published by the broker if the gateway disappears, and by the gateway
    /// itself when the MQTT-SN side goes down
    #[serde(default)]
    pub will: Option<WillConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            port: default_broker_port(),
            client_id: None,
            keep_alive: default_keep_alive(),
            username: None,
            password: None,
            will: None,
        }
    }
}

impl BrokerConfig {
    /// Configured client id, or a generated `mqttsn-gw-<uuid>`
    pub fn effective_client_id(&self) -> String {
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("mqttsn-gw-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WillConfig {
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_clients: usize,
    pub max_registrations_per_client: usize,
    pub max_subscriptions_per_client: usize,
    pub max_publishes_per_client: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = StoreLimits::default();
        Self {
            max_clients: limits.max_clients,
            max_registrations_per_client: limits.max_registrations_per_client,
            max_subscriptions_per_client: limits.max_subscriptions_per_client,
            max_publishes_per_client: limits.max_publishes_per_client,
        }
    }
}

impl From<LimitsConfig> for StoreLimits {
    fn from(limits: LimitsConfig) -> Self {
        Self {
            max_clients: limits.max_clients,
            max_registrations_per_client: limits.max_registrations_per_client,
            max_subscriptions_per_client: limits.max_subscriptions_per_client,
            max_publishes_per_client: limits.max_publishes_per_client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredefinedTopic {
    pub id: u16,
    pub name: String,
}

impl GatewayConfig {
    /// Load a JSON5 configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        let config = Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(
            "Loaded gateway config from {} ({} predefined topic(s))",
            path.display(),
            config.predefined_topics.len()
        );
        Ok(config)
    }

    /// Parse JSON5 text; comments are part of the syntax
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .context("config is not valid UTF-8")?;
        let config: Self = json5::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_ms == 0 {
            anyhow::bail!("heartbeat_ms must be greater than 0");
        }
        if self.max_message_length <= crate::packet::PUBLISH_HEADER_LEN {
            anyhow::bail!(
                "max_message_length {} leaves no room for a PUBLISH payload",
                self.max_message_length
            );
        }
        for (i, topic) in self.predefined_topics.iter().enumerate() {
            if topic.name.is_empty() {
                anyhow::bail!("predefined topic {} has an empty name", topic.id);
            }
            if self.predefined_topics[..i].iter().any(|t| t.id == topic.id) {
                anyhow::bail!("predefined topic id {} is defined twice", topic.id);
            }
        }
        Ok(())
    }

    pub fn store_limits(&self) -> StoreLimits {
        self.limits.into()
    }
}
