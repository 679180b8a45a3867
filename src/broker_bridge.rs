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
use anyhow::{Result, anyhow};
use mqtt_endpoint_tokio::mqtt_ep;
use mqtt_endpoint_tokio::mqtt_ep::prelude::PropertyValueAccess;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::BrokerConfig;

/// Upstream MQTT broker as seen by the engine.
///
/// Every call returns immediately. `true` means the request was handed to an
/// open broker link, not that the broker has acknowledged it.
pub trait BrokerBridge {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> bool;

    fn subscribe(&mut self, topic: &str, qos: u8) -> bool;

    fn unsubscribe(&mut self, topic: &str) -> bool;

    fn disconnect(&mut self);
}

/// Requests queued to the broker link task
#[derive(Debug)]
pub enum BrokerCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    },
    Subscribe {
        topic: String,
        qos: u8,
    },
    Unsubscribe {
        topic: String,
    },
    Disconnect,
}

/// Notifications from the broker link task to the gateway loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
    Publish {
        topic: String,
        /// Gateway filters this copy was delivered for, from its subscription
        /// identifiers. `None` when the broker did not tag the copy.
        filters: Option<Vec<String>>,
        payload: Vec<u8>,
        retain: bool,
    },
}

/// Subscription identifier per upstream topic filter.
///
/// A broker may send one copy of a message per matching subscription, so
/// every copy is attributed to the filters named by its identifiers.
#[derive(Debug, Default)]
pub struct SubscriptionIds {
    by_filter: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

impl SubscriptionIds {
    /// Identifier of `filter`, allocated on first use and stable afterwards
    pub fn assign(&mut self, filter: &str) -> u32 {
        if let Some(id) = self.by_filter.get(filter) {
            return *id;
        }
        let id = u32::try_from(self.by_filter.len() + 1).unwrap_or(u32::MAX);
        self.by_filter.insert(filter.to_string(), id);
        self.by_id.insert(id, filter.to_string());
        id
    }

    /// Filters named by `ids`; unknown identifiers are skipped
    pub fn resolve(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }
}

type SharedIds = Arc<Mutex<SubscriptionIds>>;

/// Production bridge: forwards commands to a task owning the MQTT client endpoint
pub struct MqttBridge {
    command_tx: mpsc::UnboundedSender<BrokerCommand>,
    online: Arc<AtomicBool>,
}

impl MqttBridge {
    /// Spawn the broker link task and return the bridge plus its event stream
    pub fn spawn(config: BrokerConfig) -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(false));

        let online_for_task = online.clone();
        tokio::spawn(async move {
            Self::broker_link_task(config, command_rx, event_tx, online_for_task).await;
        });

        (Self { command_tx, online }, event_rx)
    }

    fn queue(&self, command: BrokerCommand) -> bool {
        if !self.online.load(Ordering::Acquire) {
            debug!("Broker link offline, dropping {command:?}");
            return false;
        }
        self.command_tx.send(command).is_ok()
    }

    async fn broker_link_task(
        config: BrokerConfig,
        mut command_rx: mpsc::UnboundedReceiver<BrokerCommand>,
        event_tx: mpsc::UnboundedSender<BrokerEvent>,
        online: Arc<AtomicBool>,
    ) {
        trace!("Broker link task started");

        let (endpoint, sub_ids_available) = match Self::connect(&config).await {
            Ok((endpoint, sub_ids_available)) => (Arc::new(endpoint), sub_ids_available),
            Err(e) => {
                error!(
                    "Failed to connect to broker {}:{}: {e}",
                    config.address, config.port
                );
                let _ = event_tx.send(BrokerEvent::Disconnected);
                return;
            }
        };

        online.store(true, Ordering::Release);
        info!("Connected to broker {}:{}", config.address, config.port);
        if !sub_ids_available {
            warn!("Broker does not support subscription identifiers");
        }
        let _ = event_tx.send(BrokerEvent::Connected);

        let ids = SharedIds::default();
        let endpoint_for_recv = endpoint.clone();
        let online_for_recv = online.clone();
        let ids_for_recv = ids.clone();
        tokio::spawn(async move {
            Self::receive_task(endpoint_for_recv, event_tx, online_for_recv, ids_for_recv).await;
        });

        while let Some(command) = command_rx.recv().await {
            if let BrokerCommand::Disconnect = command {
                match mqtt_ep::packet::v5_0::Disconnect::builder()
                    .reason_code(mqtt_ep::result_code::DisconnectReasonCode::NormalDisconnection)
                    .build()
                {
                    Ok(disconnect) => {
                        let _ = endpoint.send(disconnect).await;
                    }
                    Err(e) => error!("Failed to build DISCONNECT: {e:?}"),
                }
                let _ = endpoint.close().await;
                info!("Disconnected from broker");
                break;
            }
            let sub_id = match &command {
                BrokerCommand::Subscribe { topic, .. } if sub_ids_available => {
                    Some(Self::lock_ids(&ids).assign(topic))
                }
                _ => None,
            };
            if let Err(e) = Self::handle_command(&endpoint, command, sub_id).await {
                warn!("Broker command failed: {e}");
            }
        }

        trace!("Broker link task finished");
    }

    fn lock_ids(ids: &SharedIds) -> std::sync::MutexGuard<'_, SubscriptionIds> {
        ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forward broker PUBLISH packets until the connection goes away
    async fn receive_task(
        endpoint: Arc<mqtt_ep::Endpoint<mqtt_ep::role::Client>>,
        event_tx: mpsc::UnboundedSender<BrokerEvent>,
        online: Arc<AtomicBool>,
        ids: SharedIds,
    ) {
        loop {
            match endpoint.recv().await {
                Ok(mqtt_ep::packet::Packet::V5_0Publish(publish)) => {
                    let sub_ids: Vec<u32> = publish
                        .props()
                        .iter()
                        .filter_map(|prop| match prop {
                            mqtt_ep::packet::Property::SubscriptionIdentifier(_) => prop.as_u32(),
                            _ => None,
                        })
                        .collect();
                    let filters = if sub_ids.is_empty() {
                        None
                    } else {
                        Some(Self::lock_ids(&ids).resolve(&sub_ids))
                    };
                    trace!(
                        "Broker PUBLISH on '{}' for {filters:?}",
                        publish.topic_name()
                    );
                    let _ = event_tx.send(BrokerEvent::Publish {
                        topic: publish.topic_name().to_string(),
                        filters,
                        payload: publish.payload().as_slice().to_vec(),
                        retain: publish.retain(),
                    });
                }
                Ok(mqtt_ep::packet::Packet::V5_0Suback(_)) => trace!("SUBACK received"),
                Ok(mqtt_ep::packet::Packet::V5_0Unsuback(_)) => trace!("UNSUBACK received"),
                Ok(mqtt_ep::packet::Packet::V5_0Puback(_)) => trace!("PUBACK received"),
                Ok(other) => trace!("Ignoring broker packet {other:?}"),
                Err(e) => {
                    warn!("Broker connection lost: {e:?}");
                    break;
                }
            }
        }
        online.store(false, Ordering::Release);
        let _ = event_tx.send(BrokerEvent::Disconnected);
    }

    /// Connect and return the endpoint plus whether the broker accepts
    /// subscription identifiers
    async fn connect(
        config: &BrokerConfig,
    ) -> Result<(mqtt_ep::Endpoint<mqtt_ep::role::Client>, bool)> {
        let stream = mqtt_ep::transport::connect_helper::connect_tcp(
            &format!("{}:{}", config.address, config.port),
            Some(Duration::from_secs(10)),
        )
        .await
        .map_err(|e| anyhow!("TCP connect failed: {e:?}"))?;

        let endpoint = mqtt_ep::Endpoint::<mqtt_ep::role::Client>::new(mqtt_ep::Version::V5_0);
        let transport = mqtt_ep::transport::TcpTransport::from_stream(stream);
        let opts = mqtt_ep::connection_option::ConnectionOption::builder()
            .auto_pub_response(true)
            .auto_ping_response(true)
            .build()
            .map_err(|e| anyhow!("Invalid connection options: {e:?}"))?;
        endpoint
            .attach_with_options(transport, mqtt_ep::Mode::Client, opts)
            .await
            .map_err(|e| anyhow!("Failed to attach transport: {e:?}"))?;

        let client_id = config.effective_client_id();
        let mut builder = mqtt_ep::packet::v5_0::Connect::builder()
            .client_id(&client_id)
            .map_err(|e| anyhow!("Invalid client id {client_id}: {e:?}"))?
            .clean_start(true)
            .keep_alive(config.keep_alive);
        if let Some(user_name) = &config.username {
            builder = builder
                .user_name(user_name)
                .map_err(|e| anyhow!("Invalid user name: {e:?}"))?;
        }
        if let Some(password) = &config.password {
            builder = builder
                .password(password.as_bytes().to_vec())
                .map_err(|e| anyhow!("Invalid password: {e:?}"))?;
        }
        if let Some(will) = &config.will {
            builder = builder
                .will_message(
                    &will.topic,
                    will.message.as_bytes().to_vec(),
                    Self::qos(will.qos),
                    will.retain,
                )
                .map_err(|e| anyhow!("Invalid gateway will: {e:?}"))?;
        }
        let connect = builder
            .build()
            .map_err(|e| anyhow!("Failed to build CONNECT: {e:?}"))?;
        endpoint
            .send(connect)
            .await
            .map_err(|e| anyhow!("Failed to send CONNECT: {e:?}"))?;

        let sub_ids_available = match endpoint
            .recv()
            .await
            .map_err(|e| anyhow!("Failed to receive CONNACK: {e:?}"))?
        {
            mqtt_ep::packet::Packet::V5_0Connack(connack) => {
                if connack.reason_code() != mqtt_ep::result_code::ConnectReasonCode::Success {
                    return Err(anyhow!("Broker rejected CONNECT: {:?}", connack.reason_code()));
                }
                // absent means available
                connack
                    .props()
                    .iter()
                    .find_map(|prop| match prop {
                        mqtt_ep::packet::Property::SubscriptionIdentifierAvailable(_) => {
                            prop.as_u8()
                        }
                        _ => None,
                    })
                    .is_none_or(|available| available != 0)
            }
            other => return Err(anyhow!("Expected CONNACK, got {other:?}")),
        };

        Ok((endpoint, sub_ids_available))
    }

    fn qos(qos: u8) -> mqtt_ep::packet::Qos {
        match qos {
            0 => mqtt_ep::packet::Qos::AtMostOnce,
            1 => mqtt_ep::packet::Qos::AtLeastOnce,
            _ => mqtt_ep::packet::Qos::ExactlyOnce,
        }
    }

    async fn handle_command(
        endpoint: &mqtt_ep::Endpoint<mqtt_ep::role::Client>,
        command: BrokerCommand,
        sub_id: Option<u32>,
    ) -> Result<()> {
        match command {
            BrokerCommand::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                let mut builder = mqtt_ep::packet::v5_0::Publish::builder()
                    .topic_name(&topic)
                    .map_err(|e| anyhow!("Invalid topic '{topic}': {e:?}"))?
                    .qos(Self::qos(qos))
                    .retain(retain)
                    .payload(payload);
                if qos > 0 {
                    let packet_id = endpoint
                        .acquire_packet_id()
                        .await
                        .map_err(|e| anyhow!("Failed to acquire packet_id: {e:?}"))?;
                    builder = builder.packet_id(packet_id);
                }
                let publish = builder
                    .build()
                    .map_err(|e| anyhow!("Failed to build PUBLISH: {e:?}"))?;
                endpoint
                    .send(publish)
                    .await
                    .map_err(|e| anyhow!("Failed to send PUBLISH: {e:?}"))?;
                debug!("Forwarded PUBLISH to broker topic='{topic}' qos={qos}");
            }
            BrokerCommand::Subscribe { topic, qos } => {
                let packet_id = endpoint
                    .acquire_packet_id()
                    .await
                    .map_err(|e| anyhow!("Failed to acquire packet_id: {e:?}"))?;
                let sub_opts = mqtt_ep::packet::SubOpts::new().set_qos(Self::qos(qos));
                let sub_entry = mqtt_ep::packet::SubEntry::new(&topic, sub_opts)
                    .map_err(|e| anyhow!("Invalid topic filter '{topic}': {e:?}"))?;
                let mut props = Vec::new();
                if let Some(sub_id) = sub_id {
                    let sub_id = mqtt_ep::packet::SubscriptionIdentifier::new(sub_id)
                        .map_err(|e| anyhow!("Invalid subscription identifier {sub_id}: {e:?}"))?;
                    props.push(mqtt_ep::packet::Property::SubscriptionIdentifier(sub_id));
                }
                let subscribe = mqtt_ep::packet::v5_0::Subscribe::builder()
                    .packet_id(packet_id)
                    .entries(vec![sub_entry])
                    .props(props)
                    .build()
                    .map_err(|e| anyhow!("Failed to build SUBSCRIBE: {e:?}"))?;
                endpoint
                    .send(subscribe)
                    .await
                    .map_err(|e| anyhow!("Failed to send SUBSCRIBE: {e:?}"))?;
                debug!("Subscribed broker topic='{topic}' qos={qos} sub_id={sub_id:?}");
            }
            BrokerCommand::Unsubscribe { topic } => {
                let packet_id = endpoint
                    .acquire_packet_id()
                    .await
                    .map_err(|e| anyhow!("Failed to acquire packet_id: {e:?}"))?;
                let unsubscribe = mqtt_ep::packet::v5_0::Unsubscribe::builder()
                    .packet_id(packet_id)
                    .entries(vec![topic.as_str()])
                    .map_err(|e| anyhow!("Invalid topic filter '{topic}': {e:?}"))?
                    .build()
                    .map_err(|e| anyhow!("Failed to build UNSUBSCRIBE: {e:?}"))?;
                endpoint
                    .send(unsubscribe)
                    .await
                    .map_err(|e| anyhow!("Failed to send UNSUBSCRIBE: {e:?}"))?;
                debug!("Unsubscribed broker topic='{topic}'");
            }
            BrokerCommand::Disconnect => {}
        }
        Ok(())
    }
}

impl BrokerBridge for MqttBridge {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> bool {
        self.queue(BrokerCommand::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        })
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> bool {
        self.queue(BrokerCommand::Subscribe {
            topic: topic.to_string(),
            qos,
        })
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        self.queue(BrokerCommand::Unsubscribe {
            topic: topic.to_string(),
        })
    }

    fn disconnect(&mut self) {
        let _ = self.command_tx.send(BrokerCommand::Disconnect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_ids_are_stable() {
        let mut ids = SubscriptionIds::default();
        let room = ids.assign("room/#");
        let temp = ids.assign("room/temp");
        assert_ne!(room, temp);
        assert_eq!(ids.assign("room/#"), room);
        assert_eq!(
            ids.resolve(&[temp, 99, room]),
            vec!["room/temp".to_string(), "room/#".to_string()]
        );
    }
}
