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
use std::fmt;
use tracing::{debug, error, info, trace, warn};

use crate::broker_bridge::BrokerBridge;
use crate::config::{GatewayConfig, WillConfig};
use crate::packet::{Message, MessageType, ReturnCode};
use crate::session_store::{ClientStatus, DeviceAddress, SessionStore, StoreError};
use crate::system::System;
use crate::transport::Transport;

mod pub_impl;
mod sub_impl;
mod sweep_impl;

pub use pub_impl::PublishOutcome;
pub use sub_impl::topic_filter_matches;

/// Non-success engine result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Unspecified failure
    Zero,
    Full,
    ClientNonexistence,
    TopicIdNonexistence,
    ClientSubscriptionFull,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Zero => write!(f, "operation failed"),
            CoreError::Full => write!(f, "no capacity left"),
            CoreError::ClientNonexistence => write!(f, "client does not exist"),
            CoreError::TopicIdNonexistence => write!(f, "topic id does not exist"),
            CoreError::ClientSubscriptionFull => write!(f, "client subscription table full"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<StoreError> for CoreError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => CoreError::ClientNonexistence,
            StoreError::Full => CoreError::Full,
            StoreError::SubscriptionFull => CoreError::ClientSubscriptionFull,
            StoreError::TopicIdNonexistence => CoreError::TopicIdNonexistence,
            StoreError::Failed => CoreError::Zero,
        }
    }
}

pub type CoreResult<T = ()> = Result<T, CoreError>;

/// Gateway wide settings the engine needs at runtime
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub gateway_id: u8,
    /// Seconds, carried in ADVERTISE
    pub advertise_duration: u16,
    pub gateway_will: Option<WillConfig>,
}

impl From<&GatewayConfig> for EngineConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            gateway_id: config.gateway_id,
            advertise_duration: config.advertise_duration,
            gateway_will: config.broker.will.clone(),
        }
    }
}

/// Keepalive tolerance in milliseconds: +10% above one minute, +50% otherwise
pub fn keepalive_tolerance(duration: u32) -> u64 {
    let duration = u64::from(duration);
    if duration > 60_000 {
        duration + duration / 10
    } else {
        duration + duration / 2
    }
}

/// Session lifecycle engine.
///
/// Every client facing operation opens exactly one store transaction, decides
/// the outcome and only talks to the broker or the transport after the
/// transaction committed.
pub struct Engine<B, T, S> {
    store: SessionStore,
    broker: B,
    transport: T,
    system: S,
    config: EngineConfig,
}

impl<B, T, S> Engine<B, T, S>
where
    B: BrokerBridge,
    T: Transport,
    S: System,
{
    pub fn new(store: SessionStore, broker: B, transport: T, system: S, config: EngineConfig) -> Self {
        Self {
            store,
            broker,
            transport,
            system,
            config,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SessionStore {
        &mut self.store
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Encode and send one message. A transport failure takes the MQTT-SN
    /// link down.
    pub fn send_message(&mut self, address: &DeviceAddress, message: &Message) -> bool {
        let bytes = message.encode();
        if bytes.len() > self.transport.max_message_length() {
            warn!(
                "Dropping {:?} to {address}: {} bytes exceeds the maximum message length",
                message.message_type(),
                bytes.len()
            );
            return false;
        }
        trace!("-> {address} {message:?}");
        if self.transport.send(address, &bytes) {
            true
        } else {
            error!("Transport send to {address} failed");
            self.notify_mqttsn_disconnected();
            false
        }
    }

    pub fn notify_mqtt_connected(&mut self) {
        info!("MQTT broker link is up");
        self.store.set_mqtt_online(true);
        for topic in self.store.subscribed_topics() {
            if !self.broker.subscribe(&topic, 1) {
                warn!("Failed to restore broker subscription for '{topic}'");
            } else {
                debug!("Restored broker subscription for '{topic}'");
            }
        }
    }

    pub fn notify_mqtt_disconnected(&mut self) {
        if self.store.is_mqtt_online() {
            warn!("MQTT broker link is down");
        }
        self.store.set_mqtt_online(false);
    }

    pub fn notify_mqttsn_connected(&mut self) {
        info!("MQTT-SN link is up");
        self.store.set_mqttsn_online(true);
    }

    pub fn notify_mqttsn_disconnected(&mut self) {
        if self.store.is_mqttsn_online() {
            warn!("MQTT-SN link is down");
        }
        self.store.set_mqttsn_online(false);
    }

    /// Broadcast ADVERTISE while both links are usable
    pub fn advertise(&mut self) {
        if !self.store.is_mqtt_online() || !self.store.is_mqttsn_online() {
            return;
        }
        let broadcast = self.transport.broadcast_address();
        let message = Message::Advertise {
            gateway_id: self.config.gateway_id,
            duration: self.config.advertise_duration,
        };
        debug!("Advertising gateway {} on {broadcast}", self.config.gateway_id);
        self.send_message(&broadcast, &message);
    }

    /// Create or reconnect the session for `client_id`. `duration` is the
    /// keepalive in seconds.
    pub fn add_client(
        &mut self,
        client_id: &str,
        duration: u16,
        clean_session: bool,
        address: &DeviceAddress,
    ) -> CoreResult {
        if !self.store.is_mqtt_online() {
            warn!("Rejecting CONNECT from {client_id}: broker link is down");
            return Err(CoreError::Zero);
        }
        let duration = u32::from(duration) * 1000;
        self.release_stale_address(client_id, address);
        let mut unsubscribe = Vec::new();

        let mut tx = self.store.begin_by_client_id(client_id);
        if tx.client_exists() {
            if clean_session {
                let topics: Vec<String> = tx
                    .subscriptions()
                    .iter()
                    .map(|s| s.topic_name.clone())
                    .collect();
                for topic in topics {
                    tx.delete_subscription(&topic);
                    if tx.decrement_subscription_count(&topic) == 0 {
                        unsubscribe.push(topic);
                    }
                }
                tx.delete_client();
                tx.add_client(client_id, address, duration);
            } else {
                tx.reset_client(address, duration);
            }
        } else {
            tx.add_client(client_id, address, duration);
        }

        match tx.commit() {
            Ok(()) => {
                for topic in unsubscribe {
                    debug!("Last subscriber of '{topic}' gone, unsubscribing from broker");
                    if !self.broker.unsubscribe(&topic) {
                        warn!("Broker unsubscribe of '{topic}' failed");
                    }
                }
                info!(
                    "Client {client_id} connected from {address} (clean_session={clean_session}, keepalive={duration} ms)"
                );
                Ok(())
            }
            Err(StoreError::Full) => {
                warn!("Client table full, rejecting {client_id}");
                Err(CoreError::Full)
            }
            Err(e) => {
                warn!("Failed to add client {client_id}: {e}");
                Err(CoreError::Zero)
            }
        }
    }

    /// Evict a DISCONNECTED or LOST session of another client bound to
    /// `address`, so a reused address can connect. A connected holder is left
    /// alone and the later commit rejects the CONNECT.
    fn release_stale_address(&mut self, client_id: &str, address: &DeviceAddress) {
        let mut tx = self.store.begin_by_address(address);
        let stale = tx.client_id().is_some_and(|id| id != client_id)
            && matches!(tx.status(), ClientStatus::Disconnected | ClientStatus::Lost);
        if !stale {
            return;
        }
        let previous = tx.client_id().unwrap_or_default().to_string();
        let topics: Vec<String> = tx
            .subscriptions()
            .iter()
            .map(|s| s.topic_name.clone())
            .collect();
        let mut unsubscribe = Vec::new();
        for topic in topics {
            tx.delete_subscription(&topic);
            if tx.decrement_subscription_count(&topic) == 0 {
                unsubscribe.push(topic);
            }
        }
        tx.delete_client();
        if let Err(e) = tx.commit() {
            warn!("Failed to evict session {previous} at {address}: {e}");
            return;
        }
        info!("Evicted session {previous} to free {address} for {client_id}");
        for topic in unsubscribe {
            if !self.broker.unsubscribe(&topic) {
                warn!("Broker unsubscribe of '{topic}' failed");
            }
        }
    }

    /// Set the message the client is expected to send next
    pub fn await_message(&mut self, address: &DeviceAddress, message_type: MessageType) -> CoreResult {
        let mut tx = self.store.begin_by_address(address);
        tx.set_awaited_message(message_type);
        tx.commit().map_err(CoreError::from)
    }

    /// WILLTOPIC during CONNECT. An empty topic clears the will and completes
    /// the handshake; otherwise WILLMSG is expected next.
    pub fn add_will_topic(
        &mut self,
        address: &DeviceAddress,
        topic: &str,
        qos: u8,
        retain: bool,
    ) -> CoreResult {
        if !self.store.is_mqtt_online() {
            return Err(CoreError::Zero);
        }
        let mut tx = self.store.begin_by_address(address);
        if tx.awaited_message_type() != Some(MessageType::WillTopic) {
            debug!("Unexpected WILLTOPIC from {address}");
            return Err(CoreError::Zero);
        }
        if topic.is_empty() {
            tx.remove_will();
            tx.set_awaited_message(MessageType::PingReq);
        } else {
            tx.set_will_topic(topic, qos, retain);
            tx.set_awaited_message(MessageType::WillMsg);
        }
        match tx.commit() {
            Ok(()) => Ok(()),
            Err(StoreError::Full) => Err(CoreError::Full),
            Err(_) => Err(CoreError::Zero),
        }
    }

    /// WILLMSG during CONNECT, completing the handshake
    pub fn add_will_msg(&mut self, address: &DeviceAddress, message: &[u8]) -> CoreResult {
        if !self.store.is_mqtt_online() {
            return Err(CoreError::Zero);
        }
        let mut tx = self.store.begin_by_address(address);
        if tx.awaited_message_type() != Some(MessageType::WillMsg) {
            debug!("Unexpected WILLMSG from {address}");
            return Err(CoreError::Zero);
        }
        tx.set_will_message(message);
        tx.set_awaited_message(MessageType::PingReq);
        match tx.commit() {
            Ok(()) => Ok(()),
            Err(StoreError::Full) => Err(CoreError::Full),
            Err(_) => Err(CoreError::Zero),
        }
    }

    pub fn remove_will(&mut self, address: &DeviceAddress) -> CoreResult {
        let mut tx = self.store.begin_by_address(address);
        tx.remove_will();
        tx.commit().map_err(CoreError::from)
    }

    /// Client initiated REGISTER. Returns the client's topic id for `topic_name`.
    pub fn register_topic(&mut self, address: &DeviceAddress, topic_name: &str) -> CoreResult<u16> {
        if !self.store.is_mqtt_online() {
            return Err(CoreError::Zero);
        }
        let mut tx = self.store.begin_by_address(address);
        if !tx.client_exists() {
            return Err(CoreError::ClientNonexistence);
        }
        let topic_id = tx.add_registration(topic_name, true);
        if let Some(topic_id) = topic_id {
            tx.set_topic_known(topic_id, true);
        }
        match tx.commit() {
            Ok(()) => {
                let topic_id = topic_id.ok_or(CoreError::Zero)?;
                debug!("Registered '{topic_name}' as topic id {topic_id} for {address}");
                Ok(topic_id)
            }
            Err(StoreError::Full) => Err(CoreError::Full),
            Err(StoreError::NotFound) => Err(CoreError::ClientNonexistence),
            Err(_) => Err(CoreError::Zero),
        }
    }

    /// Inbound traffic from a connected client restarts its keepalive window
    pub fn refresh_keepalive(&mut self, address: &DeviceAddress) {
        let connected = self
            .store
            .session_by_address(address)
            .map(|s| s.is_connected() && s.timeout != 0)
            .unwrap_or(false);
        if !connected {
            return;
        }
        let mut tx = self.store.begin_by_address(address);
        tx.set_timeout(0);
        if let Err(e) = tx.commit() {
            debug!("Failed to refresh keepalive of {address}: {e}");
        }
    }

    pub fn set_disconnected(&mut self, address: &DeviceAddress) -> CoreResult {
        let mut tx = self.store.begin_by_address(address);
        if !tx.client_exists() {
            return Err(CoreError::ClientNonexistence);
        }
        let client_id = tx.client_id().unwrap_or_default().to_string();
        tx.set_status(ClientStatus::Disconnected);
        tx.set_awaited_message(MessageType::PingReq);
        tx.commit()?;
        info!("Client {client_id} disconnected");
        Ok(())
    }

    /// Sleep request; `duration` is the sleep period in seconds
    pub fn set_asleep(&mut self, address: &DeviceAddress, duration: u16) -> CoreResult {
        if !self.store.is_mqtt_online() {
            return Err(CoreError::Zero);
        }
        let mut tx = self.store.begin_by_address(address);
        if !tx.client_exists() {
            return Err(CoreError::ClientNonexistence);
        }
        tx.set_status(ClientStatus::Asleep);
        tx.set_duration(u32::from(duration) * 1000);
        tx.set_timeout(0);
        tx.commit()?;
        debug!("Client at {address} sleeps for {duration} s");
        Ok(())
    }

    /// PINGREQ carrying the client id: the client woke up to fetch its messages
    pub fn set_awake(&mut self, address: &DeviceAddress, client_id: &str) -> CoreResult {
        let mut tx = self.store.begin_by_address(address);
        if tx.client_id() != Some(client_id) {
            debug!("PINGREQ for unknown client {client_id} from {address}");
            return Err(CoreError::ClientNonexistence);
        }
        match tx.status() {
            ClientStatus::Asleep | ClientStatus::Awake | ClientStatus::Active => {}
            status => {
                debug!("Client {client_id} cannot wake up from {status:?}");
                return Err(CoreError::Zero);
            }
        }
        tx.set_status(ClientStatus::Awake);
        tx.set_timeout(0);
        tx.commit()?;
        trace!("Client {client_id} is awake");
        Ok(())
    }

    /// REGACK for a gateway initiated REGISTER.
    ///
    /// Rejections other than congestion are not repaired: the topic is marked
    /// known so the queued publish is released, and `Zero` is returned.
    pub fn notify_regack_arrived(
        &mut self,
        address: &DeviceAddress,
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    ) -> CoreResult {
        let mut tx = self.store.begin_by_address(address);
        if !tx.client_exists() {
            return Err(CoreError::ClientNonexistence);
        }
        if tx.awaited_message_type() != Some(MessageType::Regack) || tx.awaited_message_id() != msg_id
        {
            debug!("Unexpected REGACK msg_id={msg_id} from {address}");
            return Err(CoreError::Zero);
        }
        let result = match return_code {
            ReturnCode::Accepted => {
                tx.set_topic_known(topic_id, true);
                Ok(())
            }
            ReturnCode::RejectedCongestion => {
                tx.set_topic_known(topic_id, false);
                Ok(())
            }
            ReturnCode::RejectedInvalidTopicId | ReturnCode::RejectedNotSupported => {
                warn!("Client at {address} rejected topic id {topic_id}: {return_code:?}");
                tx.set_topic_known(topic_id, true);
                Err(CoreError::Zero)
            }
        };
        tx.set_awaited_message(MessageType::PingReq);
        tx.commit()?;
        result
    }

    /// PUBACK for the client's in-flight publish
    pub fn notify_puback_arrived(
        &mut self,
        address: &DeviceAddress,
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    ) -> CoreResult {
        let mut tx = self.store.begin_by_address(address);
        if !tx.client_exists() {
            return Err(CoreError::ClientNonexistence);
        }
        if tx.awaited_message_type() != Some(MessageType::Puback) || tx.awaited_message_id() != msg_id
        {
            debug!("Unexpected PUBACK msg_id={msg_id} from {address}");
            return Err(CoreError::Zero);
        }
        if return_code != ReturnCode::Accepted {
            warn!("Client at {address} rejected publish on topic id {topic_id}: {return_code:?}");
        }
        if !tx.remove_publish_by_msg_id(msg_id) {
            debug!("No in-flight publish with msg_id={msg_id} for {address}");
        }
        tx.set_awaited_message(MessageType::PingReq);
        tx.commit()?;
        Ok(())
    }

    /// Addresses of every session, taken once so a sweep visits each exactly once
    fn session_addresses(&self) -> Vec<DeviceAddress> {
        self.store.sessions().map(|s| s.address).collect()
    }
}
