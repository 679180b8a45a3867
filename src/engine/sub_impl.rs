// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

use super::{CoreError, CoreResult, Engine};
use crate::broker_bridge::BrokerBridge;
use crate::packet::{QosLevel, TopicIdType, short_topic_name};
use crate::session_store::{DeviceAddress, StoreError};
use crate::system::System;
use crate::transport::Transport;
use tracing::{debug, info, warn};

/// MQTT topic filter matching with `+` and `#` wildcards
pub fn topic_filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn is_wildcard(topic_name: &str) -> bool {
    topic_name.contains(['+', '#'])
}

fn map_subscribe_error(error: StoreError) -> CoreError {
    match error {
        StoreError::Full => CoreError::Full,
        StoreError::NotFound => CoreError::ClientNonexistence,
        StoreError::SubscriptionFull => CoreError::ClientSubscriptionFull,
        StoreError::TopicIdNonexistence => CoreError::TopicIdNonexistence,
        StoreError::Failed => CoreError::Zero,
    }
}

impl<B, T, S> Engine<B, T, S>
where
    B: BrokerBridge,
    T: Transport,
    S: System,
{
    fn resolve_topic_name(
        &self,
        address: &DeviceAddress,
        topic_id: u16,
        topic_id_type: TopicIdType,
    ) -> CoreResult<String> {
        match topic_id_type {
            TopicIdType::Normal => {
                let session = self
                    .store
                    .session_by_address(address)
                    .ok_or(CoreError::ClientNonexistence)?;
                session
                    .registrations
                    .iter()
                    .find(|r| r.topic_id == topic_id)
                    .map(|r| r.topic_name.clone())
                    .ok_or(CoreError::TopicIdNonexistence)
            }
            TopicIdType::Predefined => self
                .store
                .predefined_topic_name(topic_id)
                .map(str::to_string)
                .ok_or(CoreError::TopicIdNonexistence),
            TopicIdType::Short => {
                short_topic_name(topic_id).ok_or(CoreError::TopicIdNonexistence)
            }
        }
    }

    /// Subscribe the client to a topic given by id. Returns the granted
    /// `(topic_id, qos)`; QoS 2 is downgraded to 1.
    pub fn add_subscription(
        &mut self,
        address: &DeviceAddress,
        topic_id: u16,
        topic_id_type: TopicIdType,
        qos: QosLevel,
    ) -> CoreResult<(u16, u8)> {
        if !self.store.is_mqtt_online() {
            return Err(CoreError::Zero);
        }
        if self.store.session_by_address(address).is_none() {
            return Err(CoreError::ClientNonexistence);
        }
        let topic_name = self.resolve_topic_name(address, topic_id, topic_id_type)?;
        let granted = self.subscribe_topic(address, &topic_name, topic_id, topic_id_type, qos)?;
        Ok((topic_id, granted))
    }

    /// Subscribe the client to a topic filter containing wildcards. Matching
    /// broker topics are registered with the client on delivery, so the
    /// granted topic id is 0.
    pub fn add_wildcard_subscription(
        &mut self,
        address: &DeviceAddress,
        topic_filter: &str,
        qos: QosLevel,
    ) -> CoreResult<(u16, u8)> {
        if !self.store.is_mqtt_online() {
            return Err(CoreError::Zero);
        }
        if !is_wildcard(topic_filter) {
            return Err(CoreError::Zero);
        }
        if self.store.session_by_address(address).is_none() {
            return Err(CoreError::ClientNonexistence);
        }
        let granted = self.subscribe_topic(address, topic_filter, 0, TopicIdType::Normal, qos)?;
        Ok((0, granted))
    }

    fn subscribe_topic(
        &mut self,
        address: &DeviceAddress,
        topic_name: &str,
        topic_id: u16,
        topic_id_type: TopicIdType,
        qos: QosLevel,
    ) -> CoreResult<u8> {
        let granted: u8 = if qos >= QosLevel::AtLeastOnce { 1 } else { 0 };

        let mut tx = self.store.begin_by_address(address);
        if topic_id_type == TopicIdType::Predefined {
            tx.add_registration(topic_name, true);
        }
        let newly_subscribed = !tx.is_subscribed(topic_name);
        tx.add_subscription(topic_name, topic_id, topic_id_type, granted);
        let mut subscribe_upstream = false;
        if newly_subscribed {
            let count = tx.increment_subscription_count(topic_name);
            debug!("Subscription count of '{topic_name}' is now {count}");
            subscribe_upstream = count == 1;
        }
        tx.commit().map_err(map_subscribe_error)?;

        if subscribe_upstream && !self.broker.subscribe(topic_name, granted) {
            warn!("Broker subscribe of '{topic_name}' failed, rolling back");
            let mut tx = self.store.begin_by_address(address);
            tx.delete_subscription(topic_name);
            tx.decrement_subscription_count(topic_name);
            if let Err(e) = tx.commit() {
                warn!("Rollback of '{topic_name}' for {address} failed: {e}");
            }
            return Err(CoreError::Zero);
        }

        info!("Client at {address} subscribed to '{topic_name}' with qos {granted}");
        Ok(granted)
    }

    /// Unsubscribe by topic id
    pub fn delete_subscription(
        &mut self,
        address: &DeviceAddress,
        topic_id: u16,
        topic_id_type: TopicIdType,
    ) -> CoreResult {
        if self.store.session_by_address(address).is_none() {
            return Err(CoreError::ClientNonexistence);
        }
        let topic_name = self.resolve_topic_name(address, topic_id, topic_id_type)?;
        self.delete_subscription_by_name(address, &topic_name)
    }

    /// Unsubscribe by topic name or filter. Not being subscribed is not an error.
    pub fn delete_subscription_by_name(
        &mut self,
        address: &DeviceAddress,
        topic_name: &str,
    ) -> CoreResult {
        let mut tx = self.store.begin_by_address(address);
        if !tx.client_exists() {
            return Err(CoreError::ClientNonexistence);
        }
        if !tx.is_subscribed(topic_name) {
            debug!("Client at {address} is not subscribed to '{topic_name}'");
            return Ok(());
        }
        tx.delete_subscription(topic_name);
        let remaining = tx.decrement_subscription_count(topic_name);
        tx.commit().map_err(map_subscribe_error)?;

        info!("Client at {address} unsubscribed from '{topic_name}'");
        if remaining == 0 && !self.broker.unsubscribe(topic_name) {
            warn!("Broker unsubscribe of '{topic_name}' failed");
        }
        Ok(())
    }
}
