// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

use super::{CoreError, CoreResult, Engine, topic_filter_matches};
use crate::broker_bridge::BrokerBridge;
use crate::packet::{
    Flags, Message, MessageType, PUBLISH_HEADER_LEN, QosLevel, TopicIdType, short_topic_name,
};
use crate::session_store::{ClientStatus, DeviceAddress};
use crate::system::System;
use crate::transport::Transport;
use tracing::{debug, trace, warn};

/// How an accepted client PUBLISH reached the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Forwarded,
    /// QoS -1 publish to a predefined topic from a sender without a session
    ForwardedUnconnected,
}

impl<B, T, S> Engine<B, T, S>
where
    B: BrokerBridge,
    T: Transport,
    S: System,
{
    /// Forward a client PUBLISH to the broker
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &mut self,
        address: &DeviceAddress,
        data: &[u8],
        msg_id: u16,
        topic_id: u16,
        topic_id_type: TopicIdType,
        retain: bool,
        qos: QosLevel,
        dup: bool,
    ) -> CoreResult<PublishOutcome> {
        if !self.store.is_mqtt_online() {
            return Err(CoreError::Zero);
        }

        let session = self
            .store
            .session_by_address(address)
            .filter(|s| !matches!(s.status, ClientStatus::Disconnected | ClientStatus::Lost));
        let Some(session) = session else {
            if qos == QosLevel::MinusOne && topic_id_type == TopicIdType::Predefined {
                let Some(topic_name) = self.store.predefined_topic_name(topic_id) else {
                    debug!("QoS -1 publish from {address} to unknown predefined id {topic_id}");
                    return Err(CoreError::TopicIdNonexistence);
                };
                let topic_name = topic_name.to_string();
                trace!("QoS -1 publish from {address} to '{topic_name}'");
                return if self.broker.publish(&topic_name, data, 0, retain) {
                    Ok(PublishOutcome::ForwardedUnconnected)
                } else {
                    Err(CoreError::Zero)
                };
            }
            debug!("PUBLISH from {address} without a connected session");
            return Err(CoreError::ClientNonexistence);
        };

        let topic_name = match topic_id_type {
            TopicIdType::Normal => session
                .registrations
                .iter()
                .find(|r| r.topic_id == topic_id)
                .map(|r| r.topic_name.clone()),
            TopicIdType::Predefined => self.store.predefined_topic_name(topic_id).map(str::to_string),
            TopicIdType::Short => short_topic_name(topic_id),
        };
        let Some(topic_name) = topic_name else {
            debug!(
                "{} published to unknown topic id {topic_id} ({topic_id_type:?})",
                session.client_id
            );
            return Err(CoreError::TopicIdNonexistence);
        };

        trace!(
            "{} -> broker '{topic_name}' msg_id={msg_id} qos={qos:?} retain={retain} dup={dup} {} byte(s)",
            session.client_id,
            data.len()
        );
        if !self.broker.publish(&topic_name, data, qos.broker_qos(), retain) {
            warn!("Broker rejected publish to '{topic_name}'");
            return Err(CoreError::Zero);
        }
        Ok(PublishOutcome::Forwarded)
    }

    /// Queue a broker message for every connected session subscribed to `topic`
    pub fn receive_broker_publish(&mut self, topic: &str, payload: &[u8], retain: bool) {
        self.fan_out(topic, None, payload, retain);
    }

    /// Queue a broker message delivered for the upstream subscriptions
    /// `filters`. Only sessions holding one of those filters get it, so
    /// a broker sending one copy per overlapping filter does not duplicate
    /// messages.
    pub fn receive_broker_publish_for(
        &mut self,
        topic: &str,
        filters: &[String],
        payload: &[u8],
        retain: bool,
    ) {
        self.fan_out(topic, Some(filters), payload, retain);
    }

    fn fan_out(&mut self, topic: &str, filters: Option<&[String]>, payload: &[u8], retain: bool) {
        let max_payload = self
            .transport
            .max_message_length()
            .saturating_sub(PUBLISH_HEADER_LEN);
        if payload.len() > max_payload {
            warn!(
                "Dropping broker message on '{topic}': {} byte payload exceeds {max_payload}",
                payload.len()
            );
            return;
        }
        let delivered_for =
            |filter: &str| filters.is_none_or(|filters| filters.iter().any(|f| f == filter));

        let mut queued = 0usize;
        for address in self.session_addresses() {
            let mut tx = self.store.begin_by_address(&address);
            if !tx.session().is_some_and(|s| s.is_connected()) {
                continue;
            }

            let exact = tx
                .subscription(topic)
                .filter(|sub| delivered_for(&sub.topic_name))
                .map(|sub| (sub.topic_id, sub.topic_id_type, sub.qos));
            let target = exact.or_else(|| {
                let qos = tx
                    .subscriptions()
                    .iter()
                    .filter(|sub| {
                        delivered_for(&sub.topic_name)
                            && topic_filter_matches(&sub.topic_name, topic)
                    })
                    .map(|sub| sub.qos)
                    .max()?;
                // wildcard match: the concrete name needs its own id,
                // REGISTERed to the client before delivery
                tx.add_registration(topic, false)
                    .map(|topic_id| (topic_id, TopicIdType::Normal, qos))
            });
            let Some((topic_id, topic_id_type, qos)) = target else {
                continue;
            };

            if !tx.enqueue_publish(topic_id, topic_id_type, qos, retain, payload) {
                continue;
            }
            match tx.commit() {
                Ok(()) => queued += 1,
                Err(e) => warn!("Failed to queue '{topic}' for {address}: {e}"),
            }
        }
        debug!("Broker message on '{topic}' queued for {queued} client(s)");
    }

    /// Deliver the head of the client's publish queue if the client is idle.
    ///
    /// Unknown topics are REGISTERed first. QoS 0 entries leave the queue on
    /// send; a QoS 1 entry stays in flight until its PUBACK.
    pub(super) fn handle_client_publishes(&mut self, address: &DeviceAddress) {
        let mut tx = self.store.begin_by_address(address);
        if !matches!(tx.status(), ClientStatus::Active | ClientStatus::Awake) {
            return;
        }
        if tx.awaited_message_type() != Some(MessageType::PingReq) || !tx.has_publishes() {
            return;
        }
        let Some(entry) = tx.next_publish().cloned() else {
            return;
        };

        let known = match entry.topic_id_type {
            TopicIdType::Normal => tx.is_topic_known(entry.topic_id),
            TopicIdType::Predefined | TopicIdType::Short => true,
        };
        if !known {
            let Some(topic_name) = tx.topic_name(entry.topic_id).map(str::to_string) else {
                warn!(
                    "Queued publish for {address} refers to unregistered topic id {}, dropping it",
                    entry.topic_id
                );
                tx.remove_publish(entry.publish_id);
                if let Err(e) = tx.commit() {
                    warn!("Failed to drop unroutable publish for {address}: {e}");
                }
                return;
            };
            let msg_id = tx.next_message_id();
            tx.set_awaited_message(MessageType::Regack);
            if tx.commit().is_ok() {
                debug!("Registering '{topic_name}' as {} with {address}", entry.topic_id);
                self.send_message(
                    address,
                    &Message::Register {
                        topic_id: entry.topic_id,
                        msg_id,
                        topic_name,
                    },
                );
            }
            return;
        }

        // a publish that was in flight before is a redelivery
        let flags = Flags {
            dup: entry.in_flight,
            retain: entry.retain,
            topic_id_type: Some(entry.topic_id_type),
            ..Flags::default()
        };
        let message = match entry.qos {
            0 => {
                tx.remove_publish(entry.publish_id);
                Message::Publish {
                    flags: Flags {
                        qos: Some(QosLevel::AtMostOnce),
                        ..flags
                    },
                    topic_id: entry.topic_id,
                    msg_id: 0,
                    data: entry.payload,
                }
            }
            1 => {
                let msg_id = tx.next_message_id();
                tx.set_awaited_message(MessageType::Puback);
                tx.mark_publish_in_flight(entry.publish_id, msg_id);
                Message::Publish {
                    flags: Flags {
                        qos: Some(QosLevel::AtLeastOnce),
                        ..flags
                    },
                    topic_id: entry.topic_id,
                    msg_id,
                    data: entry.payload,
                }
            }
            qos => {
                warn!("QoS {qos} delivery is not supported, dropping queued publish for {address}");
                tx.remove_publish(entry.publish_id);
                if let Err(e) = tx.commit() {
                    warn!("Failed to drop QoS {qos} publish for {address}: {e}");
                }
                return;
            }
        };
        match tx.commit() {
            Ok(()) => {
                self.send_message(address, &message);
            }
            Err(e) => warn!("Failed to dispatch queued publish for {address}: {e}"),
        }
    }
}
