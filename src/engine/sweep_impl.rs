// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

use super::{Engine, keepalive_tolerance};
use crate::broker_bridge::BrokerBridge;
use crate::packet::Message;
use crate::session_store::{ClientStatus, DeviceAddress};
use crate::system::System;
use crate::transport::Transport;
use tracing::{debug, error, info, trace, warn};

/// Pause between publishing the gateway will and exiting
const MQTTSN_OFFLINE_LINGER_MS: u32 = 5000;

impl<B, T, S> Engine<B, T, S>
where
    B: BrokerBridge,
    T: Transport,
    S: System,
{
    /// One engine iteration: link state handling, queued delivery and, when
    /// the heartbeat is due, keepalive accounting.
    pub fn tick(&mut self) {
        if self.system.exit_requested() {
            return;
        }
        match (self.store.is_mqtt_online(), self.store.is_mqttsn_online()) {
            (true, true) => self.sweep_sessions(),
            (false, true) => self.process_mqtt_offline(),
            (true, false) => self.process_mqttsn_offline(),
            (false, false) => {
                error!("Both links are down, shutting down");
                self.set_all_clients_lost();
                self.system.exit();
            }
        }
    }

    fn heartbeat_elapsed(&mut self) -> Option<u32> {
        if self.system.has_beaten() {
            Some(self.system.elapsed_time())
        } else {
            None
        }
    }

    fn sweep_sessions(&mut self) {
        let elapsed = self.heartbeat_elapsed();
        if elapsed.is_some() {
            trace!("Heartbeat: checking {} session(s)", self.store.session_count());
        }
        for address in self.session_addresses() {
            self.sweep_session(&address, elapsed);
        }
    }

    /// Deliver queued messages to the session at `address` and, with
    /// `elapsed`, run its keepalive accounting. Returns false when no session
    /// is bound to `address` any more.
    pub fn sweep_session(&mut self, address: &DeviceAddress, elapsed: Option<u32>) -> bool {
        let Some(status) = self.store.session_by_address(address).map(|s| s.status) else {
            trace!("Session at {address} went away before the sweep reached it");
            return false;
        };
        self.handle_client_publishes(address);

        if status == ClientStatus::Awake {
            let mut tx = self.store.begin_by_address(address);
            if !tx.has_publishes() {
                tx.set_status(ClientStatus::Asleep);
                if tx.commit().is_ok() {
                    trace!("Client at {address} has no more messages, back to sleep");
                    self.send_message(address, &Message::PingResp);
                }
            }
        }

        if let Some(elapsed) = elapsed {
            self.handle_timeout(address, elapsed);
        }
        true
    }

    /// Broker down: drain every client's queue, then disconnect it. The
    /// gateway exits once no client is connected any more.
    fn process_mqtt_offline(&mut self) {
        let elapsed = self.heartbeat_elapsed();
        for address in self.session_addresses() {
            let Some(status) = self.store.session_by_address(&address).map(|s| s.status) else {
                continue;
            };
            self.handle_client_publishes(&address);

            if matches!(status, ClientStatus::Active | ClientStatus::Awake) {
                let mut tx = self.store.begin_by_address(&address);
                if !tx.has_publishes() {
                    tx.set_status(ClientStatus::Disconnected);
                    if tx.commit().is_ok() {
                        info!("Broker is down, disconnecting client at {address}");
                        self.send_message(&address, &Message::Disconnect { duration: None });
                    }
                }
            }

            if let Some(elapsed) = elapsed {
                self.handle_timeout(&address, elapsed);
            }
        }

        if !self.store.sessions().any(|s| s.is_connected()) {
            info!("No connected clients left while the broker is down, shutting down");
            self.system.exit();
        }
    }

    /// MQTT-SN side down: announce it on the broker and leave
    fn process_mqttsn_offline(&mut self) {
        error!("MQTT-SN link is down, shutting down");
        if let Some(will) = self.config.gateway_will.clone() {
            if !self
                .broker
                .publish(&will.topic, will.message.as_bytes(), will.qos, will.retain)
            {
                warn!("Failed to publish gateway will to '{}'", will.topic);
            }
        }
        self.set_all_clients_lost();
        self.broker.disconnect();
        self.system.sleep(MQTTSN_OFFLINE_LINGER_MS);
        self.system.exit();
    }

    pub fn set_all_clients_lost(&mut self) {
        for address in self.session_addresses() {
            let mut tx = self.store.begin_by_address(&address);
            if matches!(tx.status(), ClientStatus::Empty | ClientStatus::Lost) {
                continue;
            }
            tx.set_status(ClientStatus::Lost);
            if let Err(e) = tx.commit() {
                warn!("Failed to mark client at {address} lost: {e}");
            }
        }
    }

    /// Add `elapsed` to the client's timeout and expire it past the tolerance:
    /// publish its will, drop its subscriptions and delete the record.
    pub(super) fn handle_timeout(&mut self, address: &DeviceAddress, elapsed: u32) {
        let mut tx = self.store.begin_by_address(address);
        if !matches!(
            tx.status(),
            ClientStatus::Active | ClientStatus::Asleep | ClientStatus::Awake
        ) {
            return;
        }
        let timeout = tx.timeout().saturating_add(elapsed);
        let duration = tx.duration();
        tx.set_timeout(timeout);
        let tolerance = keepalive_tolerance(duration);
        if u64::from(timeout) <= tolerance {
            if let Err(e) = tx.commit() {
                debug!("Failed to update timeout of {address}: {e}");
            }
            return;
        }

        let client_id = tx.client_id().unwrap_or_default().to_string();
        warn!("Client {client_id} at {address} timed out ({timeout} ms > {tolerance} ms), lost");
        tx.set_status(ClientStatus::Lost);
        let will = tx.will().cloned();
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
            error!("Failed to remove lost client {client_id}: {e}");
            return;
        }

        if let Some(will) = will {
            info!("Publishing will of {client_id} to '{}'", will.topic);
            if !self
                .broker
                .publish(&will.topic, &will.message, will.qos, will.retain)
            {
                warn!("Failed to publish will of {client_id}");
            }
        }
        for topic in unsubscribe {
            if !self.broker.unsubscribe(&topic) {
                warn!("Broker unsubscribe of '{topic}' failed");
            }
        }
    }
}
