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
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tracing::{debug, error, trace, warn};

use crate::packet::{MessageType, TopicIdType};
use crate::persistence::{MemoryBackend, StorageBackend};

/// Maximum topic name length in bytes
pub const TOPIC_NAME_MAX_LEN: usize = 255;

/// Six byte transport address: IPv4 octets followed by the big-endian port
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DeviceAddress(pub [u8; 6]);

impl DeviceAddress {
    pub fn from_socket_addr(addr: &SocketAddr) -> Option<Self> {
        let v4 = match addr {
            SocketAddr::V4(v4) => *v4,
            SocketAddr::V6(v6) => SocketAddrV4::new(v6.ip().to_ipv4_mapped()?, v6.port()),
        };
        let ip = v4.ip().octets();
        let port = v4.port().to_be_bytes();
        Some(Self([ip[0], ip[1], ip[2], ip[3], port[0], port[1]]))
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        let b = self.0;
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(b[0], b[1], b[2], b[3]),
            u16::from_be_bytes([b[4], b[5]]),
        ))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientStatus {
    Empty,
    Active,
    Asleep,
    Awake,
    Disconnected,
    Lost,
}

/// Will registered by a client during CONNECT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub message: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

/// Per-client topic id assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRegistration {
    pub topic_id: u16,
    pub topic_name: String,
    /// The client has acknowledged this registration with REGACK
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic_name: String,
    pub topic_id: u16,
    pub topic_id_type: TopicIdType,
    pub qos: u8,
}

/// Pending outbound message for a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishQueueEntry {
    /// Stable identity independent of msg_id reuse
    pub publish_id: u32,
    pub topic_id: u16,
    pub topic_id_type: TopicIdType,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    /// Assigned once QoS 1 delivery starts, 0 before that
    pub msg_id: u16,
    /// Sent and waiting for PUBACK. At most one entry per client.
    pub in_flight: bool,
    pub payload: Vec<u8>,
}

/// Session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: String,
    pub address: DeviceAddress,
    pub status: ClientStatus,
    /// Keepalive duration in milliseconds
    pub duration: u32,
    /// Milliseconds accumulated since the last sign of life
    pub timeout: u32,
    pub awaited_message_type: MessageType,
    pub awaited_message_id: u16,
    pub will: Option<Will>,
    pub registrations: Vec<TopicRegistration>,
    pub subscriptions: Vec<Subscription>,
    pub publishes: VecDeque<PublishQueueEntry>,
    next_publish_id: u32,
}

impl ClientSession {
    fn new(client_id: &str, address: DeviceAddress, duration: u32) -> Self {
        Self {
            client_id: client_id.to_string(),
            address,
            status: ClientStatus::Active,
            duration,
            timeout: 0,
            awaited_message_type: MessageType::PingReq,
            awaited_message_id: 0,
            will: None,
            registrations: Vec::new(),
            subscriptions: Vec::new(),
            publishes: VecDeque::new(),
            next_publish_id: 1,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.publishes.iter().filter(|p| p.in_flight).count()
    }

    /// Reachable by the gateway: accepted broker messages are queued for it
    pub fn is_connected(&self) -> bool {
        matches!(
            self.status,
            ClientStatus::Active | ClientStatus::Asleep | ClientStatus::Awake
        )
    }
}

/// Capacity limits applied at commit time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    pub max_clients: usize,
    pub max_registrations_per_client: usize,
    pub max_subscriptions_per_client: usize,
    pub max_publishes_per_client: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_clients: 100,
            max_registrations_per_client: 50,
            max_subscriptions_per_client: 50,
            max_publishes_per_client: 20,
        }
    }
}

/// Terminal status of a transaction that did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Full,
    SubscriptionFull,
    TopicIdNonexistence,
    Failed,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "client not found"),
            StoreError::Full => write!(f, "no space for a new resource"),
            StoreError::SubscriptionFull => write!(f, "client subscription table full"),
            StoreError::TopicIdNonexistence => write!(f, "topic id does not exist"),
            StoreError::Failed => write!(f, "transaction failed"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Owner of all session records, global subscription counts and link state
pub struct SessionStore {
    sessions: Vec<ClientSession>,
    subscription_counts: BTreeMap<String, u32>,
    predefined_topics: BTreeMap<u16, String>,
    limits: StoreLimits,
    mqtt_online: bool,
    mqttsn_online: bool,
    backend: Box<dyn StorageBackend>,
}

impl SessionStore {
    pub fn new(backend: Box<dyn StorageBackend>, limits: StoreLimits) -> Self {
        Self {
            sessions: Vec::new(),
            subscription_counts: BTreeMap::new(),
            predefined_topics: BTreeMap::new(),
            limits,
            mqtt_online: false,
            mqttsn_online: false,
            backend,
        }
    }

    /// Create a store and populate it from the backend's saved state
    pub fn load(mut backend: Box<dyn StorageBackend>, limits: StoreLimits) -> anyhow::Result<Self> {
        let state = backend.load()?;
        debug!(
            "Loaded {} session(s) and {} subscription count(s)",
            state.sessions.len(),
            state.subscription_counts.len()
        );
        let mut store = Self::new(backend, limits);
        store.sessions = state.sessions;
        store.subscription_counts = state.subscription_counts;
        Ok(store)
    }

    pub fn set_predefined_topics<I>(&mut self, topics: I)
    where
        I: IntoIterator<Item = (u16, String)>,
    {
        self.predefined_topics = topics.into_iter().collect();
    }

    pub fn predefined_topic_name(&self, topic_id: u16) -> Option<&str> {
        self.predefined_topics.get(&topic_id).map(String::as_str)
    }

    pub fn predefined_topic_id(&self, topic_name: &str) -> Option<u16> {
        self.predefined_topics
            .iter()
            .find(|(_, name)| name.as_str() == topic_name)
            .map(|(id, _)| *id)
    }

    /// Number of distinct clients subscribed to `topic_name` (0 when unknown)
    pub fn subscription_count(&self, topic_name: &str) -> u32 {
        self.subscription_counts
            .get(topic_name)
            .copied()
            .unwrap_or(0)
    }

    /// Topics with at least one subscriber
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscription_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session at ordinal `index` in store order
    pub fn nth_session(&self, index: usize) -> Option<&ClientSession> {
        self.sessions.get(index)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.iter()
    }

    pub fn session(&self, client_id: &str) -> Option<&ClientSession> {
        self.sessions.iter().find(|s| s.client_id == client_id)
    }

    pub fn session_by_address(&self, address: &DeviceAddress) -> Option<&ClientSession> {
        self.sessions.iter().find(|s| s.address == *address)
    }

    pub fn limits(&self) -> &StoreLimits {
        &self.limits
    }

    pub fn is_mqtt_online(&self) -> bool {
        self.mqtt_online
    }

    pub fn is_mqttsn_online(&self) -> bool {
        self.mqttsn_online
    }

    pub fn set_mqtt_online(&mut self, online: bool) {
        trace!("MQTT link online={online}");
        self.mqtt_online = online;
    }

    pub fn set_mqttsn_online(&mut self, online: bool) {
        trace!("MQTT-SN link online={online}");
        self.mqttsn_online = online;
    }

    /// Open a transaction on the session identified by `client_id`.
    ///
    /// The returned guard borrows the store mutably, so a second transaction
    /// cannot be opened until this one is committed or dropped. Dropping
    /// without commit discards every change.
    pub fn begin_by_client_id(&mut self, client_id: &str) -> Transaction<'_> {
        let slot = self.sessions.iter().position(|s| s.client_id == client_id);
        Transaction::open(self, slot)
    }

    /// Open a transaction on the session bound to `address`
    pub fn begin_by_address(&mut self, address: &DeviceAddress) -> Transaction<'_> {
        let slot = self.sessions.iter().position(|s| s.address == *address);
        Transaction::open(self, slot)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Box::new(MemoryBackend::new()), StoreLimits::default())
    }
}

/// Scoped unit of work on one session.
///
/// Mutators record the first error they hit and `commit` reports it, so a
/// not-found or capacity problem observed mid-transaction is never lost.
pub struct Transaction<'a> {
    store: &'a mut SessionStore,
    slot: Option<usize>,
    session: Option<ClientSession>,
    deleted: bool,
    counts: BTreeMap<String, u32>,
    error: Option<StoreError>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    fn open(store: &'a mut SessionStore, slot: Option<usize>) -> Self {
        let session = slot.map(|i| store.sessions[i].clone());
        Self {
            store,
            slot,
            session,
            deleted: false,
            counts: BTreeMap::new(),
            error: None,
            committed: false,
        }
    }

    fn fail(&mut self, error: StoreError) {
        if self.error.is_none() {
            trace!("transaction marked failed: {error}");
            self.error = Some(error);
        }
    }

    fn session_mut(&mut self) -> Option<&mut ClientSession> {
        if self.deleted {
            None
        } else {
            self.session.as_mut()
        }
    }

    fn with_session<R>(&mut self, f: impl FnOnce(&mut ClientSession) -> R) -> Option<R> {
        match self.session_mut() {
            Some(session) => Some(f(session)),
            None => {
                self.fail(StoreError::NotFound);
                None
            }
        }
    }

    pub fn session(&self) -> Option<&ClientSession> {
        if self.deleted {
            None
        } else {
            self.session.as_ref()
        }
    }

    pub fn client_exists(&self) -> bool {
        self.session().is_some()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.session().map(|s| s.client_id.as_str())
    }

    pub fn status(&self) -> ClientStatus {
        self.session()
            .map(|s| s.status)
            .unwrap_or(ClientStatus::Empty)
    }

    pub fn set_status(&mut self, status: ClientStatus) {
        self.with_session(|s| s.status = status);
    }

    pub fn duration(&self) -> u32 {
        self.session().map(|s| s.duration).unwrap_or(0)
    }

    pub fn set_duration(&mut self, duration: u32) {
        self.with_session(|s| s.duration = duration);
    }

    pub fn timeout(&self) -> u32 {
        self.session().map(|s| s.timeout).unwrap_or(0)
    }

    pub fn set_timeout(&mut self, timeout: u32) {
        self.with_session(|s| s.timeout = timeout);
    }

    pub fn awaited_message_type(&self) -> Option<MessageType> {
        self.session().map(|s| s.awaited_message_type)
    }

    pub fn awaited_message_id(&self) -> u16 {
        self.session().map(|s| s.awaited_message_id).unwrap_or(0)
    }

    pub fn set_awaited_message(&mut self, message_type: MessageType) {
        self.with_session(|s| s.awaited_message_type = message_type);
    }

    /// Advance the per-client message id (wraps at 16 bits, never 0)
    pub fn next_message_id(&mut self) -> u16 {
        self.with_session(|s| {
            s.awaited_message_id = match s.awaited_message_id.wrapping_add(1) {
                0 => 1,
                id => id,
            };
            s.awaited_message_id
        })
        .unwrap_or(0)
    }

    /// Create a fresh ACTIVE session
    pub fn add_client(&mut self, client_id: &str, address: &DeviceAddress, duration: u32) {
        if self.client_exists() {
            error!("add_client: client {client_id} already exists");
            self.fail(StoreError::Failed);
            return;
        }
        let slot = self.slot;
        let duplicate = self
            .store
            .sessions
            .iter()
            .enumerate()
            .any(|(i, s)| Some(i) != slot && s.client_id == client_id);
        if duplicate {
            error!("add_client: client id {client_id} is held by another record");
            self.fail(StoreError::Failed);
            return;
        }
        if slot.is_none() && self.store.sessions.len() >= self.store.limits.max_clients {
            warn!("add_client: client table full, rejecting {client_id}");
            self.fail(StoreError::Full);
            return;
        }
        self.session = Some(ClientSession::new(client_id, *address, duration));
        self.deleted = false;
    }

    /// Keep registrations, subscriptions, will and publishes; restart the session
    pub fn reset_client(&mut self, address: &DeviceAddress, duration: u32) {
        self.with_session(|s| {
            s.address = *address;
            s.duration = duration;
            s.status = ClientStatus::Active;
            s.timeout = 0;
            s.awaited_message_type = MessageType::PingReq;
        });
    }

    /// Remove the session. Only allowed once it has no subscriptions left.
    pub fn delete_client(&mut self) {
        let subscriptions = match self.session() {
            Some(session) => session.subscriptions.len(),
            None => {
                self.fail(StoreError::NotFound);
                return;
            }
        };
        if subscriptions > 0 {
            error!("delete_client: {subscriptions} subscription(s) still present");
            self.fail(StoreError::Failed);
            return;
        }
        self.deleted = true;
    }

    pub fn will(&self) -> Option<&Will> {
        self.session().and_then(|s| s.will.as_ref())
    }

    pub fn set_will_topic(&mut self, topic: &str, qos: u8, retain: bool) {
        if topic.len() > TOPIC_NAME_MAX_LEN {
            self.fail(StoreError::Failed);
            return;
        }
        self.with_session(|s| {
            s.will = Some(Will {
                topic: topic.to_string(),
                message: Vec::new(),
                qos,
                retain,
            })
        });
    }

    pub fn set_will_message(&mut self, message: &[u8]) {
        let has_will = self.with_session(|s| match s.will.as_mut() {
            Some(will) => {
                will.message = message.to_vec();
                true
            }
            None => false,
        });
        if has_will == Some(false) {
            self.fail(StoreError::Failed);
        }
    }

    pub fn remove_will(&mut self) {
        self.with_session(|s| s.will = None);
    }

    pub fn topic_id(&self, topic_name: &str) -> Option<u16> {
        self.session()?
            .registrations
            .iter()
            .find(|r| r.topic_name == topic_name)
            .map(|r| r.topic_id)
    }

    pub fn topic_name(&self, topic_id: u16) -> Option<&str> {
        self.session()?
            .registrations
            .iter()
            .find(|r| r.topic_id == topic_id)
            .map(|r| r.topic_name.as_str())
    }

    pub fn is_topic_known(&self, topic_id: u16) -> bool {
        self.session()
            .and_then(|s| s.registrations.iter().find(|r| r.topic_id == topic_id))
            .map(|r| r.known)
            .unwrap_or(false)
    }

    pub fn set_topic_known(&mut self, topic_id: u16, known: bool) {
        let found = self.with_session(|s| {
            s.registrations
                .iter_mut()
                .find(|r| r.topic_id == topic_id)
                .map(|r| r.known = known)
                .is_some()
        });
        if found == Some(false) {
            self.fail(StoreError::TopicIdNonexistence);
        }
    }

    /// Register `topic_name` for this client, returning the existing id when
    /// it is already registered.
    pub fn add_registration(&mut self, topic_name: &str, known: bool) -> Option<u16> {
        if !self.client_exists() {
            self.fail(StoreError::NotFound);
            return None;
        }
        if topic_name.is_empty() || topic_name.len() > TOPIC_NAME_MAX_LEN {
            self.fail(StoreError::Failed);
            return None;
        }
        if let Some(topic_id) = self.topic_id(topic_name) {
            return Some(topic_id);
        }
        let limit = self.store.limits.max_registrations_per_client;
        let next_id = {
            let session = self.session()?;
            if session.registrations.len() >= limit {
                None
            } else {
                session
                    .registrations
                    .iter()
                    .map(|r| r.topic_id)
                    .max()
                    .unwrap_or(0)
                    .checked_add(1)
            }
        };
        let Some(topic_id) = next_id else {
            self.fail(StoreError::Full);
            return None;
        };
        self.with_session(|s| {
            s.registrations.push(TopicRegistration {
                topic_id,
                topic_name: topic_name.to_string(),
                known,
            })
        });
        Some(topic_id)
    }

    pub fn is_subscribed(&self, topic_name: &str) -> bool {
        self.subscription(topic_name).is_some()
    }

    pub fn subscription(&self, topic_name: &str) -> Option<&Subscription> {
        self.session()?
            .subscriptions
            .iter()
            .find(|s| s.topic_name == topic_name)
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        self.session()
            .map(|s| s.subscriptions.as_slice())
            .unwrap_or(&[])
    }

    pub fn add_subscription(
        &mut self,
        topic_name: &str,
        topic_id: u16,
        topic_id_type: TopicIdType,
        qos: u8,
    ) {
        let limit = self.store.limits.max_subscriptions_per_client;
        let full = self.with_session(|s| {
            if let Some(existing) = s
                .subscriptions
                .iter_mut()
                .find(|sub| sub.topic_name == topic_name)
            {
                existing.qos = qos;
                return false;
            }
            if s.subscriptions.len() >= limit {
                return true;
            }
            s.subscriptions.push(Subscription {
                topic_name: topic_name.to_string(),
                topic_id,
                topic_id_type,
                qos,
            });
            false
        });
        if full == Some(true) {
            self.fail(StoreError::SubscriptionFull);
        }
    }

    pub fn delete_subscription(&mut self, topic_name: &str) -> bool {
        self.with_session(|s| {
            let before = s.subscriptions.len();
            s.subscriptions.retain(|sub| sub.topic_name != topic_name);
            before != s.subscriptions.len()
        })
        .unwrap_or(false)
    }

    /// Global count including changes made in this transaction
    pub fn subscription_count(&self, topic_name: &str) -> u32 {
        self.counts
            .get(topic_name)
            .copied()
            .unwrap_or_else(|| self.store.subscription_count(topic_name))
    }

    pub fn increment_subscription_count(&mut self, topic_name: &str) -> u32 {
        let count = self.subscription_count(topic_name) + 1;
        self.counts.insert(topic_name.to_string(), count);
        count
    }

    /// Decrement, saturating at 0
    pub fn decrement_subscription_count(&mut self, topic_name: &str) -> u32 {
        let current = self.subscription_count(topic_name);
        if current == 0 {
            warn!("subscription count for '{topic_name}' is already 0");
            return 0;
        }
        self.counts.insert(topic_name.to_string(), current - 1);
        current - 1
    }

    pub fn has_publishes(&self) -> bool {
        self.session()
            .map(|s| !s.publishes.is_empty())
            .unwrap_or(false)
    }

    pub fn next_publish(&self) -> Option<&PublishQueueEntry> {
        self.session()?.publishes.front()
    }

    pub fn in_flight_publish(&self) -> Option<&PublishQueueEntry> {
        self.session()?.publishes.iter().find(|p| p.in_flight)
    }

    /// Append a publish to the client queue. Returns false when the queue is full.
    pub fn enqueue_publish(
        &mut self,
        topic_id: u16,
        topic_id_type: TopicIdType,
        qos: u8,
        retain: bool,
        payload: &[u8],
    ) -> bool {
        let limit = self.store.limits.max_publishes_per_client;
        self.with_session(|s| {
            if s.publishes.len() >= limit {
                warn!(
                    "publish queue of {} is full, dropping message for topic id {topic_id}",
                    s.client_id
                );
                return false;
            }
            let publish_id = s.next_publish_id;
            s.next_publish_id = s.next_publish_id.wrapping_add(1).max(1);
            s.publishes.push_back(PublishQueueEntry {
                publish_id,
                topic_id,
                topic_id_type,
                qos,
                retain,
                dup: false,
                msg_id: 0,
                in_flight: false,
                payload: payload.to_vec(),
            });
            true
        })
        .unwrap_or(false)
    }

    pub fn remove_publish(&mut self, publish_id: u32) -> bool {
        self.with_session(|s| {
            let before = s.publishes.len();
            s.publishes.retain(|p| p.publish_id != publish_id);
            before != s.publishes.len()
        })
        .unwrap_or(false)
    }

    /// Bind `msg_id` to the entry and mark it as the client's in-flight publish.
    /// Fails the transaction when another entry is already in flight.
    pub fn mark_publish_in_flight(&mut self, publish_id: u32, msg_id: u16) {
        let ok = self.with_session(|s| {
            if s.publishes
                .iter()
                .any(|p| p.in_flight && p.publish_id != publish_id)
            {
                error!(
                    "{} already has a publish awaiting PUBACK, refusing a second one",
                    s.client_id
                );
                return false;
            }
            match s.publishes.iter_mut().find(|p| p.publish_id == publish_id) {
                Some(entry) => {
                    entry.msg_id = msg_id;
                    entry.in_flight = true;
                    true
                }
                None => false,
            }
        });
        if ok == Some(false) {
            self.fail(StoreError::Failed);
        }
    }

    /// Drop the in-flight entry acknowledged by `msg_id`
    pub fn remove_publish_by_msg_id(&mut self, msg_id: u16) -> bool {
        self.with_session(|s| {
            let before = s.publishes.len();
            s.publishes
                .retain(|p| !(p.in_flight && p.msg_id == msg_id));
            before != s.publishes.len()
        })
        .unwrap_or(false)
    }

    /// Persist the working copy.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.committed = true;
        if let Some(error) = self.error.take() {
            debug!("transaction rejected at commit: {error}");
            return Err(error);
        }

        let slot = self.slot;
        let deleted = self.deleted;
        let session = self.session.take();
        let counts = std::mem::take(&mut self.counts);
        let store = &mut *self.store;

        if let (false, Some(session)) = (deleted, session.as_ref()) {
            let address_taken = store
                .sessions
                .iter()
                .enumerate()
                .any(|(i, s)| Some(i) != slot && s.address == session.address);
            if address_taken {
                error!(
                    "address {} of {} is already bound to another client",
                    session.address, session.client_id
                );
                return Err(StoreError::Failed);
            }
        }

        let mut merged = store.subscription_counts.clone();
        for (topic_name, count) in &counts {
            if *count == 0 {
                merged.remove(topic_name);
            } else {
                merged.insert(topic_name.clone(), *count);
            }
        }

        let persisted = match (slot, deleted, session.as_ref()) {
            (Some(i), true, _) => store.backend.remove_session(&store.sessions[i].client_id),
            (_, false, Some(session)) => store.backend.store_session(session),
            _ => Ok(()),
        }
        .and_then(|()| {
            if counts.is_empty() {
                Ok(())
            } else {
                store.backend.store_subscription_counts(&merged)
            }
        });
        if let Err(e) = persisted {
            error!("failed to persist transaction: {e}");
            return Err(StoreError::Failed);
        }

        match (slot, deleted, session) {
            (Some(i), true, _) => {
                store.sessions.remove(i);
            }
            (Some(i), false, Some(session)) => store.sessions[i] = session,
            (None, false, Some(session)) => store.sessions.push(session),
            _ => {}
        }
        store.subscription_counts = merged;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            trace!("transaction released without commit, changes discarded");
        }
    }
}
