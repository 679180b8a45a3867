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
#![allow(dead_code)]

use mqttsn_gateway::broker_bridge::BrokerBridge;
use mqttsn_gateway::engine::{Engine, EngineConfig};
use mqttsn_gateway::packet::{Flags, Message, ReturnCode};
use mqttsn_gateway::persistence::MemoryBackend;
use mqttsn_gateway::router::Router;
use mqttsn_gateway::session_store::{DeviceAddress, SessionStore, StoreLimits};
use mqttsn_gateway::system::System;
use mqttsn_gateway::transport::Transport;

pub const MAX_MESSAGE_LENGTH: usize = 255;

/// Broker side recorder
#[derive(Debug, Default)]
pub struct FakeBroker {
    pub publishes: Vec<(String, Vec<u8>, u8, bool)>,
    pub subscribes: Vec<(String, u8)>,
    pub unsubscribes: Vec<String>,
    pub disconnected: bool,
    /// Make every request fail
    pub fail: bool,
}

impl BrokerBridge for FakeBroker {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> bool {
        if self.fail {
            return false;
        }
        self.publishes
            .push((topic.to_string(), payload.to_vec(), qos, retain));
        true
    }

    fn subscribe(&mut self, topic: &str, qos: u8) -> bool {
        if self.fail {
            return false;
        }
        self.subscribes.push((topic.to_string(), qos));
        true
    }

    fn unsubscribe(&mut self, topic: &str) -> bool {
        if self.fail {
            return false;
        }
        self.unsubscribes.push(topic.to_string());
        true
    }

    fn disconnect(&mut self) {
        self.disconnected = true;
    }
}

/// Records every frame the gateway sends
#[derive(Debug)]
pub struct FakeTransport {
    pub sent: Vec<(DeviceAddress, Vec<u8>)>,
    pub fail: bool,
    pub max_message_length: usize,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            fail: false,
            max_message_length: MAX_MESSAGE_LENGTH,
        }
    }
}

impl FakeTransport {
    /// Decoded frames sent since the last call
    pub fn take_sent(&mut self) -> Vec<(DeviceAddress, Message)> {
        self.sent
            .drain(..)
            .map(|(address, bytes)| {
                let message = Message::decode(&bytes).expect("gateway sent a malformed frame");
                (address, message)
            })
            .collect()
    }
}

impl Transport for FakeTransport {
    fn send(&mut self, address: &DeviceAddress, bytes: &[u8]) -> bool {
        if self.fail {
            return false;
        }
        self.sent.push((*address, bytes.to_vec()));
        true
    }

    fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    fn local_address(&self) -> DeviceAddress {
        gateway_address()
    }

    fn broadcast_address(&self) -> DeviceAddress {
        DeviceAddress([255, 255, 255, 255, 0x27, 0x10])
    }
}

/// Manually driven clock. `beat` fires once per `set_beat`.
#[derive(Debug, Default)]
pub struct FakeSystem {
    pub beat: bool,
    pub elapsed: u32,
    pub slept: u32,
    pub exited: bool,
}

impl FakeSystem {
    pub fn set_beat(&mut self, elapsed: u32) {
        self.beat = true;
        self.elapsed = elapsed;
    }
}

impl System for FakeSystem {
    fn has_beaten(&mut self) -> bool {
        std::mem::take(&mut self.beat)
    }

    fn elapsed_time(&mut self) -> u32 {
        self.elapsed
    }

    fn sleep(&mut self, millis: u32) {
        self.slept += millis;
    }

    fn exit(&mut self) {
        self.exited = true;
    }

    fn exit_requested(&self) -> bool {
        self.exited
    }
}

pub type TestEngine = Engine<FakeBroker, FakeTransport, FakeSystem>;
pub type TestRouter = Router<FakeBroker, FakeTransport, FakeSystem>;

pub fn gateway_address() -> DeviceAddress {
    DeviceAddress([192, 168, 0, 1, 0x27, 0x10])
}

pub fn client_address(n: u8) -> DeviceAddress {
    DeviceAddress([192, 168, 0, 100 + n, 0xc3, 0x50])
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        gateway_id: 1,
        advertise_duration: 900,
        gateway_will: None,
    }
}

/// Engine over `store` with both links up
pub fn engine_with_store(store: SessionStore, config: EngineConfig) -> TestEngine {
    let mut engine = Engine::new(
        store,
        FakeBroker::default(),
        FakeTransport::default(),
        FakeSystem::default(),
        config,
    );
    engine.notify_mqttsn_connected();
    engine.notify_mqtt_connected();
    engine
}

pub fn new_store(limits: StoreLimits) -> SessionStore {
    let mut store = SessionStore::new(Box::new(MemoryBackend::new()), limits);
    store.set_predefined_topics([(1, "gateway/status".to_string())]);
    store
}

pub fn new_engine() -> TestEngine {
    engine_with_store(new_store(StoreLimits::default()), engine_config())
}

pub fn new_router() -> TestRouter {
    Router::new(new_engine())
}

pub fn deliver(router: &mut TestRouter, address: &DeviceAddress, message: &Message) {
    router.receive(address, &message.encode());
}

pub fn take_sent(router: &mut TestRouter) -> Vec<(DeviceAddress, Message)> {
    router.engine_mut().transport_mut().take_sent()
}

/// CONNECT without will; asserts the CONNACK
pub fn connect(router: &mut TestRouter, address: &DeviceAddress, client_id: &str, duration: u16) {
    deliver(
        router,
        address,
        &Message::Connect {
            flags: Flags {
                clean_session: true,
                ..Flags::default()
            },
            protocol_id: 0x01,
            duration,
            client_id: client_id.to_string(),
        },
    );
    let sent = take_sent(router);
    assert_eq!(
        sent,
        vec![(
            *address,
            Message::Connack {
                return_code: ReturnCode::Accepted
            }
        )]
    );
}
