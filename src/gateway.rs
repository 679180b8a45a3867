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
use anyhow::{Result, bail};
use crate::system::System;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::broker_bridge::{BrokerEvent, MqttBridge};
use crate::config::GatewayConfig;
use crate::engine::{Engine, EngineConfig};
use crate::router::Router;
use crate::session_store::SessionStore;
use crate::system::GatewaySystem;
use crate::transport::UdpTransport;

/// How often the engine sweeps sessions when nothing else happens
const TICK_INTERVAL: Duration = Duration::from_millis(100);

const RECV_BUFFER_SIZE: usize = 65_535;

/// Runs the router and engine against the UDP socket and the broker link
pub struct Gateway {
    router: Router<MqttBridge, UdpTransport, GatewaySystem>,
    transport: UdpTransport,
    broker_events: mpsc::UnboundedReceiver<BrokerEvent>,
    advertise_period: Duration,
}

impl Gateway {
    /// Spawns the broker link task, so it must be called inside a runtime
    pub fn new(config: &GatewayConfig, store: SessionStore, transport: UdpTransport) -> Self {
        let (bridge, broker_events) = MqttBridge::spawn(config.broker.clone());
        let system = GatewaySystem::new(Duration::from_millis(config.heartbeat_ms));
        let engine = Engine::new(
            store,
            bridge,
            transport.clone(),
            system,
            EngineConfig::from(config),
        );
        Self {
            router: Router::new(engine),
            transport,
            broker_events,
            advertise_period: Duration::from_secs(u64::from(config.advertise_duration.max(1))),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.router.engine_mut().notify_mqttsn_connected();

        match self.broker_events.recv().await {
            Some(BrokerEvent::Connected) => self.router.engine_mut().notify_mqtt_connected(),
            Some(other) => bail!("Broker link failed during startup: {other:?}"),
            None => bail!("Broker link task ended during startup"),
        }

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut advertise = tokio::time::interval(self.advertise_period);
        let mut broker_open = true;

        info!("Gateway running");
        while !self.router.engine().system().exit_requested() {
            tokio::select! {
                received = self.transport.recv(&mut buf) => {
                    match received {
                        Ok((len, address)) => {
                            trace!("Received {len} byte(s) from {address}");
                            self.router.receive(&address, &buf[..len]);
                        }
                        Err(e) => {
                            error!("UDP receive failed: {e}");
                            self.router.engine_mut().notify_mqttsn_disconnected();
                        }
                    }
                    self.router.engine_mut().tick();
                }
                event = self.broker_events.recv(), if broker_open => {
                    let engine = self.router.engine_mut();
                    match event {
                        Some(BrokerEvent::Connected) => engine.notify_mqtt_connected(),
                        Some(BrokerEvent::Disconnected) => engine.notify_mqtt_disconnected(),
                        Some(BrokerEvent::Publish {
                            topic,
                            filters: Some(filters),
                            payload,
                            retain,
                        }) => engine.receive_broker_publish_for(&topic, &filters, &payload, retain),
                        Some(BrokerEvent::Publish {
                            topic,
                            filters: None,
                            payload,
                            retain,
                        }) => engine.receive_broker_publish(&topic, &payload, retain),
                        None => {
                            debug!("Broker event channel closed");
                            broker_open = false;
                            engine.notify_mqtt_disconnected();
                        }
                    }
                    engine.tick();
                }
                _ = tick.tick() => {
                    self.router.engine_mut().tick();
                }
                _ = advertise.tick() => {
                    self.router.engine_mut().advertise();
                }
            }
        }

        let linger = self.router.engine().system().linger();
        if !linger.is_zero() {
            info!("Waiting {} ms before exit", linger.as_millis());
            tokio::time::sleep(linger).await;
        }
        info!("Gateway stopped");
        Ok(())
    }
}
