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
use tracing::{debug, trace, warn};

use crate::broker_bridge::BrokerBridge;
use crate::engine::{CoreError, Engine};
use crate::packet::{
    CLIENT_ID_MAX_LEN, Flags, Message, MessageType, PROTOCOL_ID, QosLevel, ReturnCode, TopicIdType,
    TopicRef,
};
use crate::session_store::DeviceAddress;
use crate::system::System;
use crate::transport::Transport;

/// Translates MQTT-SN frames into engine operations and answers them
pub struct Router<B, T, S> {
    engine: Engine<B, T, S>,
}

impl<B, T, S> Router<B, T, S>
where
    B: BrokerBridge,
    T: Transport,
    S: System,
{
    pub fn new(engine: Engine<B, T, S>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine<B, T, S> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<B, T, S> {
        &mut self.engine
    }

    /// Handle one datagram from `address`. Malformed frames are dropped
    /// without an answer.
    pub fn receive(&mut self, address: &DeviceAddress, bytes: &[u8]) {
        if bytes.len() > self.engine.transport().max_message_length() {
            debug!(
                "Dropping {} byte frame from {address}: larger than the maximum message length",
                bytes.len()
            );
            return;
        }
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping frame from {address}: {e}");
                return;
            }
        };
        trace!("<- {address} {message:?}");
        let message_type = message.message_type();

        if !matches!(message_type, MessageType::Connect | MessageType::SearchGw) {
            self.engine.refresh_keepalive(address);
        }

        match message {
            Message::SearchGw { radius } => self.handle_searchgw(address, radius),
            Message::Connect {
                flags,
                protocol_id,
                duration,
                client_id,
            } => self.handle_connect(address, flags, protocol_id, duration, &client_id),
            Message::WillTopic { flags, topic } => self.handle_willtopic(address, flags, &topic),
            Message::WillMsg { message } => self.handle_willmsg(address, &message),
            Message::Register {
                msg_id, topic_name, ..
            } => self.handle_register(address, msg_id, &topic_name),
            Message::Regack {
                topic_id,
                msg_id,
                return_code,
            } => {
                if self
                    .engine
                    .notify_regack_arrived(address, topic_id, msg_id, return_code)
                    .is_err()
                {
                    self.send_disconnect(address);
                }
            }
            Message::Publish {
                flags,
                topic_id,
                msg_id,
                data,
            } => self.handle_publish(address, flags, topic_id, msg_id, &data),
            Message::Puback {
                topic_id,
                msg_id,
                return_code,
            } => {
                if let Err(e) = self
                    .engine
                    .notify_puback_arrived(address, topic_id, msg_id, return_code)
                {
                    debug!("PUBACK from {address} not applied: {e}");
                    self.send_disconnect(address);
                }
            }
            Message::Subscribe {
                flags,
                msg_id,
                topic,
            } => self.handle_subscribe(address, flags, msg_id, topic),
            Message::Unsubscribe { msg_id, topic, .. } => {
                self.handle_unsubscribe(address, msg_id, topic)
            }
            Message::PingReq { client_id } => self.handle_pingreq(address, client_id.as_deref()),
            Message::Disconnect { duration } => self.handle_disconnect(address, duration),
            Message::WillTopicUpd { .. }
            | Message::WillMsgUpd { .. }
            | Message::Encapsulated { .. }
            | Message::Advertise { .. }
            | Message::GwInfo { .. } => {
                trace!("Ignoring {message_type:?} from {address}");
            }
            _ => debug!("Unexpected {message_type:?} from client {address}"),
        }
    }

    fn send(&mut self, address: &DeviceAddress, message: Message) {
        self.engine.send_message(address, &message);
    }

    fn send_disconnect(&mut self, address: &DeviceAddress) {
        self.send(address, Message::Disconnect { duration: None });
    }

    fn send_connack(&mut self, address: &DeviceAddress, return_code: ReturnCode) {
        self.send(address, Message::Connack { return_code });
    }

    fn connack_code(error: CoreError) -> ReturnCode {
        match error {
            CoreError::Full => ReturnCode::RejectedCongestion,
            _ => ReturnCode::RejectedNotSupported,
        }
    }

    fn handle_searchgw(&mut self, address: &DeviceAddress, radius: u8) {
        let gateway_id = self.engine.config().gateway_id;
        if gateway_id == 0 {
            return;
        }
        trace!("SEARCHGW from {address} radius={radius}");
        let gateway_address = self.engine.transport().local_address().0.to_vec();
        self.send(
            address,
            Message::GwInfo {
                gateway_id,
                gateway_address,
            },
        );
    }

    fn handle_connect(
        &mut self,
        address: &DeviceAddress,
        flags: Flags,
        protocol_id: u8,
        duration: u16,
        client_id: &str,
    ) {
        if protocol_id != PROTOCOL_ID {
            debug!("CONNECT from {address} with unsupported protocol id {protocol_id}");
            self.send_connack(address, ReturnCode::RejectedNotSupported);
            return;
        }
        if client_id.is_empty() || client_id.len() > CLIENT_ID_MAX_LEN {
            debug!("Dropping CONNECT from {address}: client id length {}", client_id.len());
            return;
        }

        match self
            .engine
            .add_client(client_id, duration, flags.clean_session, address)
        {
            Ok(()) if flags.will => {
                match self.engine.await_message(address, MessageType::WillTopic) {
                    Ok(()) => self.send(address, Message::WillTopicReq),
                    Err(e) => self.send_connack(address, Self::connack_code(e)),
                }
            }
            Ok(()) => self.send_connack(address, ReturnCode::Accepted),
            Err(e) => self.send_connack(address, Self::connack_code(e)),
        }
    }

    fn handle_willtopic(&mut self, address: &DeviceAddress, flags: Flags, topic: &str) {
        let qos = flags.qos().broker_qos();
        match self
            .engine
            .add_will_topic(address, topic, qos, flags.retain)
        {
            Ok(()) if topic.is_empty() => self.send_connack(address, ReturnCode::Accepted),
            Ok(()) => self.send(address, Message::WillMsgReq),
            Err(e) => self.send_connack(address, Self::connack_code(e)),
        }
    }

    fn handle_willmsg(&mut self, address: &DeviceAddress, message: &[u8]) {
        match self.engine.add_will_msg(address, message) {
            Ok(()) => self.send_connack(address, ReturnCode::Accepted),
            Err(e) => self.send_connack(address, Self::connack_code(e)),
        }
    }

    fn handle_register(&mut self, address: &DeviceAddress, msg_id: u16, topic_name: &str) {
        let (topic_id, return_code) = match self.engine.register_topic(address, topic_name) {
            Ok(topic_id) => (topic_id, ReturnCode::Accepted),
            Err(CoreError::Full) => (0, ReturnCode::RejectedCongestion),
            Err(CoreError::TopicIdNonexistence) => (0, ReturnCode::RejectedInvalidTopicId),
            Err(_) => (0, ReturnCode::RejectedNotSupported),
        };
        self.send(
            address,
            Message::Regack {
                topic_id,
                msg_id,
                return_code,
            },
        );
    }

    fn handle_publish(
        &mut self,
        address: &DeviceAddress,
        flags: Flags,
        topic_id: u16,
        msg_id: u16,
        data: &[u8],
    ) {
        let qos = flags.qos();
        let topic_id_type = flags.topic_id_type.unwrap_or(TopicIdType::Normal);
        let puback = |return_code| Message::Puback {
            topic_id,
            msg_id,
            return_code,
        };

        match qos {
            QosLevel::ExactlyOnce => {
                debug!("QoS 2 PUBLISH from {address} is not supported");
                self.send(address, puback(ReturnCode::RejectedNotSupported));
                return;
            }
            QosLevel::AtMostOnce | QosLevel::MinusOne if msg_id != 0 => {
                debug!("Dropping QoS {qos:?} PUBLISH from {address} with msg_id {msg_id}");
                return;
            }
            _ => {}
        }

        let result = self.engine.publish(
            address,
            data,
            msg_id,
            topic_id,
            topic_id_type,
            flags.retain,
            qos,
            flags.dup,
        );
        match (result, qos) {
            (_, QosLevel::MinusOne) => {}
            (Ok(_), QosLevel::AtLeastOnce) => self.send(address, puback(ReturnCode::Accepted)),
            (Ok(_), _) => {}
            (Err(CoreError::TopicIdNonexistence), _) => {
                self.send(address, puback(ReturnCode::RejectedInvalidTopicId))
            }
            (Err(_), QosLevel::AtLeastOnce) => {
                self.send(address, puback(ReturnCode::RejectedNotSupported))
            }
            (Err(e), _) => {
                warn!("QoS 0 PUBLISH from {address} failed: {e}");
                self.send_disconnect(address);
            }
        }
    }

    fn handle_subscribe(
        &mut self,
        address: &DeviceAddress,
        flags: Flags,
        msg_id: u16,
        topic: TopicRef,
    ) {
        let qos = flags.qos();
        if qos == QosLevel::MinusOne {
            debug!("Dropping QoS -1 SUBSCRIBE from {address}");
            return;
        }

        let result = match topic {
            TopicRef::Name(name) if name.contains(['+', '#']) => {
                self.engine.add_wildcard_subscription(address, &name, qos)
            }
            TopicRef::Name(name) => self
                .engine
                .register_topic(address, &name)
                .and_then(|topic_id| {
                    self.engine
                        .add_subscription(address, topic_id, TopicIdType::Normal, qos)
                }),
            TopicRef::Predefined(topic_id) => {
                self.engine
                    .add_subscription(address, topic_id, TopicIdType::Predefined, qos)
            }
            TopicRef::Short(topic_id) => {
                self.engine
                    .add_subscription(address, topic_id, TopicIdType::Short, qos)
            }
        };

        let (topic_id, granted, return_code) = match result {
            Ok((topic_id, granted)) => (topic_id, granted, ReturnCode::Accepted),
            Err(CoreError::ClientNonexistence) => {
                self.send_disconnect(address);
                return;
            }
            Err(CoreError::Full | CoreError::ClientSubscriptionFull) => {
                (0, 0, ReturnCode::RejectedCongestion)
            }
            Err(CoreError::TopicIdNonexistence) => (0, 0, ReturnCode::RejectedInvalidTopicId),
            Err(CoreError::Zero) => (0, 0, ReturnCode::RejectedNotSupported),
        };
        self.send(
            address,
            Message::Suback {
                flags: Flags {
                    qos: Some(QosLevel::from_broker_qos(granted)),
                    ..Flags::default()
                },
                topic_id,
                msg_id,
                return_code,
            },
        );
    }

    fn handle_unsubscribe(&mut self, address: &DeviceAddress, msg_id: u16, topic: TopicRef) {
        let result = match topic {
            TopicRef::Name(name) => self.engine.delete_subscription_by_name(address, &name),
            TopicRef::Predefined(topic_id) => {
                self.engine
                    .delete_subscription(address, topic_id, TopicIdType::Predefined)
            }
            TopicRef::Short(topic_id) => {
                self.engine
                    .delete_subscription(address, topic_id, TopicIdType::Short)
            }
        };
        match result {
            Err(CoreError::ClientNonexistence) => self.send_disconnect(address),
            _ => self.send(address, Message::Unsuback { msg_id }),
        }
    }

    fn handle_pingreq(&mut self, address: &DeviceAddress, client_id: Option<&str>) {
        match client_id {
            None => self.send(address, Message::PingResp),
            // the sweep answers once the queued messages are delivered
            Some(client_id) => {
                if let Err(e) = self.engine.set_awake(address, client_id) {
                    debug!("PINGREQ of {client_id} from {address} rejected: {e}");
                    self.send_disconnect(address);
                }
            }
        }
    }

    fn handle_disconnect(&mut self, address: &DeviceAddress, duration: Option<u16>) {
        match duration {
            None => {
                if let Err(e) = self.engine.set_disconnected(address) {
                    debug!("DISCONNECT from {address}: {e}");
                }
                self.send_disconnect(address);
            }
            Some(duration) => match self.engine.set_asleep(address, duration) {
                Ok(()) => self.send(
                    address,
                    Message::Disconnect {
                        duration: Some(duration),
                    },
                ),
                Err(e) => {
                    debug!("Sleep request from {address} rejected: {e}");
                    self.send_disconnect(address);
                }
            },
        }
    }
}
