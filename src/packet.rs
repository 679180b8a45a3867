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

//! MQTT-SN v1.2 frame decoding and encoding.
//!
//! Every inbound datagram is turned into a [`Message`] before anything else
//! looks at it. Decoding never trusts the embedded length field: it must match
//! the datagram size exactly, and every type has its own minimum.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const PROTOCOL_ID: u8 = 0x01;

/// Maximum client identifier length in bytes
pub const CLIENT_ID_MAX_LEN: usize = 23;

/// PUBLISH fixed part: length, type, flags, topic id, msg id
pub const PUBLISH_HEADER_LEN: usize = 7;

const FLAG_DUP: u8 = 0x80;
const FLAG_QOS_MASK: u8 = 0x60;
const FLAG_RETAIN: u8 = 0x10;
const FLAG_WILL: u8 = 0x08;
const FLAG_CLEAN: u8 = 0x04;
const FLAG_TOPIC_ID_TYPE_MASK: u8 = 0x03;

/// MQTT-SN message type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Advertise = 0x00,
    SearchGw = 0x01,
    GwInfo = 0x02,
    Connect = 0x04,
    Connack = 0x05,
    WillTopicReq = 0x06,
    WillTopic = 0x07,
    WillMsgReq = 0x08,
    WillMsg = 0x09,
    Register = 0x0A,
    Regack = 0x0B,
    Publish = 0x0C,
    Puback = 0x0D,
    Pubcomp = 0x0E,
    Pubrec = 0x0F,
    Pubrel = 0x10,
    Subscribe = 0x12,
    Suback = 0x13,
    Unsubscribe = 0x14,
    Unsuback = 0x15,
    PingReq = 0x16,
    PingResp = 0x17,
    Disconnect = 0x18,
    WillTopicUpd = 0x1A,
    WillTopicResp = 0x1B,
    WillMsgUpd = 0x1C,
    WillMsgResp = 0x1D,
    Encapsulated = 0xFE,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let message_type = match value {
            0x00 => Self::Advertise,
            0x01 => Self::SearchGw,
            0x02 => Self::GwInfo,
            0x04 => Self::Connect,
            0x05 => Self::Connack,
            0x06 => Self::WillTopicReq,
            0x07 => Self::WillTopic,
            0x08 => Self::WillMsgReq,
            0x09 => Self::WillMsg,
            0x0A => Self::Register,
            0x0B => Self::Regack,
            0x0C => Self::Publish,
            0x0D => Self::Puback,
            0x0E => Self::Pubcomp,
            0x0F => Self::Pubrec,
            0x10 => Self::Pubrel,
            0x12 => Self::Subscribe,
            0x13 => Self::Suback,
            0x14 => Self::Unsubscribe,
            0x15 => Self::Unsuback,
            0x16 => Self::PingReq,
            0x17 => Self::PingResp,
            0x18 => Self::Disconnect,
            0x1A => Self::WillTopicUpd,
            0x1B => Self::WillTopicResp,
            0x1C => Self::WillMsgUpd,
            0x1D => Self::WillMsgResp,
            0xFE => Self::Encapsulated,
            _ => return None,
        };
        Some(message_type)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Return code carried in CONNACK, REGACK, PUBACK and SUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReturnCode {
    Accepted = 0x00,
    RejectedCongestion = 0x01,
    RejectedInvalidTopicId = 0x02,
    RejectedNotSupported = 0x03,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::RejectedCongestion),
            0x02 => Some(Self::RejectedInvalidTopicId),
            0x03 => Some(Self::RejectedNotSupported),
            _ => None,
        }
    }
}

/// QoS as it appears in MQTT-SN flags, including the connectionless level -1
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QosLevel {
    MinusOne,
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    fn from_flags(flags: u8) -> Self {
        match flags & FLAG_QOS_MASK {
            0x00 => Self::AtMostOnce,
            0x20 => Self::AtLeastOnce,
            0x40 => Self::ExactlyOnce,
            _ => Self::MinusOne,
        }
    }

    fn flag_bits(self) -> u8 {
        match self {
            Self::AtMostOnce => 0x00,
            Self::AtLeastOnce => 0x20,
            Self::ExactlyOnce => 0x40,
            Self::MinusOne => 0x60,
        }
    }

    /// QoS to use towards the MQTT broker (-1 is sent as 0)
    pub fn broker_qos(self) -> u8 {
        match self {
            Self::MinusOne | Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    pub fn from_broker_qos(qos: u8) -> Self {
        match qos {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            _ => Self::ExactlyOnce,
        }
    }
}

/// How the two topic bytes of PUBLISH/SUBSCRIBE/REGISTER are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicIdType {
    /// Id negotiated per client with REGISTER/REGACK
    Normal,
    /// Id from the deployment wide predefined table
    Predefined,
    /// Two character topic name carried inline
    Short,
}

impl TopicIdType {
    fn from_flags(flags: u8) -> Option<Self> {
        match flags & FLAG_TOPIC_ID_TYPE_MASK {
            0x00 => Some(Self::Normal),
            0x01 => Some(Self::Predefined),
            0x02 => Some(Self::Short),
            _ => None,
        }
    }

    fn flag_bits(self) -> u8 {
        match self {
            Self::Normal => 0x00,
            Self::Predefined => 0x01,
            Self::Short => 0x02,
        }
    }
}

/// Short topic names are two bytes packed into the topic id field. `None`
/// when those bytes are not UTF-8.
pub fn short_topic_name(topic_id: u16) -> Option<String> {
    String::from_utf8(topic_id.to_be_bytes().to_vec()).ok()
}

/// Decoded flags byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub dup: bool,
    pub qos: Option<QosLevel>,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: Option<TopicIdType>,
}

impl Flags {
    pub fn from_u8(value: u8) -> Self {
        Self {
            dup: value & FLAG_DUP != 0,
            qos: Some(QosLevel::from_flags(value)),
            retain: value & FLAG_RETAIN != 0,
            will: value & FLAG_WILL != 0,
            clean_session: value & FLAG_CLEAN != 0,
            topic_id_type: TopicIdType::from_flags(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        let mut value = 0;
        if self.dup {
            value |= FLAG_DUP;
        }
        if let Some(qos) = self.qos {
            value |= qos.flag_bits();
        }
        if self.retain {
            value |= FLAG_RETAIN;
        }
        if self.will {
            value |= FLAG_WILL;
        }
        if self.clean_session {
            value |= FLAG_CLEAN;
        }
        if let Some(topic_id_type) = self.topic_id_type {
            value |= topic_id_type.flag_bits();
        }
        value
    }

    pub fn qos(&self) -> QosLevel {
        self.qos.unwrap_or(QosLevel::AtMostOnce)
    }
}

/// Topic designation used by SUBSCRIBE and UNSUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRef {
    Name(String),
    Predefined(u16),
    Short(u16),
}

/// One MQTT-SN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Advertise {
        gateway_id: u8,
        duration: u16,
    },
    SearchGw {
        radius: u8,
    },
    GwInfo {
        gateway_id: u8,
        gateway_address: Vec<u8>,
    },
    Connect {
        flags: Flags,
        protocol_id: u8,
        duration: u16,
        client_id: String,
    },
    Connack {
        return_code: ReturnCode,
    },
    WillTopicReq,
    WillTopic {
        flags: Flags,
        topic: String,
    },
    WillMsgReq,
    WillMsg {
        message: Vec<u8>,
    },
    Register {
        topic_id: u16,
        msg_id: u16,
        topic_name: String,
    },
    Regack {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Publish {
        flags: Flags,
        topic_id: u16,
        msg_id: u16,
        data: Vec<u8>,
    },
    Puback {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Subscribe {
        flags: Flags,
        msg_id: u16,
        topic: TopicRef,
    },
    Suback {
        flags: Flags,
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Unsubscribe {
        flags: Flags,
        msg_id: u16,
        topic: TopicRef,
    },
    Unsuback {
        msg_id: u16,
    },
    PingReq {
        client_id: Option<String>,
    },
    PingResp,
    Disconnect {
        duration: Option<u16>,
    },
    WillTopicUpd {
        flags: Flags,
        topic: String,
    },
    WillMsgUpd {
        message: Vec<u8>,
    },
    Encapsulated {
        ctrl: u8,
        wireless_node_id: Vec<u8>,
        inner: Vec<u8>,
    },
}

/// Reason a datagram was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    TooShort,
    LengthMismatch { declared: usize, actual: usize },
    UnknownType(u8),
    UnexpectedType(MessageType),
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort => write!(f, "frame too short"),
            DecodeError::LengthMismatch { declared, actual } => {
                write!(f, "declared length {declared} but received {actual} bytes")
            }
            DecodeError::UnknownType(t) => write!(f, "unknown message type 0x{t:02x}"),
            DecodeError::UnexpectedType(t) => write!(f, "unexpected message type {t:?}"),
            DecodeError::Malformed(what) => write!(f, "malformed {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_string(bytes: &[u8], what: &'static str) -> Result<String, DecodeError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| DecodeError::Malformed(what))
}

impl Message {
    /// Decode one complete datagram
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 2 {
            return Err(DecodeError::TooShort);
        }
        // Long form: 0x01 followed by a two byte length
        let (declared, header_len) = if bytes[0] == 0x01 {
            if bytes.len() < 4 {
                return Err(DecodeError::TooShort);
            }
            (read_u16(bytes, 1) as usize, 3)
        } else {
            (bytes[0] as usize, 1)
        };
        if declared != bytes.len() {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        let type_byte = bytes[header_len];
        let message_type =
            MessageType::from_u8(type_byte).ok_or(DecodeError::UnknownType(type_byte))?;
        let body = &bytes[header_len + 1..];
        Self::decode_body(message_type, body)
    }

    fn decode_body(message_type: MessageType, body: &[u8]) -> Result<Self, DecodeError> {
        let message = match message_type {
            MessageType::Advertise => {
                if body.len() != 3 {
                    return Err(DecodeError::Malformed("ADVERTISE"));
                }
                Message::Advertise {
                    gateway_id: body[0],
                    duration: read_u16(body, 1),
                }
            }
            MessageType::SearchGw => {
                if body.len() != 1 {
                    return Err(DecodeError::Malformed("SEARCHGW"));
                }
                Message::SearchGw { radius: body[0] }
            }
            MessageType::GwInfo => {
                if body.is_empty() {
                    return Err(DecodeError::Malformed("GWINFO"));
                }
                Message::GwInfo {
                    gateway_id: body[0],
                    gateway_address: body[1..].to_vec(),
                }
            }
            MessageType::Connect => {
                // flags, protocol id, duration, client id
                if body.len() < 5 || body.len() - 4 > CLIENT_ID_MAX_LEN {
                    return Err(DecodeError::Malformed("CONNECT"));
                }
                Message::Connect {
                    flags: Flags::from_u8(body[0]),
                    protocol_id: body[1],
                    duration: read_u16(body, 2),
                    client_id: read_string(&body[4..], "CONNECT client id")?,
                }
            }
            MessageType::Connack => {
                if body.len() != 1 {
                    return Err(DecodeError::Malformed("CONNACK"));
                }
                Message::Connack {
                    return_code: ReturnCode::from_u8(body[0])
                        .ok_or(DecodeError::Malformed("CONNACK return code"))?,
                }
            }
            MessageType::WillTopicReq => Message::WillTopicReq,
            MessageType::WillMsgReq => Message::WillMsgReq,
            MessageType::WillTopic => {
                // An empty WILLTOPIC (no flags, no topic) clears the will
                if body.is_empty() {
                    Message::WillTopic {
                        flags: Flags::default(),
                        topic: String::new(),
                    }
                } else {
                    Message::WillTopic {
                        flags: Flags::from_u8(body[0]),
                        topic: read_string(&body[1..], "WILLTOPIC topic")?,
                    }
                }
            }
            MessageType::WillMsg => Message::WillMsg {
                message: body.to_vec(),
            },
            MessageType::Register => {
                if body.len() < 5 {
                    return Err(DecodeError::Malformed("REGISTER"));
                }
                Message::Register {
                    topic_id: read_u16(body, 0),
                    msg_id: read_u16(body, 2),
                    topic_name: read_string(&body[4..], "REGISTER topic name")?,
                }
            }
            MessageType::Regack => {
                if body.len() != 5 {
                    return Err(DecodeError::Malformed("REGACK"));
                }
                Message::Regack {
                    topic_id: read_u16(body, 0),
                    msg_id: read_u16(body, 2),
                    return_code: ReturnCode::from_u8(body[4])
                        .ok_or(DecodeError::Malformed("REGACK return code"))?,
                }
            }
            MessageType::Publish => {
                if body.len() < PUBLISH_HEADER_LEN - 2 {
                    return Err(DecodeError::Malformed("PUBLISH"));
                }
                let flags = Flags::from_u8(body[0]);
                if flags.topic_id_type.is_none() {
                    return Err(DecodeError::Malformed("PUBLISH topic id type"));
                }
                Message::Publish {
                    flags,
                    topic_id: read_u16(body, 1),
                    msg_id: read_u16(body, 3),
                    data: body[5..].to_vec(),
                }
            }
            MessageType::Puback => {
                if body.len() != 5 {
                    return Err(DecodeError::Malformed("PUBACK"));
                }
                Message::Puback {
                    topic_id: read_u16(body, 0),
                    msg_id: read_u16(body, 2),
                    return_code: ReturnCode::from_u8(body[4])
                        .ok_or(DecodeError::Malformed("PUBACK return code"))?,
                }
            }
            MessageType::Subscribe | MessageType::Unsubscribe => {
                if body.len() < 4 {
                    return Err(DecodeError::Malformed("SUBSCRIBE"));
                }
                let flags = Flags::from_u8(body[0]);
                let msg_id = read_u16(body, 1);
                let topic = Self::decode_topic_ref(flags, &body[3..])?;
                if message_type == MessageType::Subscribe {
                    Message::Subscribe {
                        flags,
                        msg_id,
                        topic,
                    }
                } else {
                    Message::Unsubscribe {
                        flags,
                        msg_id,
                        topic,
                    }
                }
            }
            MessageType::Suback => {
                if body.len() != 6 {
                    return Err(DecodeError::Malformed("SUBACK"));
                }
                Message::Suback {
                    flags: Flags::from_u8(body[0]),
                    topic_id: read_u16(body, 1),
                    msg_id: read_u16(body, 3),
                    return_code: ReturnCode::from_u8(body[5])
                        .ok_or(DecodeError::Malformed("SUBACK return code"))?,
                }
            }
            MessageType::Unsuback => {
                if body.len() != 2 {
                    return Err(DecodeError::Malformed("UNSUBACK"));
                }
                Message::Unsuback {
                    msg_id: read_u16(body, 0),
                }
            }
            MessageType::PingReq => {
                if body.len() > CLIENT_ID_MAX_LEN {
                    return Err(DecodeError::Malformed("PINGREQ"));
                }
                let client_id = if body.is_empty() {
                    None
                } else {
                    Some(read_string(body, "PINGREQ client id")?)
                };
                Message::PingReq { client_id }
            }
            MessageType::PingResp => Message::PingResp,
            MessageType::Disconnect => match body.len() {
                0 => Message::Disconnect { duration: None },
                2 => Message::Disconnect {
                    duration: Some(read_u16(body, 0)),
                },
                _ => return Err(DecodeError::Malformed("DISCONNECT")),
            },
            MessageType::WillTopicUpd => {
                if body.is_empty() {
                    Message::WillTopicUpd {
                        flags: Flags::default(),
                        topic: String::new(),
                    }
                } else {
                    Message::WillTopicUpd {
                        flags: Flags::from_u8(body[0]),
                        topic: read_string(&body[1..], "WILLTOPICUPD topic")?,
                    }
                }
            }
            MessageType::WillMsgUpd => Message::WillMsgUpd {
                message: body.to_vec(),
            },
            MessageType::Encapsulated => {
                if body.is_empty() {
                    return Err(DecodeError::Malformed("encapsulated frame"));
                }
                // ctrl, wireless node id, then a complete inner frame whose
                // first byte is its own length
                let ctrl = body[0];
                let rest = &body[1..];
                let inner_start = rest
                    .iter()
                    .enumerate()
                    .find(|(i, len)| **len as usize == rest.len() - i && **len >= 2)
                    .map(|(i, _)| i)
                    .ok_or(DecodeError::Malformed("encapsulated frame"))?;
                Message::Encapsulated {
                    ctrl,
                    wireless_node_id: rest[..inner_start].to_vec(),
                    inner: rest[inner_start..].to_vec(),
                }
            }
            other => return Err(DecodeError::UnexpectedType(other)),
        };
        Ok(message)
    }

    fn decode_topic_ref(flags: Flags, topic: &[u8]) -> Result<TopicRef, DecodeError> {
        match flags.topic_id_type {
            Some(TopicIdType::Normal) => {
                if topic.is_empty() {
                    return Err(DecodeError::Malformed("topic name"));
                }
                Ok(TopicRef::Name(read_string(topic, "topic name")?))
            }
            Some(TopicIdType::Predefined) if topic.len() == 2 => {
                Ok(TopicRef::Predefined(read_u16(topic, 0)))
            }
            Some(TopicIdType::Short) if topic.len() == 2 => Ok(TopicRef::Short(read_u16(topic, 0))),
            _ => Err(DecodeError::Malformed("topic id")),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Advertise { .. } => MessageType::Advertise,
            Message::SearchGw { .. } => MessageType::SearchGw,
            Message::GwInfo { .. } => MessageType::GwInfo,
            Message::Connect { .. } => MessageType::Connect,
            Message::Connack { .. } => MessageType::Connack,
            Message::WillTopicReq => MessageType::WillTopicReq,
            Message::WillTopic { .. } => MessageType::WillTopic,
            Message::WillMsgReq => MessageType::WillMsgReq,
            Message::WillMsg { .. } => MessageType::WillMsg,
            Message::Register { .. } => MessageType::Register,
            Message::Regack { .. } => MessageType::Regack,
            Message::Publish { .. } => MessageType::Publish,
            Message::Puback { .. } => MessageType::Puback,
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Suback { .. } => MessageType::Suback,
            Message::Unsubscribe { .. } => MessageType::Unsubscribe,
            Message::Unsuback { .. } => MessageType::Unsuback,
            Message::PingReq { .. } => MessageType::PingReq,
            Message::PingResp => MessageType::PingResp,
            Message::Disconnect { .. } => MessageType::Disconnect,
            Message::WillTopicUpd { .. } => MessageType::WillTopicUpd,
            Message::WillMsgUpd { .. } => MessageType::WillMsgUpd,
            Message::Encapsulated { .. } => MessageType::Encapsulated,
        }
    }

    /// Encode into a complete datagram, choosing the long length form when needed
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Message::Advertise {
                gateway_id,
                duration,
            } => {
                body.push(*gateway_id);
                body.extend_from_slice(&duration.to_be_bytes());
            }
            Message::SearchGw { radius } => body.push(*radius),
            Message::GwInfo {
                gateway_id,
                gateway_address,
            } => {
                body.push(*gateway_id);
                body.extend_from_slice(gateway_address);
            }
            Message::Connect {
                flags,
                protocol_id,
                duration,
                client_id,
            } => {
                body.push(flags.as_u8());
                body.push(*protocol_id);
                body.extend_from_slice(&duration.to_be_bytes());
                body.extend_from_slice(client_id.as_bytes());
            }
            Message::Connack { return_code } => body.push(*return_code as u8),
            Message::WillTopicReq | Message::WillMsgReq | Message::PingResp => {}
            Message::WillTopic { flags, topic } | Message::WillTopicUpd { flags, topic } => {
                if !topic.is_empty() {
                    body.push(flags.as_u8());
                    body.extend_from_slice(topic.as_bytes());
                }
            }
            Message::WillMsg { message } | Message::WillMsgUpd { message } => {
                body.extend_from_slice(message)
            }
            Message::Register {
                topic_id,
                msg_id,
                topic_name,
            } => {
                body.extend_from_slice(&topic_id.to_be_bytes());
                body.extend_from_slice(&msg_id.to_be_bytes());
                body.extend_from_slice(topic_name.as_bytes());
            }
            Message::Regack {
                topic_id,
                msg_id,
                return_code,
            }
            | Message::Puback {
                topic_id,
                msg_id,
                return_code,
            } => {
                body.extend_from_slice(&topic_id.to_be_bytes());
                body.extend_from_slice(&msg_id.to_be_bytes());
                body.push(*return_code as u8);
            }
            Message::Publish {
                flags,
                topic_id,
                msg_id,
                data,
            } => {
                body.push(flags.as_u8());
                body.extend_from_slice(&topic_id.to_be_bytes());
                body.extend_from_slice(&msg_id.to_be_bytes());
                body.extend_from_slice(data);
            }
            Message::Subscribe {
                flags,
                msg_id,
                topic,
            }
            | Message::Unsubscribe {
                flags,
                msg_id,
                topic,
            } => {
                body.push(flags.as_u8());
                body.extend_from_slice(&msg_id.to_be_bytes());
                match topic {
                    TopicRef::Name(name) => body.extend_from_slice(name.as_bytes()),
                    TopicRef::Predefined(id) | TopicRef::Short(id) => {
                        body.extend_from_slice(&id.to_be_bytes())
                    }
                }
            }
            Message::Suback {
                flags,
                topic_id,
                msg_id,
                return_code,
            } => {
                body.push(flags.as_u8());
                body.extend_from_slice(&topic_id.to_be_bytes());
                body.extend_from_slice(&msg_id.to_be_bytes());
                body.push(*return_code as u8);
            }
            Message::Unsuback { msg_id } => body.extend_from_slice(&msg_id.to_be_bytes()),
            Message::PingReq { client_id } => {
                if let Some(client_id) = client_id {
                    body.extend_from_slice(client_id.as_bytes());
                }
            }
            Message::Disconnect { duration } => {
                if let Some(duration) = duration {
                    body.extend_from_slice(&duration.to_be_bytes());
                }
            }
            Message::Encapsulated {
                ctrl,
                wireless_node_id,
                inner,
            } => {
                body.push(*ctrl);
                body.extend_from_slice(wireless_node_id);
                body.extend_from_slice(inner);
            }
        }

        let short_len = body.len() + 2;
        let mut frame = Vec::with_capacity(short_len + 2);
        if short_len <= u8::MAX as usize {
            frame.push(short_len as u8);
        } else {
            frame.push(0x01);
            frame.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        }
        frame.push(self.message_type().as_u8());
        frame.extend_from_slice(&body);
        frame
    }
}
