//! MQTT-SN packet model.
//!
//! Every packet the gateway and client exchange is one variant of the closed
//! [`Packet`] union, so dispatch sites match exhaustively.

use bytes::Bytes;

use crate::transaction::Retransmit;
use crate::types::{QoS, ReturnCode, TopicIdType};

/// SASL mechanism understood by the gateway's AUTH exchange.
pub const AUTH_METHOD_PLAIN: &str = "PLAIN";

/// Topic reference carried by PUBLISH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicRef {
    pub kind: TopicIdType,
    pub id: u16,
}

impl TopicRef {
    pub fn normal(id: u16) -> Self {
        Self { kind: TopicIdType::Normal, id }
    }

    pub fn predefined(id: u16) -> Self {
        Self { kind: TopicIdType::Predefined, id }
    }

    pub fn short(id: u16) -> Self {
        Self { kind: TopicIdType::Short, id }
    }
}

/// Topic carried by SUBSCRIBE and UNSUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    /// Full topic name or filter, may contain wildcards.
    Name(String),
    /// Predefined topic id.
    Predefined(u16),
    /// Two-character short topic name packed into a u16.
    Short(u16),
}

impl TopicFilter {
    pub fn id_type(&self) -> TopicIdType {
        match self {
            TopicFilter::Name(_) => TopicIdType::Normal,
            TopicFilter::Predefined(_) => TopicIdType::Predefined,
            TopicFilter::Short(_) => TopicIdType::Short,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertise {
    pub gateway_id: u8,
    pub duration: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchGw {
    pub radius: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GwInfo {
    pub gateway_id: u8,
    /// Only present when a client answers on behalf of a gateway.
    pub address: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub will: bool,
    pub clean_session: bool,
    pub protocol_id: u8,
    /// Keep alive in seconds.
    pub duration: u16,
    pub client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub code: ReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillTopic {
    pub qos: QoS,
    pub retain: bool,
    /// Empty topic clears the will.
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMsg {
    pub message: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    /// Zero when sent by a client.
    pub topic_id: u16,
    pub msg_id: u16,
    pub topic_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAck {
    pub topic_id: u16,
    pub msg_id: u16,
    pub code: ReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: TopicRef,
    pub msg_id: u16,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub topic_id: u16,
    pub msg_id: u16,
    pub code: ReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub dup: bool,
    pub qos: QoS,
    pub msg_id: u16,
    pub topic: TopicFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    pub qos: QoS,
    pub topic_id: u16,
    pub msg_id: u16,
    pub code: ReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub msg_id: u16,
    pub topic: TopicFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PingReq {
    /// Set by a sleeping client to signal it is awake.
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Disconnect {
    /// Sleep duration in seconds; absent or zero means a real disconnect.
    pub duration: Option<u16>,
}

impl Disconnect {
    /// Positive sleep duration, if this DISCONNECT asks to sleep.
    pub fn sleep_duration(&self) -> Option<u16> {
        self.duration.filter(|d| *d > 0)
    }
}

/// Non-standard authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub reason: u8,
    pub method: String,
    pub data: Bytes,
}

impl Auth {
    /// Build a SASL PLAIN exchange (`\0user\0password`).
    pub fn plain(username: &str, password: &[u8]) -> Self {
        let mut data = Vec::with_capacity(username.len() + password.len() + 2);
        data.push(0);
        data.extend_from_slice(username.as_bytes());
        data.push(0);
        data.extend_from_slice(password);
        Self {
            reason: 0,
            method: AUTH_METHOD_PLAIN.to_string(),
            data: Bytes::from(data),
        }
    }

    /// Extract username and password from a SASL PLAIN exchange.
    pub fn plain_credentials(&self) -> Option<(String, Vec<u8>)> {
        if self.method != AUTH_METHOD_PLAIN {
            return None;
        }
        let mut parts = self.data.splitn(3, |b| *b == 0);
        let _authzid = parts.next()?;
        let username = std::str::from_utf8(parts.next()?).ok()?;
        let password = parts.next()?;
        if username.is_empty() {
            return None;
        }
        Some((username.to_string(), password.to_vec()))
    }
}

/// MQTT-SN 1.2 packet, plus the gateway's AUTH extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Advertise(Advertise),
    SearchGw(SearchGw),
    GwInfo(GwInfo),
    Connect(Connect),
    ConnAck(ConnAck),
    WillTopicReq,
    WillTopic(WillTopic),
    WillMsgReq,
    WillMsg(WillMsg),
    Register(Register),
    RegAck(RegAck),
    Publish(Publish),
    PubAck(PubAck),
    PubComp(u16),
    PubRec(u16),
    PubRel(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq(PingReq),
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    /// Packet name for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Advertise(_) => "ADVERTISE",
            Packet::SearchGw(_) => "SEARCHGW",
            Packet::GwInfo(_) => "GWINFO",
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::WillTopicReq => "WILLTOPICREQ",
            Packet::WillTopic(_) => "WILLTOPIC",
            Packet::WillMsgReq => "WILLMSGREQ",
            Packet::WillMsg(_) => "WILLMSG",
            Packet::Register(_) => "REGISTER",
            Packet::RegAck(_) => "REGACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq(_) => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect(_) => "DISCONNECT",
            Packet::Auth(_) => "AUTH",
        }
    }

    /// Message id, for packets that carry one.
    pub fn msg_id(&self) -> Option<u16> {
        match self {
            Packet::Register(p) => Some(p.msg_id),
            Packet::RegAck(p) => Some(p.msg_id),
            Packet::Publish(p) => Some(p.msg_id),
            Packet::PubAck(p) => Some(p.msg_id),
            Packet::PubComp(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::UnsubAck(id) => Some(*id),
            Packet::Subscribe(p) => Some(p.msg_id),
            Packet::SubAck(p) => Some(p.msg_id),
            Packet::Unsubscribe(p) => Some(p.msg_id),
            _ => None,
        }
    }
}

impl Retransmit for Packet {
    fn mark_duplicate(&mut self) {
        match self {
            Packet::Publish(p) => p.dup = true,
            Packet::Subscribe(p) => p.dup = true,
            _ => {}
        }
    }
}
