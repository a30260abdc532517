//! Common types for mqttsn.

use bytes::Bytes;
use std::fmt;

/// MQTT-SN protocol id carried in CONNECT.
pub const PROTOCOL_ID: u8 = 0x01;

/// Quality of Service level.
///
/// MQTT-SN adds a session-less tier below QoS 0 that may be used without
/// connecting, addressed to short or predefined topics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce,
    /// At least once delivery.
    AtLeastOnce,
    /// Exactly once delivery.
    ExactlyOnce,
    /// QoS -1: fire and forget, no session required.
    FireAndForget,
}

impl QoS {
    /// Decode from the two QoS bits of an MQTT-SN flags byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::FireAndForget,
        }
    }

    /// Encode into the two QoS bits of an MQTT-SN flags byte.
    pub fn bits(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
            QoS::FireAndForget => 3,
        }
    }

    /// Whether this tier needs acknowledgements and a message id.
    pub fn is_acknowledged(self) -> bool {
        matches!(self, QoS::AtLeastOnce | QoS::ExactlyOnce)
    }
}

impl From<rumqttc::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for rumqttc::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce | QoS::FireAndForget => rumqttc::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// How the topic field of PUBLISH, SUBSCRIBE and friends is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TopicIdType {
    /// Alias registered during the session.
    #[default]
    Normal,
    /// Alias configured out of band.
    Predefined,
    /// Two-character topic name packed into the id.
    Short,
}

impl TopicIdType {
    /// Decode from the low two bits of a flags byte.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0 => Some(TopicIdType::Normal),
            1 => Some(TopicIdType::Predefined),
            2 => Some(TopicIdType::Short),
            _ => None,
        }
    }

    /// Encode into the low two bits of a flags byte.
    pub fn bits(self) -> u8 {
        match self {
            TopicIdType::Normal => 0,
            TopicIdType::Predefined => 1,
            TopicIdType::Short => 2,
        }
    }
}

/// MQTT-SN return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Accepted,
    Congestion,
    InvalidTopicId,
    NotSupported,
    /// Reserved value outside the 1.2 table.
    Reserved(u8),
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ReturnCode::Accepted,
            1 => ReturnCode::Congestion,
            2 => ReturnCode::InvalidTopicId,
            3 => ReturnCode::NotSupported,
            other => ReturnCode::Reserved(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ReturnCode::Accepted => 0,
            ReturnCode::Congestion => 1,
            ReturnCode::InvalidTopicId => 2,
            ReturnCode::NotSupported => 3,
            ReturnCode::Reserved(v) => v,
        }
    }

    pub fn is_accepted(self) -> bool {
        self == ReturnCode::Accepted
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnCode::Accepted => write!(f, "accepted"),
            ReturnCode::Congestion => write!(f, "rejected: congestion"),
            ReturnCode::InvalidTopicId => write!(f, "rejected: invalid topic id"),
            ReturnCode::NotSupported => write!(f, "rejected: not supported"),
            ReturnCode::Reserved(v) => write!(f, "reserved return code {}", v),
        }
    }
}

/// Per-connection session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Active,
    Asleep,
    Awake,
}

impl SessionState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Active => "active",
            SessionState::Asleep => "asleep",
            SessionState::Awake => "awake",
        }
    }

    /// Sleeping sessions keep their broker link and buffer outbound traffic.
    pub fn is_sleeping(&self) -> bool {
        matches!(self, SessionState::Asleep | SessionState::Awake)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Application message delivered by the client library.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Delivery tier the message arrived with.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set QoS.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_bits() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce, QoS::FireAndForget] {
            assert_eq!(QoS::from_bits(qos.bits()), qos);
        }
        assert!(QoS::AtLeastOnce.is_acknowledged());
        assert!(!QoS::FireAndForget.is_acknowledged());
    }

    #[test]
    fn test_fire_and_forget_maps_to_mqtt_qos0() {
        let qos: rumqttc::mqttbytes::QoS = QoS::FireAndForget.into();
        assert_eq!(qos, rumqttc::mqttbytes::QoS::AtMostOnce);
    }

    #[test]
    fn test_return_code_reserved() {
        assert_eq!(ReturnCode::from_u8(7), ReturnCode::Reserved(7));
        assert_eq!(ReturnCode::Reserved(7).to_u8(), 7);
        assert!(ReturnCode::from_u8(0).is_accepted());
    }

    #[test]
    fn test_session_state_sleeping() {
        assert!(SessionState::Asleep.is_sleeping());
        assert!(SessionState::Awake.is_sleeping());
        assert!(!SessionState::Active.is_sleeping());
    }
}
