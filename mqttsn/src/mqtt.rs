//! Broker leg: MQTT 3.1.1 packets.
//!
//! Packets are parsed and serialized by `rumqttc::mqttbytes::v4`; this
//! module adds async framing over a byte stream and constructors for the
//! packets the gateway originates.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub use rumqttc::mqttbytes::v4::*;
pub use rumqttc::mqttbytes::QoS;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a single MQTT packet from an async reader.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok(packet) => return Ok(packet),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(Error::Protocol(e.to_string())),
            }
        }

        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Write a single MQTT packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = BytesMut::with_capacity(packet.size());
    packet.write(&mut buf, MAX_PACKET_SIZE)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Will message forwarded with CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Create a CONNECT packet.
pub fn create_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&[u8]>,
    keep_alive: u16,
    clean_session: bool,
    will: Option<&Will>,
) -> Packet {
    let mut connect = Connect::new(client_id);
    connect.keep_alive = keep_alive;
    connect.clean_session = clean_session;

    if let Some(user) = username {
        let pass = password.unwrap_or_default();
        let pass_str = std::str::from_utf8(pass).unwrap_or_else(|_| {
            tracing::warn!(
                "Password contains non-UTF8 bytes for client {}, using empty string",
                client_id
            );
            ""
        });
        connect.set_login(user, pass_str);
    }

    if let Some(will) = will {
        connect.last_will = Some(LastWill::new(
            will.topic.clone(),
            will.payload.to_vec(),
            will.qos,
            will.retain,
        ));
    }

    Packet::Connect(connect)
}

/// Create a CONNACK packet.
pub fn create_connack(session_present: bool, code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck::new(code, session_present))
}

/// Create a PUBLISH packet.
pub fn create_publish(topic: &str, payload: Bytes, qos: QoS, retain: bool, pkid: u16) -> Packet {
    let mut publish = Publish::from_bytes(topic, qos, payload);
    publish.retain = retain;
    if qos != QoS::AtMostOnce {
        publish.pkid = pkid;
    }
    Packet::Publish(publish)
}

/// Create a PUBACK packet.
pub fn create_puback(pkid: u16) -> Packet {
    Packet::PubAck(PubAck::new(pkid))
}

/// Create a PUBREC packet.
pub fn create_pubrec(pkid: u16) -> Packet {
    Packet::PubRec(PubRec::new(pkid))
}

/// Create a PUBREL packet.
pub fn create_pubrel(pkid: u16) -> Packet {
    Packet::PubRel(PubRel::new(pkid))
}

/// Create a PUBCOMP packet.
pub fn create_pubcomp(pkid: u16) -> Packet {
    Packet::PubComp(PubComp::new(pkid))
}

/// Create a SUBSCRIBE packet for one filter.
pub fn create_subscribe(pkid: u16, filter: &str, qos: QoS) -> Packet {
    let mut subscribe = Subscribe::new_many(vec![SubscribeFilter::new(filter.to_string(), qos)]);
    subscribe.pkid = pkid;
    Packet::Subscribe(subscribe)
}

/// Create a SUBACK packet.
pub fn create_suback(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> Packet {
    Packet::SubAck(SubAck::new(pkid, return_codes))
}

/// Create an UNSUBSCRIBE packet for one filter.
pub fn create_unsubscribe(pkid: u16, filter: &str) -> Packet {
    Packet::Unsubscribe(Unsubscribe {
        pkid,
        topics: vec![filter.to_string()],
    })
}

/// Create an UNSUBACK packet.
pub fn create_unsuback(pkid: u16) -> Packet {
    Packet::UnsubAck(UnsubAck::new(pkid))
}

/// Create a PINGREQ packet.
pub fn create_pingreq() -> Packet {
    Packet::PingReq
}

/// Create a PINGRESP packet.
pub fn create_pingresp() -> Packet {
    Packet::PingResp
}

/// Create a DISCONNECT packet.
pub fn create_disconnect() -> Packet {
    Packet::Disconnect
}

/// Packet name for logs.
pub fn packet_kind(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}
