//! MQTT-SN wire codec.
//!
//! The gateway and client only ever see decoded [`Packet`]s. The byte layout
//! lives behind the [`Codec`] trait so a session can be driven by another
//! protocol dialect without touching its control flow.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::packet::*;
use crate::types::{QoS, ReturnCode, TopicIdType};

/// Largest datagram the 3-byte length header can describe.
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// Largest PUBLISH payload that fits a datagram: the long header, flags,
/// topic id and message id take 9 bytes.
pub const MAX_PUBLISH_DATA: usize = MAX_DATAGRAM_SIZE - 9;

mod msg_type {
    pub const ADVERTISE: u8 = 0x00;
    pub const SEARCHGW: u8 = 0x01;
    pub const GWINFO: u8 = 0x02;
    pub const CONNECT: u8 = 0x04;
    pub const CONNACK: u8 = 0x05;
    pub const WILLTOPICREQ: u8 = 0x06;
    pub const WILLTOPIC: u8 = 0x07;
    pub const WILLMSGREQ: u8 = 0x08;
    pub const WILLMSG: u8 = 0x09;
    pub const REGISTER: u8 = 0x0A;
    pub const REGACK: u8 = 0x0B;
    pub const PUBLISH: u8 = 0x0C;
    pub const PUBACK: u8 = 0x0D;
    pub const PUBCOMP: u8 = 0x0E;
    pub const PUBREC: u8 = 0x0F;
    pub const PUBREL: u8 = 0x10;
    pub const SUBSCRIBE: u8 = 0x12;
    pub const SUBACK: u8 = 0x13;
    pub const UNSUBSCRIBE: u8 = 0x14;
    pub const UNSUBACK: u8 = 0x15;
    pub const PINGREQ: u8 = 0x16;
    pub const PINGRESP: u8 = 0x17;
    pub const DISCONNECT: u8 = 0x18;
    pub const AUTH: u8 = 0x1E;
}

const FLAG_DUP: u8 = 0x80;
const FLAG_RETAIN: u8 = 0x10;
const FLAG_WILL: u8 = 0x08;
const FLAG_CLEAN_SESSION: u8 = 0x04;

/// Packet marshalling for one protocol dialect.
pub trait Codec: Send + Sync {
    /// Dialect name for logs.
    fn name(&self) -> &'static str;

    /// Decode exactly one packet from a datagram.
    fn decode(&self, datagram: &[u8]) -> Result<Packet>;

    /// Encode one packet into a datagram.
    fn encode(&self, packet: &Packet) -> Result<Bytes>;
}

/// MQTT-SN 1.2 codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttSnCodec;

impl Codec for MqttSnCodec {
    fn name(&self) -> &'static str {
        "MQTT-SN 1.2"
    }

    fn decode(&self, datagram: &[u8]) -> Result<Packet> {
        let (length, header_len) = match datagram {
            [] => return Err(Error::Protocol("empty datagram".to_string())),
            [0x01, hi, lo, ..] => (u16::from_be_bytes([*hi, *lo]) as usize, 3),
            [0x01, ..] => return Err(Error::Protocol("truncated length header".to_string())),
            [n, ..] => (*n as usize, 1),
        };
        if length != datagram.len() || length <= header_len {
            return Err(Error::Protocol(format!(
                "length field {} does not match datagram of {} bytes",
                length,
                datagram.len()
            )));
        }

        let kind = datagram[header_len];
        let mut r = Reader::new(&datagram[header_len + 1..]);

        let packet = match kind {
            msg_type::ADVERTISE => Packet::Advertise(Advertise {
                gateway_id: r.u8()?,
                duration: r.u16()?,
            }),
            msg_type::SEARCHGW => Packet::SearchGw(SearchGw { radius: r.u8()? }),
            msg_type::GWINFO => Packet::GwInfo(GwInfo {
                gateway_id: r.u8()?,
                address: r.rest_bytes(),
            }),
            msg_type::CONNECT => {
                let flags = r.u8()?;
                Packet::Connect(Connect {
                    will: flags & FLAG_WILL != 0,
                    clean_session: flags & FLAG_CLEAN_SESSION != 0,
                    protocol_id: r.u8()?,
                    duration: r.u16()?,
                    client_id: r.rest_string()?,
                })
            }
            msg_type::CONNACK => Packet::ConnAck(ConnAck {
                code: ReturnCode::from_u8(r.u8()?),
            }),
            msg_type::WILLTOPICREQ => Packet::WillTopicReq,
            msg_type::WILLTOPIC => {
                if r.is_empty() {
                    Packet::WillTopic(WillTopic {
                        qos: QoS::AtMostOnce,
                        retain: false,
                        topic: String::new(),
                    })
                } else {
                    let flags = r.u8()?;
                    Packet::WillTopic(WillTopic {
                        qos: qos_of(flags),
                        retain: flags & FLAG_RETAIN != 0,
                        topic: r.rest_string()?,
                    })
                }
            }
            msg_type::WILLMSGREQ => Packet::WillMsgReq,
            msg_type::WILLMSG => Packet::WillMsg(WillMsg {
                message: r.rest_bytes(),
            }),
            msg_type::REGISTER => Packet::Register(Register {
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                topic_name: r.rest_string()?,
            }),
            msg_type::REGACK => Packet::RegAck(RegAck {
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                code: ReturnCode::from_u8(r.u8()?),
            }),
            msg_type::PUBLISH => {
                let flags = r.u8()?;
                let kind = topic_type_of(flags)?;
                Packet::Publish(Publish {
                    dup: flags & FLAG_DUP != 0,
                    qos: qos_of(flags),
                    retain: flags & FLAG_RETAIN != 0,
                    topic: TopicRef { kind, id: r.u16()? },
                    msg_id: r.u16()?,
                    data: r.rest_bytes(),
                })
            }
            msg_type::PUBACK => Packet::PubAck(PubAck {
                topic_id: r.u16()?,
                msg_id: r.u16()?,
                code: ReturnCode::from_u8(r.u8()?),
            }),
            msg_type::PUBCOMP => Packet::PubComp(r.u16()?),
            msg_type::PUBREC => Packet::PubRec(r.u16()?),
            msg_type::PUBREL => Packet::PubRel(r.u16()?),
            msg_type::SUBSCRIBE => {
                let flags = r.u8()?;
                let msg_id = r.u16()?;
                Packet::Subscribe(Subscribe {
                    dup: flags & FLAG_DUP != 0,
                    qos: qos_of(flags),
                    msg_id,
                    topic: r.topic_filter(topic_type_of(flags)?)?,
                })
            }
            msg_type::SUBACK => {
                let flags = r.u8()?;
                Packet::SubAck(SubAck {
                    qos: qos_of(flags),
                    topic_id: r.u16()?,
                    msg_id: r.u16()?,
                    code: ReturnCode::from_u8(r.u8()?),
                })
            }
            msg_type::UNSUBSCRIBE => {
                let flags = r.u8()?;
                let msg_id = r.u16()?;
                Packet::Unsubscribe(Unsubscribe {
                    msg_id,
                    topic: r.topic_filter(topic_type_of(flags)?)?,
                })
            }
            msg_type::UNSUBACK => Packet::UnsubAck(r.u16()?),
            msg_type::PINGREQ => {
                let client_id = r.rest_string()?;
                Packet::PingReq(PingReq {
                    client_id: (!client_id.is_empty()).then_some(client_id),
                })
            }
            msg_type::PINGRESP => Packet::PingResp,
            msg_type::DISCONNECT => {
                let duration = if r.is_empty() { None } else { Some(r.u16()?) };
                Packet::Disconnect(Disconnect { duration })
            }
            msg_type::AUTH => {
                let reason = r.u8()?;
                let method_len = r.u8()? as usize;
                let method = String::from_utf8(r.take(method_len)?.to_vec())
                    .map_err(|_| Error::Protocol("auth method is not utf-8".to_string()))?;
                Packet::Auth(Auth {
                    reason,
                    method,
                    data: r.rest_bytes(),
                })
            }
            other => {
                return Err(Error::Protocol(format!("unsupported message type 0x{:02x}", other)));
            }
        };

        r.finish(packet.kind())?;
        Ok(packet)
    }

    fn encode(&self, packet: &Packet) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64);
        let kind = match packet {
            Packet::Advertise(p) => {
                body.put_u8(p.gateway_id);
                body.put_u16(p.duration);
                msg_type::ADVERTISE
            }
            Packet::SearchGw(p) => {
                body.put_u8(p.radius);
                msg_type::SEARCHGW
            }
            Packet::GwInfo(p) => {
                body.put_u8(p.gateway_id);
                body.put_slice(&p.address);
                msg_type::GWINFO
            }
            Packet::Connect(p) => {
                let mut flags = 0;
                if p.will {
                    flags |= FLAG_WILL;
                }
                if p.clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                body.put_u8(flags);
                body.put_u8(p.protocol_id);
                body.put_u16(p.duration);
                body.put_slice(p.client_id.as_bytes());
                msg_type::CONNECT
            }
            Packet::ConnAck(p) => {
                body.put_u8(p.code.to_u8());
                msg_type::CONNACK
            }
            Packet::WillTopicReq => msg_type::WILLTOPICREQ,
            Packet::WillTopic(p) => {
                if !p.topic.is_empty() {
                    body.put_u8(flags(false, p.qos, p.retain, TopicIdType::Normal));
                    body.put_slice(p.topic.as_bytes());
                }
                msg_type::WILLTOPIC
            }
            Packet::WillMsgReq => msg_type::WILLMSGREQ,
            Packet::WillMsg(p) => {
                body.put_slice(&p.message);
                msg_type::WILLMSG
            }
            Packet::Register(p) => {
                body.put_u16(p.topic_id);
                body.put_u16(p.msg_id);
                body.put_slice(p.topic_name.as_bytes());
                msg_type::REGISTER
            }
            Packet::RegAck(p) => {
                body.put_u16(p.topic_id);
                body.put_u16(p.msg_id);
                body.put_u8(p.code.to_u8());
                msg_type::REGACK
            }
            Packet::Publish(p) => {
                body.put_u8(flags(p.dup, p.qos, p.retain, p.topic.kind));
                body.put_u16(p.topic.id);
                body.put_u16(p.msg_id);
                body.put_slice(&p.data);
                msg_type::PUBLISH
            }
            Packet::PubAck(p) => {
                body.put_u16(p.topic_id);
                body.put_u16(p.msg_id);
                body.put_u8(p.code.to_u8());
                msg_type::PUBACK
            }
            Packet::PubComp(id) => {
                body.put_u16(*id);
                msg_type::PUBCOMP
            }
            Packet::PubRec(id) => {
                body.put_u16(*id);
                msg_type::PUBREC
            }
            Packet::PubRel(id) => {
                body.put_u16(*id);
                msg_type::PUBREL
            }
            Packet::Subscribe(p) => {
                body.put_u8(flags(p.dup, p.qos, false, p.topic.id_type()));
                body.put_u16(p.msg_id);
                put_topic_filter(&mut body, &p.topic);
                msg_type::SUBSCRIBE
            }
            Packet::SubAck(p) => {
                body.put_u8(flags(false, p.qos, false, TopicIdType::Normal));
                body.put_u16(p.topic_id);
                body.put_u16(p.msg_id);
                body.put_u8(p.code.to_u8());
                msg_type::SUBACK
            }
            Packet::Unsubscribe(p) => {
                body.put_u8(flags(false, QoS::AtMostOnce, false, p.topic.id_type()));
                body.put_u16(p.msg_id);
                put_topic_filter(&mut body, &p.topic);
                msg_type::UNSUBSCRIBE
            }
            Packet::UnsubAck(id) => {
                body.put_u16(*id);
                msg_type::UNSUBACK
            }
            Packet::PingReq(p) => {
                if let Some(client_id) = &p.client_id {
                    body.put_slice(client_id.as_bytes());
                }
                msg_type::PINGREQ
            }
            Packet::PingResp => msg_type::PINGRESP,
            Packet::Disconnect(p) => {
                if let Some(duration) = p.duration {
                    body.put_u16(duration);
                }
                msg_type::DISCONNECT
            }
            Packet::Auth(p) => {
                let method_len = u8::try_from(p.method.len())
                    .map_err(|_| Error::Protocol("auth method too long".to_string()))?;
                body.put_u8(p.reason);
                body.put_u8(method_len);
                body.put_slice(p.method.as_bytes());
                body.put_slice(&p.data);
                msg_type::AUTH
            }
        };

        frame(kind, &body)
    }
}

fn frame(kind: u8, body: &[u8]) -> Result<Bytes> {
    let short_len = body.len() + 2;
    if short_len < 256 {
        let mut out = BytesMut::with_capacity(short_len);
        out.put_u8(short_len as u8);
        out.put_u8(kind);
        out.put_slice(body);
        return Ok(out.freeze());
    }

    let long_len = body.len() + 4;
    if long_len > MAX_DATAGRAM_SIZE {
        return Err(Error::Protocol(format!(
            "packet of {} bytes exceeds datagram limit",
            long_len
        )));
    }
    let mut out = BytesMut::with_capacity(long_len);
    out.put_u8(0x01);
    out.put_u16(long_len as u16);
    out.put_u8(kind);
    out.put_slice(body);
    Ok(out.freeze())
}

fn flags(dup: bool, qos: QoS, retain: bool, topic: TopicIdType) -> u8 {
    let mut flags = (qos.bits() << 5) | topic.bits();
    if dup {
        flags |= FLAG_DUP;
    }
    if retain {
        flags |= FLAG_RETAIN;
    }
    flags
}

fn qos_of(flags: u8) -> QoS {
    QoS::from_bits(flags >> 5)
}

fn topic_type_of(flags: u8) -> Result<TopicIdType> {
    TopicIdType::from_bits(flags)
        .ok_or_else(|| Error::Protocol("reserved topic id type".to_string()))
}

fn put_topic_filter(body: &mut BytesMut, topic: &TopicFilter) {
    match topic {
        TopicFilter::Name(name) => body.put_slice(name.as_bytes()),
        TopicFilter::Predefined(id) | TopicFilter::Short(id) => body.put_u16(*id),
    }
}

/// Bounds-checked cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Protocol("truncated packet".to_string()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn rest_bytes(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.buf);
        self.buf = &[];
        rest
    }

    fn rest_string(&mut self) -> Result<String> {
        let rest = std::str::from_utf8(self.buf)
            .map_err(|_| Error::Protocol("string field is not utf-8".to_string()))?
            .to_string();
        self.buf = &[];
        Ok(rest)
    }

    fn topic_filter(&mut self, kind: TopicIdType) -> Result<TopicFilter> {
        match kind {
            TopicIdType::Normal => Ok(TopicFilter::Name(self.rest_string()?)),
            TopicIdType::Predefined => Ok(TopicFilter::Predefined(self.u16()?)),
            TopicIdType::Short => Ok(TopicFilter::Short(self.u16()?)),
        }
    }

    fn finish(&self, kind: &str) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Error::Protocol(format!("{} has {} trailing bytes", kind, self.buf.len())))
        }
    }
}
