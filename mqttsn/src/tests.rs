//! Integration tests for the gateway session.
//!
//! Each test drives one [`Session`] from both sides: raw MQTT-SN datagrams
//! on an in-memory pipe for the client leg, and real MQTT 3.1.1 framing over
//! `tokio::io::duplex` for the broker leg. The last module runs the UDP
//! gateway and the client library against a standard rumqttd broker.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, MqttSnCodec};
use crate::error::{Error, Result};
use crate::gateway::{GatewayConfig, Session};
use crate::mqtt;
use crate::packet::{
    ConnAck, Connect, Disconnect, Packet, PingReq, PubAck, Publish, RegAck, Register, SubAck,
    Subscribe, TopicFilter, TopicRef,
};
use crate::topics::{self, PredefinedTopics};
use crate::transport::{pipe, PipeTransport, Transport};
use crate::types::{QoS, ReturnCode, PROTOCOL_ID};

const AB: u16 = 0x6162;

fn config() -> GatewayConfig {
    GatewayConfig::new("127.0.0.1:0", "127.0.0.1:1883").with_retry(Duration::from_secs(5), 3)
}

fn connect_request(client_id: &str) -> Connect {
    Connect {
        will: false,
        clean_session: true,
        protocol_id: PROTOCOL_ID,
        duration: 60,
        client_id: client_id.to_string(),
    }
}

fn connect_packet(client_id: &str) -> Packet {
    Packet::Connect(connect_request(client_id))
}

fn sn_publish(qos: QoS, topic: TopicRef, msg_id: u16, data: &'static [u8]) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain: false,
        topic,
        msg_id,
        data: Bytes::from_static(data),
    })
}

fn broker_publish(topic: &str, qos: mqtt::QoS, pkid: u16, data: &'static [u8]) -> mqtt::Packet {
    mqtt::create_publish(topic, Bytes::from_static(data), qos, false, pkid)
}

/// Both far ends of one gateway session.
struct Harness {
    client: PipeTransport,
    broker: DuplexStream,
    buf: BytesMut,
    session: JoinHandle<Result<()>>,
}

impl Harness {
    fn start(config: GatewayConfig) -> Self {
        let (client, gateway_side) = pipe(64);
        let (broker, broker_side) = tokio::io::duplex(64 * 1024);
        let session = Session::new(Arc::new(config), gateway_side, &CancellationToken::new());
        Self {
            client,
            broker,
            buf: BytesMut::new(),
            session: tokio::spawn(session.run(broker_side)),
        }
    }

    async fn send(&self, packet: Packet) {
        let datagram = MqttSnCodec.encode(&packet).unwrap();
        self.client.send(datagram, Duration::from_secs(1)).await.unwrap();
    }

    async fn recv_within(&self, timeout: Duration) -> Option<Packet> {
        let datagram = self.client.recv(timeout).await.ok().flatten()?;
        Some(MqttSnCodec.decode(&datagram).unwrap())
    }

    async fn recv(&self) -> Packet {
        self.recv_within(Duration::from_secs(120))
            .await
            .expect("no packet from gateway")
    }

    async fn broker_recv_within(&mut self, timeout: Duration) -> Option<mqtt::Packet> {
        let read = mqtt::read_packet(&mut self.broker, &mut self.buf, mqtt::MAX_PACKET_SIZE);
        tokio::time::timeout(timeout, read).await.ok()?.ok()
    }

    async fn broker_recv(&mut self) -> mqtt::Packet {
        self.broker_recv_within(Duration::from_secs(120))
            .await
            .expect("no packet toward broker")
    }

    async fn broker_send(&mut self, packet: mqtt::Packet) {
        mqtt::write_packet(&mut self.broker, &packet).await.unwrap();
    }

    async fn connect(&mut self, client_id: &str) {
        self.send(connect_packet(client_id)).await;
        match self.broker_recv().await {
            mqtt::Packet::Connect(connect) => assert_eq!(connect.client_id, client_id),
            other => panic!("unexpected {:?}", other),
        }
        self.broker_send(mqtt::create_connack(false, mqtt::ConnectReturnCode::Success))
            .await;
        assert_eq!(
            self.recv().await,
            Packet::ConnAck(ConnAck {
                code: ReturnCode::Accepted
            })
        );
    }

    async fn finish(self) -> Result<()> {
        self.session.await.unwrap()
    }
}

// ============================================================================
// Handshake
// ============================================================================

mod handshake {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_connect_supersedes_first() {
        let mut h = Harness::start(config());
        h.send(connect_packet("dev")).await;
        h.send(connect_packet("dev")).await;

        // Exactly one MQTT CONNECT: the broker link is shared.
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Connect(_)));
        h.broker_send(mqtt::create_connack(false, mqtt::ConnectReturnCode::Success))
            .await;

        assert_eq!(
            h.recv().await,
            Packet::ConnAck(ConnAck {
                code: ReturnCode::Accepted
            })
        );
        assert_eq!(h.recv_within(Duration::from_secs(1)).await, None);

        // Active: PINGREQ is answered and forwarded.
        h.send(Packet::PingReq(PingReq::default())).await;
        assert_eq!(h.recv().await, Packet::PingResp);
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PingReq));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_refusal_ends_session() {
        let mut h = Harness::start(config());
        h.send(connect_packet("dev")).await;
        h.broker_recv().await;
        h.broker_send(mqtt::create_connack(false, mqtt::ConnectReturnCode::NotAuthorized))
            .await;

        assert_eq!(
            h.recv().await,
            Packet::ConnAck(ConnAck {
                code: ReturnCode::NotSupported
            })
        );
        assert!(matches!(h.finish().await, Err(Error::ConnectionRefused(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline() {
        let h = Harness::start(config().with_connect_timeout(Duration::from_secs(30)));
        h.send(connect_packet("dev")).await;
        // The broker never answers.
        assert!(matches!(h.finish().await, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_before_connect_terminates() {
        let h = Harness::start(config());
        h.send(sn_publish(QoS::AtLeastOnce, TopicRef::short(AB), 1, b"x")).await;
        assert!(matches!(h.finish().await, Err(Error::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessionless_publish_to_predefined_topic() {
        let mut predefined = PredefinedTopics::new();
        predefined.insert(topics::ANY_CLIENT, 7, "sensors/temp");
        let mut h = Harness::start(config().with_predefined(predefined));

        h.send(sn_publish(QoS::FireAndForget, TopicRef::predefined(7), 0, b"21"))
            .await;

        match h.broker_recv().await {
            mqtt::Packet::Connect(connect) => {
                assert!(connect.client_id.starts_with("mqttsn-"));
                assert_eq!(connect.keep_alive, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match h.broker_recv().await {
            mqtt::Packet::Publish(publish) => {
                assert_eq!(publish.topic, "sensors/temp");
                assert_eq!(publish.qos, mqtt::QoS::AtMostOnce);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_on_sessionless_link_is_turned_away() {
        let mut h = Harness::start(config());
        h.send(sn_publish(QoS::FireAndForget, TopicRef::short(AB), 0, b"x")).await;
        match h.broker_recv().await {
            mqtt::Packet::Connect(connect) => assert!(connect.client_id.starts_with("mqttsn-")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Publish(_)));
        h.broker_send(mqtt::create_connack(false, mqtt::ConnectReturnCode::Success))
            .await;

        h.send(connect_packet("dev")).await;
        assert_eq!(
            h.recv().await,
            Packet::ConnAck(ConnAck {
                code: ReturnCode::Congestion
            })
        );
        // No second CONNECT: the anonymous broker session is closed instead.
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Disconnect));
        assert!(matches!(h.finish().await, Err(Error::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessionless_publish_rejected_with_auth() {
        let h = Harness::start(config().with_auth(true));
        h.send(sn_publish(QoS::FireAndForget, TopicRef::short(AB), 0, b"x")).await;
        assert!(matches!(h.finish().await, Err(Error::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_disconnect() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(Packet::Disconnect(Disconnect::default())).await;
        assert_eq!(h.recv().await, Packet::Disconnect(Disconnect::default()));
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Disconnect));
        tokio_test::assert_ok!(h.finish().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_closure_is_fatal() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        let Harness { client, broker, session, .. } = h;
        drop(broker);
        assert!(matches!(session.await.unwrap(), Err(Error::ConnectionClosed)));

        let farewell = client.recv(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(
            MqttSnCodec.decode(&farewell).unwrap(),
            Packet::Disconnect(Disconnect::default())
        );
    }
}

// ============================================================================
// Publish bridging
// ============================================================================

mod publish {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_qos1_two_lost_acks_then_success() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(sn_publish(QoS::AtLeastOnce, TopicRef::short(AB), 21, b"x")).await;

        let mut attempts = Vec::new();
        for _ in 0..3 {
            match h.broker_recv().await {
                mqtt::Packet::Publish(publish) => {
                    assert_eq!(publish.topic, "ab");
                    assert_eq!(publish.pkid, 21);
                    attempts.push(publish.dup);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(attempts, vec![false, true, true]);

        h.broker_send(mqtt::create_puback(21)).await;
        assert_eq!(
            h.recv().await,
            Packet::PubAck(PubAck {
                topic_id: AB,
                msg_id: 21,
                code: ReturnCode::Accepted
            })
        );
        assert_eq!(h.broker_recv_within(Duration::from_secs(60)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_qos2() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(sn_publish(QoS::ExactlyOnce, TopicRef::short(AB), 3, b"x")).await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Publish(p) if p.pkid == 3));

        h.broker_send(mqtt::create_pubrec(3)).await;
        assert_eq!(h.recv().await, Packet::PubRec(3));

        // A retransmitted PUBLISH gets the PUBREC again, not a second forward.
        h.send(sn_publish(QoS::ExactlyOnce, TopicRef::short(AB), 3, b"x")).await;
        assert_eq!(h.recv().await, Packet::PubRec(3));

        h.send(Packet::PubRel(3)).await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubRel(r) if r.pkid == 3));

        h.broker_send(mqtt::create_pubcomp(3)).await;
        assert_eq!(h.recv().await, Packet::PubComp(3));

        // Late PUBREL for the finished exchange is still completed.
        h.send(Packet::PubRel(3)).await;
        assert_eq!(h.recv().await, Packet::PubComp(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_downstream_qos2_registers_first() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.broker_send(broker_publish("rooms/kitchen", mqtt::QoS::ExactlyOnce, 9, b"on"))
            .await;

        let register = match h.recv().await {
            Packet::Register(register) => register,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(register.topic_name, "rooms/kitchen");
        assert_eq!(register.msg_id, 9);
        assert_ne!(register.topic_id, 0);

        // PUBREC toward the broker waits for the registration.
        h.send(Packet::PubRec(9)).await;
        assert_eq!(h.broker_recv_within(Duration::from_secs(1)).await, None);

        h.send(Packet::RegAck(RegAck {
            topic_id: register.topic_id,
            msg_id: 9,
            code: ReturnCode::Accepted,
        }))
        .await;
        match h.recv().await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, TopicRef::normal(register.topic_id));
                assert_eq!(publish.msg_id, 9);
                assert_eq!(publish.qos, QoS::ExactlyOnce);
            }
            other => panic!("unexpected {:?}", other),
        }

        h.send(Packet::PubRec(9)).await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubRec(r) if r.pkid == 9));

        h.broker_send(mqtt::create_pubrel(9)).await;
        assert_eq!(h.recv().await, Packet::PubRel(9));

        h.send(Packet::PubComp(9)).await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubComp(c) if c.pkid == 9));

        // The alias is now known: the next message skips registration.
        h.broker_send(broker_publish("rooms/kitchen", mqtt::QoS::AtMostOnce, 0, b"off"))
            .await;
        match h.recv().await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, TopicRef::normal(register.topic_id));
                assert_eq!(publish.msg_id, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_predefined_topic_never_registers() {
        let mut predefined = PredefinedTopics::new();
        predefined
            .insert(topics::ANY_CLIENT, 7, "sensors/temp")
            .insert("dev", 8, "dev/cmd");
        let mut h = Harness::start(config().with_predefined(predefined));
        h.connect("dev").await;

        h.send(sn_publish(QoS::AtLeastOnce, TopicRef::predefined(7), 1, b"21"))
            .await;
        match h.broker_recv().await {
            mqtt::Packet::Publish(publish) => assert_eq!(publish.topic, "sensors/temp"),
            other => panic!("unexpected {:?}", other),
        }
        h.broker_send(mqtt::create_puback(1)).await;
        assert!(matches!(h.recv().await, Packet::PubAck(a) if a.code == ReturnCode::Accepted));

        h.broker_send(broker_publish("dev/cmd", mqtt::QoS::AtLeastOnce, 4, b"reboot"))
            .await;
        match h.recv().await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, TopicRef::predefined(8));
                assert_eq!(publish.msg_id, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        h.send(Packet::PubAck(PubAck {
            topic_id: 8,
            msg_id: 4,
            code: ReturnCode::Accepted,
        }))
        .await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubAck(a) if a.pkid == 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_topic_id_rejected() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(sn_publish(QoS::AtLeastOnce, TopicRef::normal(99), 5, b"x")).await;
        assert_eq!(
            h.recv().await,
            Packet::PubAck(PubAck {
                topic_id: 99,
                msg_id: 5,
                code: ReturnCode::InvalidTopicId
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_broker_publish_is_dropped() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        let big = Bytes::from(vec![7u8; 70_000]);
        for (qos, pkid) in [(mqtt::QoS::AtMostOnce, 0), (mqtt::QoS::AtLeastOnce, 8)] {
            h.broker_send(mqtt::create_publish("ab", big.clone(), qos, false, pkid))
                .await;
        }
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubAck(a) if a.pkid == 8));

        h.broker_send(mqtt::create_publish("ab", big, mqtt::QoS::ExactlyOnce, false, 9))
            .await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubRec(r) if r.pkid == 9));
        h.broker_send(mqtt::create_pubrel(9)).await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubComp(c) if c.pkid == 9));

        // The session carries on with traffic that fits.
        h.broker_send(broker_publish("ab", mqtt::QoS::AtMostOnce, 0, b"small")).await;
        assert!(matches!(h.recv().await, Packet::Publish(p) if p.data == "small"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unframeable_register_is_skipped() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        // Fits MQTT, but a REGISTER carrying it does not fit a datagram.
        let long_topic = "t".repeat(65_530);
        h.broker_send(mqtt::create_publish(
            &long_topic,
            Bytes::from_static(b"x"),
            mqtt::QoS::AtMostOnce,
            false,
            0,
        ))
        .await;
        h.broker_send(broker_publish("ab", mqtt::QoS::AtMostOnce, 0, b"next")).await;
        assert!(matches!(h.recv().await, Packet::Publish(p) if p.data == "next"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_assigns_unique_ids() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        let register = |msg_id: u16, name: &str| {
            Packet::Register(Register {
                topic_id: 0,
                msg_id,
                topic_name: name.to_string(),
            })
        };
        let mut ids = Vec::new();
        for (msg_id, name) in [(1, "a/b"), (2, "c/d"), (3, "a/b")] {
            h.send(register(msg_id, name)).await;
            match h.recv().await {
                Packet::RegAck(ack) => {
                    assert_eq!(ack.msg_id, msg_id);
                    assert_eq!(ack.code, ReturnCode::Accepted);
                    ids.push(ack.topic_id);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(ids.iter().all(|id| *id != 0));
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[0], ids[2]);

        h.send(register(4, "a/#")).await;
        assert!(matches!(h.recv().await, Packet::RegAck(a) if a.code == ReturnCode::NotSupported));
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_exhaustion_keeps_session() {
        let mut h = Harness::start(config().with_max_topic_aliases(1));
        h.connect("dev").await;

        let register = |msg_id: u16, name: &str| {
            Packet::Register(Register {
                topic_id: 0,
                msg_id,
                topic_name: name.to_string(),
            })
        };
        h.send(register(1, "a/b")).await;
        assert!(matches!(h.recv().await, Packet::RegAck(a) if a.code == ReturnCode::Accepted));

        h.send(register(2, "c/d")).await;
        assert_eq!(
            h.recv().await,
            Packet::RegAck(RegAck {
                topic_id: 0,
                msg_id: 2,
                code: ReturnCode::Congestion
            })
        );

        h.send(Packet::Subscribe(Subscribe {
            dup: false,
            qos: QoS::AtLeastOnce,
            msg_id: 3,
            topic: TopicFilter::Name("x/y".to_string()),
        }))
        .await;
        assert_eq!(
            h.recv().await,
            Packet::SubAck(SubAck {
                qos: QoS::AtLeastOnce,
                topic_id: 0,
                msg_id: 3,
                code: ReturnCode::Congestion
            })
        );

        // No id left to register a new broker topic: that message is dropped.
        h.broker_send(broker_publish("e/f", mqtt::QoS::AtMostOnce, 0, b"lost")).await;
        h.broker_send(broker_publish("ab", mqtt::QoS::AtMostOnce, 0, b"kept")).await;
        assert!(matches!(h.recv().await, Packet::Publish(p) if p.data == "kept"));

        h.send(Packet::PingReq(PingReq::default())).await;
        assert_eq!(h.recv().await, Packet::PingResp);
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

mod subscribe {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_relays_suback() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(Packet::Subscribe(Subscribe {
            dup: false,
            qos: QoS::ExactlyOnce,
            msg_id: 3,
            topic: TopicFilter::Name("rooms/+".to_string()),
        }))
        .await;
        match h.broker_recv().await {
            mqtt::Packet::Subscribe(subscribe) => {
                assert_eq!(subscribe.pkid, 3);
                assert_eq!(subscribe.filters[0].path, "rooms/+");
            }
            other => panic!("unexpected {:?}", other),
        }
        h.broker_send(mqtt::create_suback(
            3,
            vec![mqtt::SubscribeReasonCode::Success(mqtt::QoS::AtLeastOnce)],
        ))
        .await;
        assert_eq!(
            h.recv().await,
            Packet::SubAck(SubAck {
                qos: QoS::AtLeastOnce,
                topic_id: 0,
                msg_id: 3,
                code: ReturnCode::Accepted
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_without_broker_answer_is_rejected() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(Packet::Subscribe(Subscribe {
            dup: false,
            qos: QoS::AtLeastOnce,
            msg_id: 4,
            topic: TopicFilter::Name("alerts".to_string()),
        }))
        .await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Subscribe(_)));

        match h.recv().await {
            Packet::SubAck(ack) => {
                assert_eq!(ack.msg_id, 4);
                assert_eq!(ack.code, ReturnCode::NotSupported);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscription_frees_its_alias() {
        let mut h = Harness::start(config().with_max_topic_aliases(1));
        h.connect("dev").await;

        h.send(Packet::Subscribe(Subscribe {
            dup: false,
            qos: QoS::AtLeastOnce,
            msg_id: 4,
            topic: TopicFilter::Name("alerts".to_string()),
        }))
        .await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Subscribe(s) if s.pkid == 4));
        h.broker_send(mqtt::create_suback(4, vec![mqtt::SubscribeReasonCode::Failure]))
            .await;
        match h.recv().await {
            Packet::SubAck(ack) => {
                assert_eq!(ack.msg_id, 4);
                assert_eq!(ack.code, ReturnCode::NotSupported);
            }
            other => panic!("unexpected {:?}", other),
        }

        // The only id is free again.
        h.send(Packet::Register(Register {
            topic_id: 0,
            msg_id: 5,
            topic_name: "c/d".to_string(),
        }))
        .await;
        assert!(matches!(h.recv().await, Packet::RegAck(a) if a.code == ReturnCode::Accepted));
        assert_eq!(h.recv_within(Duration::from_secs(60)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(Packet::Unsubscribe(crate::packet::Unsubscribe {
            msg_id: 6,
            topic: TopicFilter::Short(AB),
        }))
        .await;
        match h.broker_recv().await {
            mqtt::Packet::Unsubscribe(unsubscribe) => {
                assert_eq!(unsubscribe.pkid, 6);
                assert_eq!(unsubscribe.topics, vec!["ab".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
        h.broker_send(mqtt::create_unsuback(6)).await;
        assert_eq!(h.recv().await, Packet::UnsubAck(6));
    }
}

// ============================================================================
// Sleep
// ============================================================================

mod sleep {
    use super::*;

    fn wake_ping() -> Packet {
        Packet::PingReq(PingReq {
            client_id: Some("dev".to_string()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_messages_flush_in_order() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(Packet::Disconnect(Disconnect { duration: Some(60) })).await;
        assert_eq!(h.recv().await, Packet::Disconnect(Disconnect::default()));

        h.broker_send(broker_publish("ab", mqtt::QoS::AtMostOnce, 0, b"1")).await;
        h.broker_send(broker_publish("ab", mqtt::QoS::AtLeastOnce, 5, b"2")).await;
        h.broker_send(broker_publish("ab", mqtt::QoS::AtMostOnce, 0, b"3")).await;
        assert_eq!(h.recv_within(Duration::from_secs(1)).await, None);

        h.send(wake_ping()).await;
        let mut payloads = Vec::new();
        for _ in 0..3 {
            match h.recv().await {
                Packet::Publish(publish) => {
                    assert_eq!(publish.topic, TopicRef::short(AB));
                    payloads.push(publish.data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(payloads, vec!["1", "2", "3"]);
        assert_eq!(h.recv().await, Packet::PingResp);

        h.send(Packet::PubAck(PubAck {
            topic_id: AB,
            msg_id: 5,
            code: ReturnCode::Accepted,
        }))
        .await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubAck(a) if a.pkid == 5));

        // Back asleep: new traffic waits for the next wake-up or reconnect.
        h.broker_send(broker_publish("ab", mqtt::QoS::AtMostOnce, 0, b"4")).await;
        assert_eq!(h.recv_within(Duration::from_secs(1)).await, None);

        h.send(connect_packet("dev")).await;
        assert_eq!(
            h.recv().await,
            Packet::ConnAck(ConnAck {
                code: ReturnCode::Accepted
            })
        );
        assert!(matches!(h.recv().await, Packet::Publish(p) if p.data == "4"));

        h.broker_send(broker_publish("ab", mqtt::QoS::AtMostOnce, 0, b"5")).await;
        assert!(matches!(h.recv().await, Packet::Publish(p) if p.data == "5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_publish_waits_for_wake() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.broker_send(broker_publish("ab", mqtt::QoS::AtLeastOnce, 5, b"x")).await;
        assert!(matches!(h.recv().await, Packet::Publish(p) if p.msg_id == 5 && !p.dup));

        h.send(Packet::Disconnect(Disconnect { duration: Some(300) })).await;
        assert_eq!(h.recv().await, Packet::Disconnect(Disconnect::default()));

        // Well past the whole retry budget, yet nothing reaches the sleeper.
        assert_eq!(h.recv_within(Duration::from_secs(60)).await, None);

        h.send(wake_ping()).await;
        match h.recv().await {
            Packet::Publish(publish) => {
                assert_eq!(publish.msg_id, 5);
                assert!(publish.dup);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.recv().await, Packet::PingResp);

        h.send(Packet::PubAck(PubAck {
            topic_id: AB,
            msg_id: 5,
            code: ReturnCode::Accepted,
        }))
        .await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PubAck(a) if a.pkid == 5));
        assert_eq!(h.recv_within(Duration::from_secs(60)).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_ack_for_sleeper_is_held() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(sn_publish(QoS::AtLeastOnce, TopicRef::short(AB), 9, b"x")).await;
        assert!(matches!(h.broker_recv().await, mqtt::Packet::Publish(p) if p.pkid == 9));

        h.send(Packet::Disconnect(Disconnect { duration: Some(300) })).await;
        assert_eq!(h.recv().await, Packet::Disconnect(Disconnect::default()));

        h.broker_send(mqtt::create_puback(9)).await;
        assert_eq!(h.recv_within(Duration::from_secs(30)).await, None);

        h.send(wake_ping()).await;
        assert_eq!(
            h.recv().await,
            Packet::PubAck(PubAck {
                topic_id: AB,
                msg_id: 9,
                code: ReturnCode::Accepted
            })
        );
        assert_eq!(h.recv().await, Packet::PingResp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_with_empty_buffer() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(Packet::Disconnect(Disconnect { duration: Some(60) })).await;
        h.recv().await;
        h.send(wake_ping()).await;
        assert_eq!(h.recv().await, Packet::PingResp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_wake_window_ends_session() {
        let mut h = Harness::start(config());
        h.connect("dev").await;

        h.send(Packet::Disconnect(Disconnect { duration: Some(10) })).await;
        assert_eq!(h.recv().await, Packet::Disconnect(Disconnect::default()));

        let Harness { client, session, .. } = h;
        assert!(matches!(session.await.unwrap(), Err(Error::Timeout(_))));
        let farewell = client.recv(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(
            MqttSnCodec.decode(&farewell).unwrap(),
            Packet::Disconnect(Disconnect::default())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_sleep_keeps_broker_alive() {
        let mut h = Harness::start(config());
        h.send(Packet::Connect(Connect {
            duration: 20,
            ..connect_request("dev")
        }))
        .await;
        h.broker_recv().await;
        h.broker_send(mqtt::create_connack(false, mqtt::ConnectReturnCode::Success))
            .await;
        h.recv().await;

        h.send(Packet::Disconnect(Disconnect { duration: Some(60) })).await;
        h.recv().await;

        // Every keep_alive / 2 while asleep.
        let start = tokio::time::Instant::now();
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PingReq));
        assert!(matches!(h.broker_recv().await, mqtt::Packet::PingReq));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
    }
}

// ============================================================================
// End to end: UDP gateway and client against rumqttd
// ============================================================================

mod end_to_end {
    use super::*;
    use crate::client::{Client, ClientConfig};
    use crate::gateway::Gateway;
    use crate::transport::UdpTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::UdpSocket;

    fn find_available_port() -> u16 {
        static PORT: AtomicUsize = AtomicUsize::new(19000);
        PORT.fetch_add(1, Ordering::SeqCst) as u16
    }

    fn create_rumqttd_config(addr: &str) -> rumqttd::Config {
        use rumqttd::{Config, ConnectionSettings, RouterConfig, ServerSettings};
        use std::collections::HashMap;
        use std::net::SocketAddr;

        let socket_addr: SocketAddr = addr.parse().unwrap();

        let mut servers = HashMap::new();
        servers.insert(
            "tcp".to_string(),
            ServerSettings {
                name: "tcp".to_string(),
                listen: socket_addr,
                tls: None,
                next_connection_delay_ms: 1,
                connections: ConnectionSettings {
                    connection_timeout_ms: 60000,
                    max_payload_size: 1024 * 1024,
                    max_inflight_count: 100,
                    auth: None,
                    external_auth: None,
                    dynamic_filters: false,
                },
            },
        );

        Config {
            id: 0,
            router: RouterConfig {
                max_connections: 1000,
                max_outgoing_packet_count: 200,
                max_segment_size: 1024 * 1024,
                max_segment_count: 10,
                ..Default::default()
            },
            v4: Some(servers),
            v5: None,
            ws: None,
            prometheus: None,
            metrics: None,
            console: None,
            bridge: None,
            cluster: None,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_through_gateway() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let broker_addr = format!("127.0.0.1:{}", find_available_port());
        let mut broker = rumqttd::Broker::new(create_rumqttd_config(&broker_addr));
        let _broker = std::thread::spawn(move || {
            broker.start().unwrap();
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = socket.local_addr().unwrap();
        let gateway = Arc::new(Gateway::new(
            GatewayConfig::new(gateway_addr.to_string(), broker_addr.clone())
                .with_retry(Duration::from_secs(1), 3),
        ));
        let server = Arc::clone(&gateway);
        tokio::spawn(async move { server.serve_on(socket).await });

        let transport = UdpTransport::connect(&gateway_addr.to_string()).await.unwrap();
        let client = Client::connect(
            transport,
            ClientConfig::new("e2e-client").with_retry(Duration::from_secs(1), 3),
        )
        .await
        .unwrap();
        assert_eq!(gateway.session_count(), 1);

        let granted = client.subscribe("e2e/topic", QoS::AtLeastOnce).await.unwrap();
        assert_eq!(granted, QoS::AtLeastOnce);

        client
            .publish("e2e/topic", "hello", QoS::AtLeastOnce, false)
            .await
            .unwrap();
        let message = client
            .recv_timeout(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("no message through the gateway");
        assert_eq!(message.topic, "e2e/topic");
        assert_eq!(message.payload, Bytes::from_static(b"hello"));

        client.disconnect().await.unwrap();
        gateway.shutdown();
    }
}
