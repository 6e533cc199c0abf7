//! End-to-end flows through the broker core
//!
//! Each test plays both sides: client packets are encoded to bytes, decoded
//! by a server-side `Decoder`, applied to the `Exchange`, and whatever lands
//! on the subscriber's session handle is encoded back to wire bytes and
//! decoded the way the client would see it.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use mqtt_exchange::codec::{Decoder, Encoder};
use mqtt_exchange::config::{ExchangeConfig, InflightConfig, SessionConfig};
use mqtt_exchange::exchange::Exchange;
use mqtt_exchange::inflight::{InflightManager, InflightMessage, SendError};
use mqtt_exchange::protocol::{
    Connect, Packet, Properties, ProtocolVersion, PubResponse, Publish, QoS, ReasonCode, SubAck,
    Subscribe, SubscribeFilter,
};
use mqtt_exchange::session::{ChannelSession, SessionCapabilities, SessionId};

/// Server-side state of one connection
struct Connection {
    id: SessionId,
    decoder: Decoder,
    encoder: Encoder,
    caps: SessionCapabilities,
    rx: mpsc::Receiver<Publish>,
    client_id: String,
}

fn client_bytes(version: ProtocolVersion, packet: &Packet) -> BytesMut {
    assert_ok!(Encoder::new(version).to_bytes(packet))
}

fn connect_packet(version: ProtocolVersion, client_id: &str, clean: bool) -> Packet {
    Packet::Connect(Box::new(Connect {
        protocol_version: version,
        client_id: client_id.to_string(),
        clean_start: clean,
        ..Connect::default()
    }))
}

fn accept(exchange: &Exchange, id: SessionId, bytes: &[u8]) -> Connection {
    let mut decoder = Decoder::new();
    let (packet, used) = assert_ok!(decoder.read(bytes));
    assert_eq!(used, bytes.len());
    let Packet::Connect(connect) = packet else {
        panic!("expected CONNECT, got {:?}", packet);
    };

    let mut caps = SessionCapabilities::new(&SessionConfig::default());
    if connect.protocol_version.is_v5() {
        caps.apply_connect_properties(&connect.properties);
    }

    let (session, rx) = ChannelSession::new(id, 64);
    exchange.add_session(id, Arc::new(session));
    Connection {
        id,
        decoder,
        encoder: Encoder::new(connect.protocol_version),
        caps,
        rx,
        client_id: connect.client_id.clone(),
    }
}

impl Connection {
    /// Feed one client packet; returns the server's reply bytes, if any
    fn handle(&mut self, exchange: &Exchange, bytes: &[u8]) -> Option<BytesMut> {
        let (packet, _) = assert_ok!(self.decoder.read(bytes));
        match packet {
            Packet::Subscribe(sub) => {
                let mut reason_codes = Vec::new();
                for f in &sub.filters {
                    match exchange.subscribe(self.id, &f.filter, f.options.qos) {
                        Ok(()) => {
                            reason_codes.push(ReasonCode::granted(f.options.qos));
                            for retained in exchange.get_retained_messages(&f.filter) {
                                let granted = retained.qos.min(f.options.qos);
                                let mut replay = retained.downgraded(granted);
                                replay.retain = true;
                                if let Some(session) = exchange.get_session(self.id) {
                                    session.deliver(replay);
                                }
                            }
                        }
                        Err(e) => reason_codes.push(e.reason_code()),
                    }
                }
                let ack = Packet::SubAck(SubAck {
                    packet_id: sub.packet_id,
                    reason_codes,
                    properties: Properties::default(),
                });
                Some(assert_ok!(self.encoder.to_bytes(&ack)))
            }
            Packet::Publish(mut publish) => {
                assert_ok!(self.caps.resolve_topic_alias(&mut publish));
                assert_ok!(exchange.publish(&publish));
                let id = publish.packet_id?;
                let reply = match publish.qos {
                    QoS::ExactlyOnce => Packet::PubRec(PubResponse::new(id)),
                    _ => Packet::PubAck(PubResponse::new(id)),
                };
                Some(assert_ok!(self.encoder.to_bytes(&reply)))
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    /// Encode everything queued for this client, registering QoS > 0
    /// messages with `inflight`
    fn flush(&mut self, inflight: &InflightManager) -> Vec<BytesMut> {
        let mut out = Vec::new();
        while let Ok(mut publish) = self.rx.try_recv() {
            if publish.qos.requires_ack() {
                assert!(self.caps.can_send_qos_message(inflight.len()));
                let id = inflight.next_packet_id().unwrap();
                publish.packet_id = Some(id);
                assert!(inflight.add(id, publish.clone()));
            }
            self.caps.assign_topic_alias(&mut publish);
            let bytes = assert_ok!(self.encoder.to_bytes(&Packet::Publish(publish)));
            assert!(self.caps.fits_packet_size(bytes.len()));
            out.push(bytes);
        }
        out
    }
}

fn client_decode(version: ProtocolVersion, bytes: &[u8]) -> Packet {
    let mut decoder = Decoder::new().with_protocol_version(version);
    assert_ok!(decoder.read(bytes)).0
}

fn no_resend() -> InflightManager {
    let sender = |_: &InflightMessage| -> Result<(), SendError> { Ok(()) };
    InflightManager::new(InflightConfig::default(), sender)
}

fn connect_bytes(version: ProtocolVersion, client_id: &str, clean: bool) -> BytesMut {
    client_bytes(version, &connect_packet(version, client_id, clean))
}

#[tokio::test]
async fn v5_subscriber_receives_v311_publish_with_alias_and_retained_replay() {
    let exchange = Exchange::default();

    // Publisher (3.1.1) leaves a retained value before anyone subscribes
    let mut publisher = accept(&exchange, 1, &connect_bytes(ProtocolVersion::V311, "pub", true));
    let mut retained = Publish::new("plant/boiler/temp", &b"71"[..], QoS::AtLeastOnce);
    retained.retain = true;
    retained.packet_id = Some(10);
    let reply = publisher
        .handle(&exchange, &client_bytes(ProtocolVersion::V311, &Packet::Publish(retained)))
        .unwrap();
    assert_eq!(&reply[..], &[0x40, 0x02, 0x00, 0x0A]);

    // Subscriber (5.0) allows two outbound topic aliases
    let mut props = Properties::new();
    props.set_topic_alias_maximum(2);
    let connect = Packet::Connect(Box::new(Connect {
        client_id: "sub".to_string(),
        properties: props,
        ..Connect::default()
    }));
    let mut subscriber = accept(&exchange, 2, &client_bytes(ProtocolVersion::V5, &connect));
    assert_eq!(subscriber.caps.server_topic_alias_maximum, 2);

    let subscribe = Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![
            SubscribeFilter::new("plant/+/temp", QoS::AtLeastOnce),
            SubscribeFilter::new("plant/#/bad", QoS::AtMostOnce),
        ],
        properties: Properties::default(),
    });
    let suback = subscriber
        .handle(&exchange, &client_bytes(ProtocolVersion::V5, &subscribe))
        .unwrap();
    let Packet::SubAck(ack) = client_decode(ProtocolVersion::V5, &suback) else {
        panic!("expected SUBACK");
    };
    assert_eq!(
        ack.reason_codes,
        vec![ReasonCode::GrantedQoS1, ReasonCode::TopicFilterInvalid]
    );

    let inflight = no_resend();

    // Retained replay: full topic, new alias, retain flag set
    let frames = subscriber.flush(&inflight);
    assert_eq!(frames.len(), 1);
    let Packet::Publish(replayed) = client_decode(ProtocolVersion::V5, &frames[0]) else {
        panic!("expected PUBLISH");
    };
    assert!(replayed.retain);
    assert_eq!(&*replayed.topic, "plant/boiler/temp");
    assert_eq!(replayed.properties.topic_alias(), Some(1));
    assert_eq!(replayed.packet_id, Some(1));

    // Live publish on the same topic reuses the alias and clears retain
    let mut live = Publish::new("plant/boiler/temp", &b"72"[..], QoS::ExactlyOnce);
    live.packet_id = Some(11);
    live.retain = true;
    let reply = publisher
        .handle(&exchange, &client_bytes(ProtocolVersion::V311, &Packet::Publish(live)))
        .unwrap();
    assert_eq!(&reply[..], &[0x50, 0x02, 0x00, 0x0B]);

    let frames = subscriber.flush(&inflight);
    let Packet::Publish(delivered) = client_decode(ProtocolVersion::V5, &frames[0]) else {
        panic!("expected PUBLISH");
    };
    assert!(!delivered.retain);
    assert_eq!(&*delivered.topic, "");
    assert_eq!(delivered.properties.topic_alias(), Some(1));
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    assert_eq!(&delivered.payload[..], b"72");

    // Client acknowledges both
    for id in [1u16, 2] {
        let puback = client_bytes(ProtocolVersion::V5, &Packet::PubAck(PubResponse::new(id)));
        let Packet::PubAck(ack) = client_decode(ProtocolVersion::V5, &puback) else {
            panic!("expected PUBACK");
        };
        assert!(inflight.acknowledge(ack.packet_id));
    }
    assert!(inflight.is_empty());
    inflight.stop();
}

#[tokio::test]
async fn inbound_topic_alias_round_trip() {
    let exchange = Exchange::default();
    let mut listener = accept(&exchange, 1, &connect_bytes(ProtocolVersion::V311, "l", true));
    exchange.subscribe(1, "alias/#", QoS::AtMostOnce).unwrap();

    let mut sender = accept(&exchange, 2, &connect_bytes(ProtocolVersion::V5, "s", true));

    let mut first = Publish::new("alias/topic", &b"1"[..], QoS::AtMostOnce);
    first.properties.set_topic_alias(4);
    sender.handle(&exchange, &client_bytes(ProtocolVersion::V5, &Packet::Publish(first)));

    let mut second = Publish::new("", &b"2"[..], QoS::AtMostOnce);
    second.properties.set_topic_alias(4);
    sender.handle(&exchange, &client_bytes(ProtocolVersion::V5, &Packet::Publish(second)));

    let frames = listener.flush(&no_resend());
    let topics: Vec<_> = frames
        .iter()
        .map(|f| match client_decode(ProtocolVersion::V311, f) {
            Packet::Publish(p) => p.topic.to_string(),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(topics, vec!["alias/topic", "alias/topic"]);

    // Unknown alias is a protocol error carrying the DISCONNECT reason
    let mut unknown = Publish::new("", &b"3"[..], QoS::AtMostOnce);
    unknown.properties.set_topic_alias(9);
    let (packet, _) = assert_ok!(sender
        .decoder
        .read(&client_bytes(ProtocolVersion::V5, &Packet::Publish(unknown))));
    let Packet::Publish(mut unknown) = packet else {
        panic!("expected PUBLISH");
    };
    let err = assert_err!(sender.caps.resolve_topic_alias(&mut unknown));
    assert_eq!(err.reason_code(), ReasonCode::TopicAliasInvalid);
}

#[test]
fn v311_suback_failure_code_on_the_wire() {
    let exchange = Exchange::default();
    let mut conn = accept(&exchange, 1, &connect_bytes(ProtocolVersion::V311, "c", true));

    let subscribe = Packet::Subscribe(Subscribe {
        packet_id: 7,
        filters: vec![
            SubscribeFilter::new("ok/+", QoS::ExactlyOnce),
            SubscribeFilter::new("bad+", QoS::AtMostOnce),
        ],
        properties: Properties::default(),
    });
    let reply = conn
        .handle(&exchange, &client_bytes(ProtocolVersion::V311, &subscribe))
        .unwrap();
    assert_eq!(&reply[..], &[0x90, 0x04, 0x00, 0x07, 0x02, 0x80]);
    assert_eq!(conn.client_id, "c");
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_delivery_is_resent_with_dup() {
    let exchange = Exchange::default();
    let mut conn = accept(&exchange, 1, &connect_bytes(ProtocolVersion::V5, "slow", true));
    exchange.subscribe(1, "jobs", QoS::AtLeastOnce).unwrap();

    let wire: Arc<Mutex<Vec<BytesMut>>> = Arc::default();
    let sink = wire.clone();
    let encoder = conn.encoder;
    let inflight = InflightManager::new(
        InflightConfig {
            retry_timeout: Duration::from_secs(2),
            max_retries: 1,
            poll_interval: Duration::from_millis(500),
        },
        move |m: &InflightMessage| -> Result<(), SendError> {
            sink.lock().push(encoder.to_bytes(&m.packet())?);
            Ok(())
        },
    );

    assert_ok!(exchange.publish(&Publish::new("jobs", &b"run"[..], QoS::AtLeastOnce)));
    let frames = conn.flush(&inflight);
    let first = client_decode(ProtocolVersion::V5, &frames[0]);
    assert!(matches!(first, Packet::Publish(ref p) if !p.dup));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let resent = wire.lock().clone();
    assert_eq!(resent.len(), 1);
    let Packet::Publish(dup) = client_decode(ProtocolVersion::V5, &resent[0]) else {
        panic!("expected PUBLISH");
    };
    assert!(dup.dup);
    assert_eq!(dup.packet_id, Some(1));

    // Past the retry ceiling the message is abandoned
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(inflight.is_empty());
    assert_eq!(wire.lock().len(), 1);
    assert!(!inflight.is_timer_running());
}

#[test]
fn persistent_session_survives_reconnect() {
    let exchange = Exchange::new(ExchangeConfig::default());

    let mut first = accept(&exchange, 1, &connect_bytes(ProtocolVersion::V311, "dev-7", false));
    let subscribe = Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![SubscribeFilter::new("cmd/dev-7", QoS::AtLeastOnce)],
        properties: Properties::default(),
    });
    first.handle(&exchange, &client_bytes(ProtocolVersion::V311, &subscribe));

    // Disconnect without clean session: keep subscriptions, drop the handle
    let subscriptions = exchange.subscriptions_of(first.id);
    exchange.save_persistent_session(&first.client_id, first.id, subscriptions);
    exchange.remove_session(first.id);
    drop(first);

    let command = Publish::new("cmd/dev-7", &b"reboot"[..], QoS::ExactlyOnce);
    let outcome = assert_ok!(exchange.publish(&command));
    assert_eq!(outcome.queued, 1);

    let mut second = accept(&exchange, 2, &connect_bytes(ProtocolVersion::V311, "dev-7", false));
    assert!(exchange.restore_persistent_session("dev-7", 2));
    for sub in exchange.persistent_subscriptions("dev-7") {
        exchange.subscribe(2, &sub.filter, sub.qos).unwrap();
    }
    let session = exchange.get_session(2).unwrap();
    for queued in exchange.take_offline_messages("dev-7") {
        assert!(session.deliver(queued));
    }

    let frames = second.flush(&no_resend());
    assert_eq!(frames.len(), 1);
    let Packet::Publish(p) = client_decode(ProtocolVersion::V311, &frames[0]) else {
        panic!("expected PUBLISH");
    };
    assert_eq!(&p.payload[..], b"reboot");
    assert_eq!(p.qos, QoS::AtLeastOnce);

    // A clean-session connect wipes the record
    assert!(exchange.clear_persistent_session("dev-7"));
    assert!(!exchange.restore_persistent_session("dev-7", 3));
}
