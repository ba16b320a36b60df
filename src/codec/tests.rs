//! Codec round-trip tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use super::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Packet, PubAck, Publish, QoS, SubAck, Subscribe, Subscription,
    Unsubscribe, UnsubAck,
};

fn round_trip(packet: Packet) -> Packet {
    let encoder = Encoder::new();
    let decoder = Decoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(&packet, &mut buf).expect("encode");
    let (decoded, consumed) = decoder.decode(&buf).expect("decode").expect("complete");
    assert_eq!(consumed, buf.len());
    decoded
}

#[test]
fn variable_int_round_trip() {
    for value in [0u32, 1, 127, 128, 16_383, 16_384, 2_097_151, 268_435_455] {
        let mut buf = BytesMut::new();
        write_variable_int(&mut buf, value).unwrap();
        let (decoded, consumed) = read_variable_int(&buf).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, buf.len());
    }
}

#[test]
fn variable_int_rejects_overlong() {
    let err = read_variable_int(&[0x80, 0x80, 0x80, 0x80, 0x01]).unwrap_err();
    assert_eq!(err, DecodeError::InvalidRemainingLength);
}

#[test]
fn connect_round_trip() {
    let packet = Packet::Connect(Connect {
        client_id: "robridge-1".to_string(),
        clean_session: true,
        keep_alive: 30,
        username: Some("bridge".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    });
    assert_eq!(round_trip(packet.clone()), packet);
}

#[test]
fn connect_without_credentials() {
    let packet = Packet::Connect(Connect {
        client_id: "robridge-2".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
    });
    assert_eq!(round_trip(packet.clone()), packet);
}

#[test]
fn connack_round_trip() {
    let packet = Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: 0,
    });
    assert_eq!(round_trip(packet.clone()), packet);

    let rejected = Packet::ConnAck(ConnAck {
        session_present: false,
        return_code: 5,
    });
    assert_eq!(round_trip(rejected.clone()), rejected);
}

#[test]
fn publish_qos0_round_trip() {
    let packet = Packet::Publish(Publish {
        topic: "ros2/gps/fix".to_string(),
        payload: Bytes::from_static(b"{\"value\":22.5}"),
        ..Default::default()
    });
    assert_eq!(round_trip(packet.clone()), packet);
}

#[test]
fn publish_qos1_carries_packet_id() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "ros2/camera/image".to_string(),
        packet_id: Some(42),
        payload: Bytes::from_static(&[0, 1, 2, 3, 255]),
        ..Default::default()
    });
    assert_eq!(round_trip(packet.clone()), packet);
}

#[test]
fn publish_rejects_wildcard_topic() {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    let packet = Packet::Publish(Publish {
        topic: "ros2/#".to_string(),
        ..Default::default()
    });
    assert!(encoder.encode(&packet, &mut buf).is_err());
}

#[test]
fn subscribe_round_trip() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 7,
        subscriptions: vec![
            Subscription {
                filter: "ros2/cmd_vel/data".to_string(),
                qos: QoS::AtLeastOnce,
            },
            Subscription {
                filter: "ros2/transfer/+/meta".to_string(),
                qos: QoS::AtMostOnce,
            },
        ],
    });
    assert_eq!(round_trip(packet.clone()), packet);
}

#[test]
fn suback_round_trip() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 7,
        return_codes: vec![1, 0x80],
    });
    assert_eq!(round_trip(packet.clone()), packet);
}

#[test]
fn unsubscribe_round_trip() {
    let packet = Packet::Unsubscribe(Unsubscribe {
        packet_id: 9,
        filters: vec!["ros2/cmd_vel/data".to_string()],
    });
    assert_eq!(round_trip(packet.clone()), packet);
    assert_eq!(
        round_trip(Packet::UnsubAck(UnsubAck { packet_id: 9 })),
        Packet::UnsubAck(UnsubAck { packet_id: 9 })
    );
}

#[test]
fn puback_and_flag_only_packets() {
    assert_eq!(
        round_trip(Packet::PubAck(PubAck { packet_id: 3 })),
        Packet::PubAck(PubAck { packet_id: 3 })
    );
    assert_eq!(round_trip(Packet::PingReq), Packet::PingReq);
    assert_eq!(round_trip(Packet::PingResp), Packet::PingResp);
    assert_eq!(round_trip(Packet::Disconnect), Packet::Disconnect);
}

#[test]
fn partial_packet_returns_none() {
    let encoder = Encoder::new();
    let decoder = Decoder::new();
    let mut buf = BytesMut::new();
    let packet = Packet::Publish(Publish {
        topic: "ros2/odom/pose".to_string(),
        payload: Bytes::from(vec![0u8; 300]),
        ..Default::default()
    });
    encoder.encode(&packet, &mut buf).unwrap();

    for cut in [1, 2, 5, buf.len() - 1] {
        assert!(decoder.decode(&buf[..cut]).unwrap().is_none());
    }
    assert!(decoder.decode(&buf).unwrap().is_some());
}

#[test]
fn two_packets_in_one_buffer() {
    let encoder = Encoder::new();
    let decoder = Decoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(&Packet::PingReq, &mut buf).unwrap();
    let publish = Packet::Publish(Publish {
        topic: "a/b/c".to_string(),
        payload: Bytes::from_static(b"x"),
        ..Default::default()
    });
    encoder.encode(&publish, &mut buf).unwrap();

    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingReq);
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, publish);
}

#[test]
fn subscribe_with_wrong_flags_rejected() {
    let encoder = Encoder::new();
    let decoder = Decoder::new();
    let mut buf = BytesMut::new();
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "t".to_string(),
            qos: QoS::AtMostOnce,
        }],
    });
    encoder.encode(&packet, &mut buf).unwrap();
    // Clear the required 0b0010 flag bits
    buf[0] &= 0xF0;
    assert_eq!(decoder.decode(&buf).unwrap_err(), DecodeError::InvalidFlags);
}
