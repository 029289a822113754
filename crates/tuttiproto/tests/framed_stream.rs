//! Tests for FrameCodec over a real async byte stream
//!
//! These exercise the codec the way connections use it: through
//! `tokio_util::codec::Framed`, with frames arriving in arbitrary chunks.

use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Framed, FramedRead};
use tuttiproto::{
    encode, AckPayload, Body, Capability, CommandPayload, DeviceId, FrameCodec, HelloPayload,
    Message, ProtocolError, SyncReplyPayload, PROTOCOL_VERSION,
};

fn hello() -> Message {
    Message::hello(HelloPayload {
        device_id: DeviceId::from("thermal-1"),
        capabilities: vec![Capability::Thermal, Capability::from("radiometric")],
        protocol_version: PROTOCOL_VERSION,
        device_name: Some("bench rig".into()),
    })
    .with_timestamp(1)
}

fn from_device(seq: u64, body: Body) -> Message {
    Message::new(Some(DeviceId::from("thermal-1")), seq, body).with_timestamp(seq as i64 * 10)
}

/// Frames written one byte at a time still decode in order
#[tokio::test]
async fn test_byte_at_a_time_delivery() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let mut frames = FramedRead::new(reader, FrameCodec::default());

    let sent = vec![
        hello(),
        from_device(1, Body::Ack(AckPayload::ok(1))),
        from_device(
            2,
            Body::SyncReply(SyncReplyPayload {
                exchange_id: 7,
                t0: 100,
                t1: 150,
                t2: 160,
            }),
        ),
        from_device(3, Body::Heartbeat),
    ];

    let mut bytes = Vec::new();
    for msg in &sent {
        bytes.extend(encode(msg).unwrap());
    }

    let writer_task = tokio::spawn(async move {
        for b in bytes {
            writer.write_all(&[b]).await.unwrap();
        }
        writer.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    while let Some(frame) = frames.next().await {
        received.push(frame.unwrap());
    }
    writer_task.await.unwrap();

    assert_eq!(received, sent);
}

/// Two frames arriving in one read are both delivered
#[tokio::test]
async fn test_coalesced_frames() {
    let (mut writer, reader) = tokio::io::duplex(4096);
    let mut frames = FramedRead::new(reader, FrameCodec::default());

    let a = from_device(1, Body::Ack(AckPayload::ok(4)));
    let b = from_device(2, Body::Ack(AckPayload::failed(5, "storage full")));
    let mut bytes = encode(&a).unwrap();
    bytes.extend(encode(&b).unwrap());
    writer.write_all(&bytes).await.unwrap();

    assert_eq!(frames.next().await.unwrap().unwrap(), a);
    assert_eq!(frames.next().await.unwrap().unwrap(), b);
}

/// An oversized length prefix is rejected on the header alone
#[tokio::test]
async fn test_oversized_frame_rejected_from_header() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let mut frames = FramedRead::new(reader, FrameCodec::new(1024));

    // Only the header is ever written; the stream stays open.
    writer.write_all(&4096u32.to_be_bytes()).await.unwrap();

    let result = frames.next().await.unwrap();
    assert!(matches!(
        result,
        Err(ProtocolError::FrameTooLarge { declared: 4096, max: 1024 })
    ));
}

/// Both ends of a duplex can exchange commands and acks through Framed
#[tokio::test]
async fn test_bidirectional_exchange() {
    let (controller_io, device_io) = tokio::io::duplex(4096);
    let mut controller = Framed::new(controller_io, FrameCodec::default());
    let mut device = Framed::new(device_io, FrameCodec::default());

    let cmd = CommandPayload::new(1, "start")
        .with_session("session-1")
        .with_param("startAtDevice", 123_456_789i64);
    controller
        .send(Message::new(Some(DeviceId::from("thermal-1")), 1, Body::Command(cmd.clone())))
        .await
        .unwrap();

    let received = device.next().await.unwrap().unwrap();
    match received.body {
        Body::Command(got) => assert_eq!(got, cmd),
        other => panic!("expected command, got {:?}", other),
    }

    let mut ack = AckPayload::ok(1);
    ack.session_id = Some("session-1".into());
    device.send(from_device(1, Body::Ack(ack.clone()))).await.unwrap();

    let received = controller.next().await.unwrap().unwrap();
    assert_eq!(received.body, Body::Ack(ack));
}
