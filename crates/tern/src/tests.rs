//! Protocol-level tests: a session on one end of a memory channel, raw frames on the other.

use std::sync::Arc;
use std::time::Duration;

use ternpack::Decoder;
use ternpack::Encoder;
use ternwire::CallEncoder;
use ternwire::Delta;
use ternwire::ErrorKind;
use ternwire::Frame;
use ternwire::RefDeltaEncoder;
use ternwire::ResultEncoder;

use crate::channel::Channel;
use crate::channel::MemoryChannel;
use crate::codec::Codec;
use crate::config::SessionConfig;
use crate::error::Error;
use crate::exports::ExportTable;
use crate::exports::Exported;
use crate::handles::ObjectId;
use crate::handles::PeerId;
use crate::object::Object;
use crate::session::Session;
use crate::session::SessionState;
use crate::value::Value;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    session: Session,
    raw: MemoryChannel,
    exports: Arc<ExportTable>,
    peer: PeerId,
}

fn harness(config: SessionConfig, roots: Vec<Object>) -> Harness {
    let exports = Arc::new(ExportTable::new());
    for root in &roots {
        exports.add_root(root.clone());
    }
    let peer = exports.next_peer();
    for root in roots {
        exports.export(peer, Exported::Object(root)).unwrap();
    }
    let (local, raw) = MemoryChannel::pair();
    let session = Session::open(Arc::new(local), Arc::clone(&exports), peer, config);
    Harness { session, raw, exports, peer }
}

fn toolbox() -> Object {
    Object::builder("Toolbox")
        .sync_method("echo", |args| Ok(args.into_iter().next().unwrap_or_default()))
        .sync_method("make", |_| {
            let made = Object::builder("Made")
                .sync_method("ping", |_| Ok(Value::from("pong")))
                .build();
            Ok(Value::Object(made))
        })
        .method("stall", |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        })
        .build()
}

fn args(write: impl FnOnce(&mut Encoder)) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.list_begin().unwrap();
    write(&mut enc);
    enc.list_end().unwrap();
    enc.into_bytes().unwrap()
}

fn write_ref(enc: &mut Encoder, oid: u64, origin: &str) {
    enc.variant_begin("ref").unwrap();
    enc.map_begin().unwrap();
    enc.variant_begin("oid").unwrap();
    enc.u64(oid).unwrap();
    enc.variant_end().unwrap();
    enc.variant_begin("origin").unwrap();
    enc.str(origin).unwrap();
    enc.variant_end().unwrap();
    enc.map_end().unwrap();
    enc.variant_end().unwrap();
}

/// Appends `extra` inside the container `item` starts with, fixing up its length.
fn pad(item: &mut Vec<u8>, extra: &[u8]) {
    let len = u32::from_le_bytes([item[1], item[2], item[3], item[4]]) as usize + extra.len();
    item.extend_from_slice(extra);
    item[1..5].copy_from_slice(&(len as u32).to_le_bytes());
}

fn read_ref(dec: &mut Decoder<'_>) -> (u64, String) {
    let (name, mut body) = dec.variant().unwrap();
    assert_eq!(name, "ref");
    let mut map = body.map().unwrap();
    let mut oid = None;
    let mut origin = None;
    while let Some((key, mut val)) = map.next().unwrap() {
        match key {
            "oid" => oid = Some(val.u64().unwrap()),
            "origin" => origin = Some(val.str().unwrap().to_string()),
            _ => val.skip().unwrap(),
        }
    }
    (oid.unwrap(), origin.unwrap())
}

async fn send_call(raw: &MemoryChannel, cid: u64, target: u64, method: &str, args: &[u8]) {
    let frame = CallEncoder::new(cid, target, method, args).into_bytes().unwrap();
    raw.send(&frame).await.unwrap();
}

async fn send_result(raw: &MemoryChannel, cid: u64, write: impl FnOnce(&mut Encoder)) {
    let mut enc = Encoder::new();
    write(&mut enc);
    let value = enc.into_bytes().unwrap();
    let frame = ResultEncoder::new(cid, &value).into_bytes().unwrap();
    raw.send(&frame).await.unwrap();
}

async fn recv(raw: &MemoryChannel) -> Vec<u8> {
    tokio::time::timeout(WAIT, raw.recv())
        .await
        .expect("frame within deadline")
        .unwrap()
        .expect("channel open")
}

async fn closed(session: &Session) {
    tokio::time::timeout(WAIT, session.closed())
        .await
        .expect("session closes");
    assert_eq!(session.state(), SessionState::Closed);
}

// ============================================================================
//  SERVING CALLS
// ============================================================================

#[tokio::test]
async fn test_raw_echo() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);
    send_call(&h.raw, 1, 0, "echo", &args(|e| e.i64(42).unwrap())).await;

    let bytes = recv(&h.raw).await;
    let Frame::Result(mut reply) = Frame::decode(&bytes).unwrap() else {
        panic!("expected result");
    };
    assert_eq!(reply.correlation, 1);
    assert_eq!(reply.value.i64().unwrap(), 42);
    assert_eq!(h.session.stats().calls_served, 1);
}

#[tokio::test]
async fn test_unknown_target_and_method_are_answered() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);

    send_call(&h.raw, 1, 99, "echo", &args(|_| {})).await;
    let bytes = recv(&h.raw).await;
    let Frame::Error(err) = Frame::decode(&bytes).unwrap() else {
        panic!("expected error");
    };
    assert_eq!(err.kind, ErrorKind::UnknownReference);

    send_call(&h.raw, 2, 0, "quack", &args(|_| {})).await;
    let bytes = recv(&h.raw).await;
    let Frame::Error(err) = Frame::decode(&bytes).unwrap() else {
        panic!("expected error");
    };
    assert_eq!(err.correlation, 2);
    assert_eq!(err.kind, ErrorKind::NoSuchMethod);
    assert_eq!(h.session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_forged_reference_is_rejected() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);

    send_call(&h.raw, 1, 0, "echo", &args(|e| write_ref(e, 77, "receiver"))).await;
    let bytes = recv(&h.raw).await;
    let Frame::Error(err) = Frame::decode(&bytes).unwrap() else {
        panic!("expected error");
    };
    assert_eq!(err.kind, ErrorKind::UnknownReference);

    send_call(&h.raw, 2, 0, "echo", &args(|e| e.i64(5).unwrap())).await;
    let bytes = recv(&h.raw).await;
    assert!(matches!(Frame::decode(&bytes).unwrap(), Frame::Result(_)));
}

#[tokio::test]
async fn test_returned_object_is_exported_then_released() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);

    send_call(&h.raw, 1, 0, "make", &args(|_| {})).await;
    let bytes = recv(&h.raw).await;
    let Frame::Result(mut reply) = Frame::decode(&bytes).unwrap() else {
        panic!("expected result");
    };
    let (oid, origin) = read_ref(&mut reply.value);
    assert_eq!(origin, "sender");
    let id = ObjectId(oid);
    assert_eq!(h.exports.count(h.peer, id), 1);

    // The exported object answers calls, then goes away once released.
    send_call(&h.raw, 2, oid, "ping", &args(|_| {})).await;
    let bytes = recv(&h.raw).await;
    let Frame::Result(mut reply) = Frame::decode(&bytes).unwrap() else {
        panic!("expected result");
    };
    assert_eq!(reply.value.str().unwrap(), "pong");

    let mut reclaimed = h.exports.collector().subscribe();
    let release = RefDeltaEncoder::new(&[Delta { object: oid, delta: -1 }]).into_bytes().unwrap();
    h.raw.send(&release).await.unwrap();
    let gone = tokio::time::timeout(WAIT, reclaimed.recv()).await.unwrap().unwrap();
    assert_eq!(gone, id);
    assert!(!h.exports.contains(id));
    assert_eq!(h.session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_release_during_call_waits_for_reply() {
    let gate = Arc::new(tokio::sync::Notify::new());
    let opener = Arc::clone(&gate);
    let maker = Object::builder("Maker")
        .sync_method("make", move |_| {
            let gate = Arc::clone(&opener);
            let held = Object::builder("Held")
                .method("wait", move |_| {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        Ok(Value::from("done"))
                    }
                })
                .build();
            Ok(Value::Object(held))
        })
        .build();
    let h = harness(SessionConfig::default(), vec![maker]);

    send_call(&h.raw, 1, 0, "make", &args(|_| {})).await;
    let bytes = recv(&h.raw).await;
    let Frame::Result(mut reply) = Frame::decode(&bytes).unwrap() else {
        panic!("expected result");
    };
    let (oid, _) = read_ref(&mut reply.value);
    let id = ObjectId(oid);

    // The call is read before the release, so it already holds a pin.
    send_call(&h.raw, 2, oid, "wait", &args(|_| {})).await;
    let release = RefDeltaEncoder::new(&[Delta { object: oid, delta: -1 }]).into_bytes().unwrap();
    h.raw.send(&release).await.unwrap();

    tokio::time::timeout(WAIT, async {
        while h.exports.count(h.peer, id) != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("release applied");
    assert!(h.exports.contains(id));
    assert_eq!(h.exports.pins(id), 1);

    let mut reclaimed = h.exports.collector().subscribe();
    gate.notify_one();
    let bytes = recv(&h.raw).await;
    let Frame::Result(mut reply) = Frame::decode(&bytes).unwrap() else {
        panic!("expected result");
    };
    assert_eq!(reply.correlation, 2);
    assert_eq!(reply.value.str().unwrap(), "done");

    let gone = tokio::time::timeout(WAIT, reclaimed.recv()).await.unwrap().unwrap();
    assert_eq!(gone, id);
    assert!(!h.exports.contains(id));
    assert_eq!(h.session.state(), SessionState::Open);
}

// ============================================================================
//  PROTOCOL VIOLATIONS
// ============================================================================

#[tokio::test]
async fn test_negative_release_fails_session() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);

    send_call(&h.raw, 1, 0, "make", &args(|_| {})).await;
    let bytes = recv(&h.raw).await;
    let Frame::Result(mut reply) = Frame::decode(&bytes).unwrap() else {
        panic!("expected result");
    };
    let (oid, _) = read_ref(&mut reply.value);

    let release = RefDeltaEncoder::new(&[Delta { object: oid, delta: -2 }]).into_bytes().unwrap();
    h.raw.send(&release).await.unwrap();

    closed(&h.session).await;
    assert!(!h.exports.contains(ObjectId(oid)));
    assert!(h.exports.contains(ObjectId(0)));
}

#[tokio::test]
async fn test_positive_delta_fails_session() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);
    let grant = RefDeltaEncoder::new(&[Delta { object: 0, delta: 1 }]).into_bytes().unwrap();
    h.raw.send(&grant).await.unwrap();
    closed(&h.session).await;
}

#[tokio::test]
async fn test_reused_correlation_id_fails_session() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);
    send_call(&h.raw, 7, 0, "stall", &args(|_| {})).await;
    send_call(&h.raw, 7, 0, "stall", &args(|_| {})).await;
    closed(&h.session).await;
}

#[tokio::test]
async fn test_unsolicited_result_fails_session() {
    let h = harness(SessionConfig::default(), vec![]);
    send_result(&h.raw, 99, |e| e.null().unwrap()).await;
    closed(&h.session).await;
}

#[tokio::test]
async fn test_garbage_frame_fails_session() {
    let h = harness(SessionConfig::default(), vec![]);
    h.raw.send(&[0xff, 0x00, 0x13]).await.unwrap();
    closed(&h.session).await;
    assert_eq!(h.raw.recv().await.unwrap(), None);
}

// ============================================================================
//  ISSUING CALLS
// ============================================================================

#[tokio::test]
async fn test_late_reply_after_timeout_is_dropped() {
    let config = SessionConfig::default().with_call_timeout(Some(Duration::from_millis(50)));
    let h = harness(config, vec![]);

    let err = h.session.call(ObjectId(0), "slow", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(h.session.stats().pending, 0);

    let bytes = recv(&h.raw).await;
    let Frame::Call(call) = Frame::decode(&bytes).unwrap() else {
        panic!("expected call");
    };
    let late_cid = call.correlation;
    send_result(&h.raw, late_cid, |e| e.str("late").unwrap()).await;

    let session = h.session.clone();
    let next = tokio::spawn(async move { session.call(ObjectId(0), "fast", vec![]).await });
    let bytes = recv(&h.raw).await;
    let Frame::Call(call) = Frame::decode(&bytes).unwrap() else {
        panic!("expected call");
    };
    assert_ne!(call.correlation, late_cid);
    send_result(&h.raw, call.correlation, |e| e.i64(7).unwrap()).await;

    assert_eq!(next.await.unwrap().unwrap(), Value::Int(7));
    assert_eq!(h.session.state(), SessionState::Open);
}

#[tokio::test]
async fn test_close_fails_pending_calls() {
    let h = harness(SessionConfig::default().with_call_timeout(None), vec![]);

    let session = h.session.clone();
    let pending = tokio::spawn(async move { session.call(ObjectId(0), "never", vec![]).await });
    let _ = recv(&h.raw).await;

    h.session.close().await;
    assert!(matches!(pending.await.unwrap(), Err(Error::SessionClosed)));
    assert!(matches!(
        h.session.call(ObjectId(0), "after", vec![]).await,
        Err(Error::SessionClosed)
    ));
}

#[tokio::test]
async fn test_releases_are_batched() {
    let h = harness(SessionConfig::default(), vec![]);

    let session = h.session.clone();
    let call = tokio::spawn(async move { session.call(ObjectId(0), "pair", vec![]).await });
    let bytes = recv(&h.raw).await;
    let Frame::Call(req) = Frame::decode(&bytes).unwrap() else {
        panic!("expected call");
    };
    send_result(&h.raw, req.correlation, |e| {
        e.list_begin().unwrap();
        write_ref(e, 10, "sender");
        write_ref(e, 11, "sender");
        e.list_end().unwrap();
    })
    .await;

    let value = call.await.unwrap().unwrap();
    let proxies = value.as_list().unwrap();
    assert_eq!(proxies[0].as_proxy().unwrap().id(), ObjectId(10));
    assert_eq!(proxies[1].as_proxy().unwrap().id(), ObjectId(11));
    assert_eq!(h.session.stats().imports, 2);
    drop(value);

    let bytes = recv(&h.raw).await;
    let Frame::RefDelta(frame) = Frame::decode(&bytes).unwrap() else {
        panic!("expected refDelta");
    };
    assert_eq!(frame.deltas, vec![
        Delta { object: 10, delta: -1 },
        Delta { object: 11, delta: -1 },
    ]);
    assert_eq!(h.session.stats().imports, 0);
}

#[tokio::test]
async fn test_release_covers_every_receipt() {
    let h = harness(SessionConfig::default(), vec![]);
    let mut held = Vec::new();

    for _ in 0..2 {
        let session = h.session.clone();
        let call = tokio::spawn(async move { session.call(ObjectId(0), "get", vec![]).await });
        let bytes = recv(&h.raw).await;
        let Frame::Call(req) = Frame::decode(&bytes).unwrap() else {
            panic!("expected call");
        };
        send_result(&h.raw, req.correlation, |e| write_ref(e, 4, "sender")).await;
        held.push(call.await.unwrap().unwrap());
    }

    let first = held[0].as_proxy().unwrap();
    let second = held[1].as_proxy().unwrap();
    assert!(crate::proxy::Proxy::ptr_eq(first, second));
    assert_eq!(first.received(), 2);
    drop(held);

    let bytes = recv(&h.raw).await;
    let Frame::RefDelta(frame) = Frame::decode(&bytes).unwrap() else {
        panic!("expected refDelta");
    };
    assert_eq!(frame.deltas, vec![Delta { object: 4, delta: -2 }]);
}

#[tokio::test]
async fn test_too_deep_reply_fails_call_and_session() {
    let h = harness(SessionConfig::default().with_max_depth(4), vec![]);

    let session = h.session.clone();
    let call = tokio::spawn(async move { session.call(ObjectId(0), "deep", vec![]).await });
    let bytes = recv(&h.raw).await;
    let Frame::Call(req) = Frame::decode(&bytes).unwrap() else {
        panic!("expected call");
    };
    send_result(&h.raw, req.correlation, |e| {
        for _ in 0..8 {
            e.list_begin().unwrap();
        }
        for _ in 0..8 {
            e.list_end().unwrap();
        }
    })
    .await;

    assert!(matches!(call.await.unwrap(), Err(Error::Decode(_))));
    closed(&h.session).await;
}

// ============================================================================
//  CODEC
// ============================================================================

#[tokio::test]
async fn test_failed_encode_rolls_back_exports() {
    let h = harness(SessionConfig::default().with_max_depth(4), vec![]);
    let leaf = Object::builder("Leaf").build();

    let mut deep = Value::Null;
    for _ in 0..10 {
        deep = Value::List(vec![deep]);
    }
    let value = Value::List(vec![Value::Object(leaf.clone()), deep]);

    let codec = Codec::new(h.session.shared());
    assert!(matches!(codec.encode(&value), Err(Error::Encode(_))));
    assert!(h.exports.id_of(&leaf).is_none());

    let shallow = Value::map([("leaf", Value::Object(leaf.clone()))]);
    assert!(codec.encode(&shallow).is_ok());
    let id = h.exports.id_of(&leaf).expect("exported");
    assert_eq!(h.exports.count(h.peer, id), 1);
}

#[tokio::test]
async fn test_folded_reference_keeps_counts() {
    let h = harness(SessionConfig::default(), vec![]);
    let thing = Object::builder("Thing").build();
    let codec = Codec::new(h.session.shared());

    let sent = codec.encode(&Value::Object(thing.clone())).ok().expect("encodes");
    let id = h.exports.id_of(&thing).expect("exported");
    let mut dec = Decoder::new(&sent.bytes);
    let (_, origin) = read_ref(&mut dec);
    assert_eq!(origin, "sender");

    let mut enc = Encoder::new();
    write_ref(&mut enc, id.0, "receiver");
    let back = enc.into_bytes().unwrap();
    let value = codec.decode(Decoder::new(&back)).ok().expect("decodes");

    assert!(Object::ptr_eq(value.as_object().unwrap(), &thing));
    assert_eq!(h.exports.count(h.peer, id), 1);
}

#[tokio::test]
async fn test_error_values_cross_as_data() {
    let h = harness(SessionConfig::default(), vec![]);
    let codec = Codec::new(h.session.shared());

    let err = crate::error::RemoteError::custom("ValueError", "bad input").with_data(Value::Int(3));
    let encoded = codec.encode(&Value::Error(err.clone())).ok().expect("encodes");
    let decoded = codec.decode(Decoder::new(&encoded.bytes)).ok().expect("decodes");
    assert_eq!(decoded, Value::Error(err));
}

#[tokio::test]
async fn test_trailing_items_are_rejected() {
    let h = harness(SessionConfig::default(), vec![]);
    let codec = Codec::new(h.session.shared());
    let null = [ternpack::Tag::Null as u8];

    // After a reference marker's map.
    let mut enc = Encoder::new();
    write_ref(&mut enc, 5, "sender");
    let mut marker = enc.into_bytes().unwrap();
    pad(&mut marker, &null);
    assert!(matches!(codec.decode(Decoder::new(&marker)), Err(Error::Decode(_))));
    assert_eq!(h.session.stats().imports, 0);

    // After a map entry's payload.
    let mut enc = Encoder::new();
    enc.variant_begin("k").unwrap();
    enc.i64(1).unwrap();
    enc.variant_end().unwrap();
    let mut entry = enc.into_bytes().unwrap();
    pad(&mut entry, &null);
    let mut enc = Encoder::new();
    enc.map_begin().unwrap();
    enc.raw(&entry).unwrap();
    enc.map_end().unwrap();
    let map = enc.into_bytes().unwrap();
    assert!(matches!(codec.decode(Decoder::new(&map)), Err(Error::Decode(_))));

    // After the value itself.
    let mut enc = Encoder::new();
    enc.i64(1).unwrap();
    let mut two = enc.into_bytes().unwrap();
    two.extend_from_slice(&null);
    assert!(matches!(codec.decode(Decoder::new(&two)), Err(Error::Decode(_))));
}

#[tokio::test]
async fn test_trailing_item_in_call_fails_session() {
    let h = harness(SessionConfig::default(), vec![toolbox()]);
    let mut enc = Encoder::new();
    enc.variant_begin("error").unwrap();
    enc.map_begin().unwrap();
    enc.variant_begin("kind").unwrap();
    enc.str("ValueError").unwrap();
    enc.variant_end().unwrap();
    enc.map_end().unwrap();
    enc.variant_end().unwrap();
    let mut marker = enc.into_bytes().unwrap();
    pad(&mut marker, &[ternpack::Tag::True as u8]);

    send_call(&h.raw, 1, 0, "echo", &args(|e| e.raw(&marker).unwrap())).await;
    closed(&h.session).await;
}
