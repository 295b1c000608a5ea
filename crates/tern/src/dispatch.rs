//! # Dispatcher
//!
//! Turns an inbound `call` into an invocation and its outcome into a reply.
//!
//! Dispatch is split in two. `prepare` runs inside the session's receive loop:
//! it resolves the target, decodes the arguments and pins every local object
//! the call names, all before the next frame is read. `invoke` runs on its own
//! task and is the only part that awaits application code.
//!
//! Every target answers three built-in methods unless it defines its own:
//! `_dir` (method names), `_type` (type name) and `_help` (description, or the
//! doc of the method named by the first argument).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use ternwire::CallFrame;
use ternwire::ErrorEncoder;
use ternwire::ResultEncoder;

use crate::codec::Codec;
use crate::error::Error;
use crate::error::RemoteError;
use crate::error::Result;
use crate::exports::Exported;
use crate::exports::PinGuard;
use crate::handles::ObjectId;
use crate::object::Object;
use crate::session::SessionShared;
use crate::value::Value;

/// A call whose target and arguments are resolved and pinned.
pub(crate) struct Prepared {
    pub(crate) correlation: u64,
    pub(crate) id: ObjectId,
    target: Exported,
    method: String,
    args: Vec<Value>,
    _pins: Vec<PinGuard>,
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Prepared(#{} {}.{})", self.correlation, self.id, self.method)
    }
}

/// Resolves, decodes and pins. Runs synchronously in the receive loop.
///
/// A session-fatal error (malformed arguments) aborts the session; any other
/// error is answered with an `error` envelope.
pub(crate) fn prepare(session: &Arc<SessionShared>, call: CallFrame<'_>) -> Result<Prepared> {
    let id = ObjectId(call.target);
    let exports = session.refs.exports();

    let (target, target_pin) = exports
        .acquire(session.peer, id)
        .ok_or(Error::UnknownReference(id))?;

    let (args, folded) = Codec::new(session).decode_args(call.args)?;

    let mut pins = Vec::with_capacity(folded.len() + 1);
    pins.push(target_pin);
    pins.extend(folded.into_iter().filter_map(|folded_id| exports.pin(folded_id)));

    Ok(Prepared {
        correlation: call.correlation,
        id,
        target,
        method: call.method.to_string(),
        args,
        _pins: pins,
    })
}

/// Runs the prepared call to completion. Pins are held until the result is dropped
/// by the caller, which keeps them across reply encoding.
pub(crate) async fn invoke(prepared: &mut Prepared) -> Result<Value> {
    let args = std::mem::take(&mut prepared.args);
    match &prepared.target {
        Exported::Object(object) => invoke_local(object, prepared.id, &prepared.method, args).await,
        Exported::Proxy(proxy) => match proxy.call(&prepared.method, args).await {
            Err(Error::Remote(e)) => Err(Error::Invocation(e)),
            other => other,
        },
    }
}

async fn invoke_local(object: &Object, id: ObjectId, method: &str, args: Vec<Value>) -> Result<Value> {
    if let Some(func) = object.method(method) {
        let call = async move { func(args).await };
        return match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::Invocation(e)),
            Err(panic) => Err(Error::Invocation(RemoteError::invocation(format!(
                "method '{}' panicked: {}", method, panic_message(&*panic)
            )))),
        };
    }
    match method {
        "_dir" => Ok(Value::List(
            object.method_names().into_iter().map(Value::from).collect(),
        )),
        "_type" => Ok(Value::from(object.type_name())),
        "_help" => Ok(Value::from(help(object, args.first().and_then(Value::as_str)))),
        _ => Err(Error::NoSuchMethod { target: id, method: method.to_string() }),
    }
}

/// An encoded reply envelope and the exports its value took.
///
/// If the envelope is never sent, the exports must be given back with
/// [`rollback`](crate::codec::rollback).
pub(crate) struct Outgoing {
    pub(crate) bytes: Vec<u8>,
    pub(crate) exported: Vec<ObjectId>,
}

/// Encodes the reply envelope for a finished call.
///
/// A result that cannot be encoded, or that would exceed the frame limit, is
/// answered with an error envelope instead and its exports are given back.
pub(crate) fn reply(session: &Arc<SessionShared>, correlation: u64, outcome: Result<Value>) -> Option<Outgoing> {
    let codec = Codec::new(session);
    let failure = match outcome {
        Ok(value) => match codec.encode(&value) {
            Ok(encoded) => {
                let framed = ResultEncoder::new(correlation, &encoded.bytes).into_bytes();
                match framed {
                    Ok(bytes) if bytes.len() <= session.config.max_frame_size => {
                        return Some(Outgoing { bytes, exported: encoded.exported });
                    }
                    Ok(bytes) => {
                        encoded.rollback(session);
                        Error::Encode(format!("result of {} bytes exceeds frame limit", bytes.len()))
                    }
                    Err(e) => {
                        encoded.rollback(session);
                        Error::Encode(e.to_string())
                    }
                }
            }
            Err(e) => e,
        },
        Err(e) => e,
    };
    error_reply(session, correlation, failure)
}

/// Encodes an `error` envelope. Structured data that cannot be encoded is dropped.
pub(crate) fn error_reply(session: &Arc<SessionShared>, correlation: u64, error: Error) -> Option<Outgoing> {
    let remote = error.into_remote();
    let data = remote.data.as_deref().and_then(|data| Codec::new(session).encode(data).ok());

    let mut frame = ErrorEncoder::new(correlation, &remote.kind, &remote.message);
    if let Some(data) = &data {
        frame = frame.with_data(&data.bytes);
    }
    match frame.into_bytes() {
        Ok(bytes) if bytes.len() <= session.config.max_frame_size => Some(Outgoing {
            bytes,
            exported: data.map(|data| data.exported).unwrap_or_default(),
        }),
        _ => {
            if let Some(data) = data {
                data.rollback(session);
            }
            tracing::warn!(cid = correlation, kind = %remote.kind, "error reply too large, sending it bare");
            ErrorEncoder::new(correlation, &remote.kind, "error reply exceeds frame limit")
                .into_bytes()
                .ok()
                .map(|bytes| Outgoing { bytes, exported: Vec::new() })
        }
    }
}

fn help(object: &Object, method: Option<&str>) -> String {
    match method {
        Some(name) if object.has_method(name) => object
            .method_doc(name)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.{}", object.type_name(), name)),
        Some(name) => format!("{} has no method '{}'", object.type_name(), name),
        None => match object.doc() {
            Some(doc) => doc.to_string(),
            None => format!("{}: {}", object.type_name(), object.method_names().join(", ")),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
