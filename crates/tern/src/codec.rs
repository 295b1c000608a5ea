//! # Value Codec
//!
//! Turns value graphs into `ternpack` items and back, for one session.
//!
//! Plain data maps one-to-one onto ternpack tags; mappings become a `Map` of
//! variants keyed by the entry name. Anything that is not plain data travels as
//! a top-level variant marker:
//!
//! - `ref { oid, origin }` for objects and proxies,
//! - `error { kind, message, data? }` for error values.
//!
//! ## Invariants
//!
//! - **Transactional export**: an encode that fails part-way releases every
//!   count it took before returning the error.
//! - **Folding**: a proxy going back to the session it came from is sent as
//!   `origin: receiver` and decodes to the original target with counts unchanged.
//! - **Bounded**: nesting deeper than `max_depth` fails in both directions.
//! - **Exact**: a variant or map entry holds one payload and nothing after it;
//!   trailing bytes are a decode error, as they are for whole frames.

use std::collections::BTreeMap;
use std::sync::Arc;

use ternpack::Decoder;
use ternpack::Encoder;
use ternpack::Tag;
use ternwire::ErrorKind;
use ternwire::Origin;
use ternwire::marker;

use crate::error::Error;
use crate::error::RemoteError;
use crate::error::Result;
use crate::exports::Exported;
use crate::handles::ObjectId;
use crate::session::SessionShared;
use crate::value::Value;

/// An encoded value together with the exports it took.
pub(crate) struct Encoded {
    pub(crate) bytes: Vec<u8>,
    pub(crate) exported: Vec<ObjectId>,
}

impl Encoded {
    /// Gives back the counts taken while encoding, for a value that will never be sent.
    pub(crate) fn rollback(self, session: &SessionShared) {
        rollback(session, &self.exported);
    }
}

pub(crate) struct Codec<'s> {
    session: &'s Arc<SessionShared>,
    max_depth: usize,
}

impl<'s> Codec<'s> {
    pub(crate) fn new(session: &'s Arc<SessionShared>) -> Self {
        Self {
            session,
            max_depth: session.config.max_depth,
        }
    }

    pub(crate) fn encode(&self, value: &Value) -> Result<Encoded> {
        self.transaction(|codec, enc, exported| codec.write(enc, value, 0, exported))
    }

    /// Encodes call arguments as one list item.
    pub(crate) fn encode_args(&self, args: &[Value]) -> Result<Encoded> {
        self.transaction(|codec, enc, exported| {
            enc.list_begin()?;
            for arg in args {
                codec.write(enc, arg, 1, exported)?;
            }
            enc.list_end()?;
            Ok(())
        })
    }

    fn transaction<F>(&self, body: F) -> Result<Encoded>
    where
        F: FnOnce(&Self, &mut Encoder, &mut Vec<ObjectId>) -> Result<()>,
    {
        let mut enc = Encoder::new();
        let mut exported = Vec::new();
        let outcome = body(self, &mut enc, &mut exported)
            .and_then(|()| enc.into_bytes().map_err(|e| Error::Encode(e.to_string())));
        match outcome {
            Ok(bytes) => Ok(Encoded { bytes, exported }),
            Err(e) => {
                rollback(self.session, &exported);
                Err(e)
            }
        }
    }

    fn write(&self, enc: &mut Encoder, value: &Value, depth: usize, exported: &mut Vec<ObjectId>) -> Result<()> {
        if depth > self.max_depth {
            return Err(Error::Encode(format!("value nests deeper than {}", self.max_depth)));
        }
        match value {
            Value::Null => enc.null().map_err(encode_err)?,
            Value::Bool(b) => enc.bool(*b).map_err(encode_err)?,
            Value::Int(i) => enc.i64(*i).map_err(encode_err)?,
            Value::Float(f) => enc.f64(*f).map_err(encode_err)?,
            Value::String(s) => enc.str(s).map_err(encode_err)?,
            Value::Bytes(b) => enc.bytes(b).map_err(encode_err)?,
            Value::List(items) => {
                enc.list_begin().map_err(encode_err)?;
                for item in items {
                    self.write(enc, item, depth + 1, exported)?;
                }
                enc.list_end().map_err(encode_err)?;
            }
            Value::Map(entries) => {
                enc.map_begin().map_err(encode_err)?;
                for (key, item) in entries {
                    enc.variant_begin(key).map_err(encode_err)?;
                    self.write(enc, item, depth + 1, exported)?;
                    enc.variant_end().map_err(encode_err)?;
                }
                enc.map_end().map_err(encode_err)?;
            }
            Value::Object(object) => {
                let id = self.session.refs.export_for(Exported::Object(object.clone()))?;
                exported.push(id);
                write_ref(enc, id, Origin::Sender)?;
            }
            Value::Proxy(proxy) if proxy.belongs_to(self.session) => {
                write_ref(enc, proxy.id(), Origin::Receiver)?;
            }
            Value::Proxy(proxy) => {
                let id = self.session.refs.export_for(Exported::Proxy(proxy.clone()))?;
                exported.push(id);
                write_ref(enc, id, Origin::Sender)?;
            }
            Value::Error(err) => {
                enc.variant_begin(marker::ERROR).map_err(encode_err)?;
                enc.map_begin().map_err(encode_err)?;
                write_entry_str(enc, "kind", err.kind.as_tag())?;
                write_entry_str(enc, "message", &err.message)?;
                if let Some(data) = &err.data {
                    enc.variant_begin("data").map_err(encode_err)?;
                    self.write(enc, data, depth + 1, exported)?;
                    enc.variant_end().map_err(encode_err)?;
                }
                enc.map_end().map_err(encode_err)?;
                enc.variant_end().map_err(encode_err)?;
            }
        }
        Ok(())
    }

    /// Decodes one value item.
    pub(crate) fn decode(&self, mut dec: Decoder<'_>) -> Result<Value> {
        let mut folded = Vec::new();
        let value = self.read(&mut dec, 0, &mut folded)?;
        exhausted(&dec, "value")?;
        Ok(value)
    }

    /// Decodes call arguments, also returning the ids of local targets they
    /// name so the dispatcher can pin them.
    pub(crate) fn decode_args(&self, mut dec: Decoder<'_>) -> Result<(Vec<Value>, Vec<ObjectId>)> {
        let mut folded = Vec::new();
        let mut list = dec.list()?;
        let mut args = Vec::new();
        while let Some(mut item) = list.next()? {
            args.push(self.read(&mut item, 1, &mut folded)?);
        }
        exhausted(&dec, "arguments")?;
        Ok((args, folded))
    }

    fn read(&self, dec: &mut Decoder<'_>, depth: usize, folded: &mut Vec<ObjectId>) -> Result<Value> {
        if depth > self.max_depth {
            return Err(Error::Decode(format!("value nests deeper than {}", self.max_depth)));
        }
        let value = match dec.peek_tag()? {
            Tag::Null => {
                dec.null()?;
                Value::Null
            }
            Tag::True | Tag::False => Value::Bool(dec.bool()?),
            Tag::I64 => Value::Int(dec.i64()?),
            Tag::U64 => {
                let raw = dec.u64()?;
                let int = i64::try_from(raw)
                    .map_err(|_| Error::Decode(format!("integer {} out of range", raw)))?;
                Value::Int(int)
            }
            Tag::F64 => Value::Float(dec.f64()?),
            Tag::String => Value::String(dec.str()?.to_string()),
            Tag::Bytes => Value::Bytes(dec.bytes()?.to_vec()),
            Tag::List => {
                let mut list = dec.list()?;
                let mut items = Vec::new();
                while let Some(mut item) = list.next()? {
                    items.push(self.read(&mut item, depth + 1, folded)?);
                }
                Value::List(items)
            }
            Tag::Map => {
                let mut map = dec.map()?;
                let mut entries = BTreeMap::new();
                while let Some((key, mut item)) = map.next()? {
                    let value = self.read(&mut item, depth + 1, folded)?;
                    exhausted(&item, key)?;
                    entries.insert(key.to_string(), value);
                }
                Value::Map(entries)
            }
            Tag::Variant => {
                let (name, mut body) = dec.variant()?;
                match name {
                    marker::REF => self.read_ref(&mut body, folded)?,
                    marker::ERROR => Value::Error(self.read_error(&mut body, depth, folded)?),
                    other => return Err(Error::Decode(format!("unknown value marker '{}'", other))),
                }
            }
        };
        Ok(value)
    }

    fn read_ref(&self, body: &mut Decoder<'_>, folded: &mut Vec<ObjectId>) -> Result<Value> {
        let mut map = body.map()?;
        let mut oid = None;
        let mut origin = None;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "oid" => oid = Some(ObjectId(val.u64()?)),
                "origin" => {
                    let tag = val.str()?;
                    origin = Some(Origin::from_tag(tag).ok_or_else(|| {
                        Error::Decode(format!("unknown reference origin '{}'", tag))
                    })?);
                }
                _ => val.skip()?,
            }
            exhausted(&val, key)?;
        }
        exhausted(body, marker::REF)?;
        let id = oid.ok_or_else(|| Error::Decode("reference without oid".into()))?;
        let origin = origin.ok_or_else(|| Error::Decode("reference without origin".into()))?;

        match origin {
            Origin::Sender => Ok(Value::Proxy(self.session.refs.import_proxy(self.session, id, 1))),
            Origin::Receiver => match self.session.refs.resolve(id) {
                Some(Exported::Object(object)) => {
                    folded.push(id);
                    Ok(Value::Object(object))
                }
                Some(Exported::Proxy(proxy)) => {
                    folded.push(id);
                    Ok(Value::Proxy(proxy))
                }
                None => Err(Error::UnknownReference(id)),
            },
        }
    }

    fn read_error(&self, body: &mut Decoder<'_>, depth: usize, folded: &mut Vec<ObjectId>) -> Result<RemoteError> {
        let mut map = body.map()?;
        let mut kind = None;
        let mut message = None;
        let mut data = None;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "kind" => kind = Some(ErrorKind::from_tag(val.str()?)),
                "message" => message = Some(val.str()?.to_string()),
                "data" => data = Some(Box::new(self.read(&mut val, depth + 1, folded)?)),
                _ => val.skip()?,
            }
            exhausted(&val, key)?;
        }
        exhausted(body, marker::ERROR)?;
        Ok(RemoteError {
            kind: kind.ok_or_else(|| Error::Decode("error value without kind".into()))?,
            message: message.unwrap_or_default(),
            data,
        })
    }
}

/// Gives back one count per id.
pub(crate) fn rollback(session: &SessionShared, exported: &[ObjectId]) {
    for id in exported {
        if let Err(e) = session.refs.release(*id, 1) {
            tracing::debug!(object = %id, error = %e, "export already released");
        }
    }
}

/// Fails if `dec` has bytes left after the one item it should hold.
fn exhausted(dec: &Decoder<'_>, what: &str) -> Result<()> {
    match dec.remaining() {
        0 => Ok(()),
        n => Err(Error::Decode(format!("{} trailing bytes after {}", n, what))),
    }
}

fn write_ref(enc: &mut Encoder, id: ObjectId, origin: Origin) -> Result<()> {
    enc.variant_begin(marker::REF).map_err(encode_err)?;
    enc.map_begin().map_err(encode_err)?;
    enc.variant_begin("oid").map_err(encode_err)?;
    enc.u64(id.0).map_err(encode_err)?;
    enc.variant_end().map_err(encode_err)?;
    write_entry_str(enc, "origin", origin.as_tag())?;
    enc.map_end().map_err(encode_err)?;
    enc.variant_end().map_err(encode_err)?;
    Ok(())
}

fn write_entry_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key).map_err(encode_err)?;
    enc.str(val).map_err(encode_err)?;
    enc.variant_end().map_err(encode_err)?;
    Ok(())
}

fn encode_err(e: ternpack::Error) -> Error {
    Error::Encode(e.to_string())
}
