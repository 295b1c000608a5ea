//! # Protocol Frames
//!
//! The four envelope kinds exchanged by sessions. Every frame is a top-level
//! `Variant(kind)` wrapping a `Map` of named fields:
//!
//! ```text
//! call     { cid: u64, target: u64, method: str, args: List }
//! result   { cid: u64, value: any }
//! error    { cid: u64, kind: str, message: str, data?: any }
//! refDelta { deltas: List[ Map { oid: u64, delta: i64 } ] }
//! ```
//!
//! Values inside frames are opaque, already-encoded items: encoders splice them
//! in with `Encoder::raw`, decoders hand them back as sub-`Decoder`s. Turning
//! them into runtime values is the codec's job, not the frame's.
//!
//! ## Invariants
//! - **No panics on input**: malformed or truncated frames decode to an error.
//! - **Forward compatibility**: fields a decoder does not know are skipped.

use crate::error::ErrorKind;
use crate::error::Result;
use crate::error::WireError;

use ternpack::Decoder;
use ternpack::Encoder;

pub const CALL: &str = "call";
pub const RESULT: &str = "result";
pub const ERROR: &str = "error";
pub const REF_DELTA: &str = "refDelta";

/// Encodes an outbound `call` frame.
pub struct CallEncoder<'a> {
    pub correlation: u64,
    pub target: u64,
    pub method: &'a str,
    /// One encoded List item holding the arguments.
    pub args: &'a [u8],
}

impl<'a> CallEncoder<'a> {
    pub fn new(correlation: u64, target: u64, method: &'a str, args: &'a [u8]) -> Self {
        Self { correlation, target, method, args }
    }

    /// Encode this call into the encoder.
    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin(CALL)?;
        enc.map_begin()?;
        write_map_u64(enc, "cid", self.correlation)?;
        write_map_u64(enc, "target", self.target)?;
        write_map_str(enc, "method", self.method)?;
        write_map_raw(enc, "args", self.args)?;
        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    pub fn into_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }
}

/// Encodes an outbound `result` frame.
pub struct ResultEncoder<'a> {
    pub correlation: u64,
    /// One encoded value item.
    pub value: &'a [u8],
}

impl<'a> ResultEncoder<'a> {
    pub fn new(correlation: u64, value: &'a [u8]) -> Self {
        Self { correlation, value }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin(RESULT)?;
        enc.map_begin()?;
        write_map_u64(enc, "cid", self.correlation)?;
        write_map_raw(enc, "value", self.value)?;
        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    pub fn into_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }
}

/// Encodes an outbound `error` frame.
pub struct ErrorEncoder<'a> {
    pub correlation: u64,
    pub kind: &'a ErrorKind,
    pub message: &'a str,
    /// Optional encoded value item with structured detail.
    pub data: Option<&'a [u8]>,
}

impl<'a> ErrorEncoder<'a> {
    pub fn new(correlation: u64, kind: &'a ErrorKind, message: &'a str) -> Self {
        Self { correlation, kind, message, data: None }
    }

    pub fn with_data(mut self, data: &'a [u8]) -> Self {
        self.data = Some(data);
        self
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin(ERROR)?;
        enc.map_begin()?;
        write_map_u64(enc, "cid", self.correlation)?;
        write_map_str(enc, "kind", self.kind.as_tag())?;
        write_map_str(enc, "message", self.message)?;
        if let Some(data) = self.data {
            write_map_raw(enc, "data", data)?;
        }
        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    pub fn into_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }
}

/// One reference-count adjustment for an object the receiver exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub object: u64,
    pub delta: i64,
}

/// Encodes an outbound `refDelta` frame.
pub struct RefDeltaEncoder<'a> {
    pub deltas: &'a [Delta],
}

impl<'a> RefDeltaEncoder<'a> {
    pub fn new(deltas: &'a [Delta]) -> Self {
        Self { deltas }
    }

    pub fn encode(&self, enc: &mut Encoder) -> Result<()> {
        enc.variant_begin(REF_DELTA)?;
        enc.map_begin()?;
        enc.variant_begin("deltas")?;
        enc.list_begin()?;
        for d in self.deltas {
            enc.map_begin()?;
            write_map_u64(enc, "oid", d.object)?;
            enc.variant_begin("delta")?;
            enc.i64(d.delta)?;
            enc.variant_end()?;
            enc.map_end()?;
        }
        enc.list_end()?;
        enc.variant_end()?;
        enc.map_end()?;
        enc.variant_end()?;
        Ok(())
    }

    pub fn into_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }
}

/// A decoded inbound `call` frame.
///
/// **Invariant**: `args` points at a List container.
pub struct CallFrame<'a> {
    pub correlation: u64,
    pub target: u64,
    pub method: &'a str,
    pub args: Decoder<'a>,
}

impl<'a> CallFrame<'a> {
    fn decode(mut body: Decoder<'a>) -> Result<Self> {
        let mut map = body.map()?;
        let mut correlation = None;
        let mut target = None;
        let mut method = None;
        let mut args = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "cid" => correlation = Some(val.u64()?),
                "target" => target = Some(val.u64()?),
                "method" => method = Some(val.str()?),
                "args" => args = Some(val),
                _ => val.skip()?,
            }
        }

        Ok(CallFrame {
            correlation: correlation.ok_or(WireError::MissingField("cid"))?,
            target: target.ok_or(WireError::MissingField("target"))?,
            method: method.ok_or(WireError::MissingField("method"))?,
            args: args.ok_or(WireError::MissingField("args"))?,
        })
    }
}

/// A decoded inbound `result` frame.
pub struct ResultFrame<'a> {
    pub correlation: u64,
    pub value: Decoder<'a>,
}

impl<'a> ResultFrame<'a> {
    fn decode(mut body: Decoder<'a>) -> Result<Self> {
        let mut map = body.map()?;
        let mut correlation = None;
        let mut value = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "cid" => correlation = Some(val.u64()?),
                "value" => value = Some(val),
                _ => val.skip()?,
            }
        }

        Ok(ResultFrame {
            correlation: correlation.ok_or(WireError::MissingField("cid"))?,
            value: value.ok_or(WireError::MissingField("value"))?,
        })
    }
}

/// A decoded inbound `error` frame.
pub struct ErrorFrame<'a> {
    pub correlation: u64,
    pub kind: ErrorKind,
    pub message: &'a str,
    pub data: Option<Decoder<'a>>,
}

impl<'a> ErrorFrame<'a> {
    fn decode(mut body: Decoder<'a>) -> Result<Self> {
        let mut map = body.map()?;
        let mut correlation = None;
        let mut kind = None;
        let mut message = None;
        let mut data = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "cid" => correlation = Some(val.u64()?),
                "kind" => kind = Some(ErrorKind::from_tag(val.str()?)),
                "message" => message = Some(val.str()?),
                "data" => data = Some(val),
                _ => val.skip()?,
            }
        }

        Ok(ErrorFrame {
            correlation: correlation.ok_or(WireError::MissingField("cid"))?,
            kind: kind.ok_or(WireError::MissingField("kind"))?,
            message: message.ok_or(WireError::MissingField("message"))?,
            data,
        })
    }
}

/// A decoded inbound `refDelta` frame.
pub struct RefDeltaFrame {
    pub deltas: Vec<Delta>,
}

impl RefDeltaFrame {
    fn decode(mut body: Decoder<'_>) -> Result<Self> {
        let mut map = body.map()?;
        let mut deltas = None;

        while let Some((key, mut val)) = map.next()? {
            match key {
                "deltas" => {
                    let mut list = val.list()?;
                    let mut out = Vec::new();
                    while let Some(mut item) = list.next()? {
                        out.push(decode_delta(&mut item)?);
                    }
                    deltas = Some(out);
                }
                _ => val.skip()?,
            }
        }

        Ok(RefDeltaFrame {
            deltas: deltas.ok_or(WireError::MissingField("deltas"))?,
        })
    }
}

fn decode_delta(dec: &mut Decoder<'_>) -> Result<Delta> {
    let mut map = dec.map()?;
    let mut object = None;
    let mut delta = None;
    while let Some((key, mut val)) = map.next()? {
        match key {
            "oid" => object = Some(val.u64()?),
            "delta" => delta = Some(val.i64()?),
            _ => val.skip()?,
        }
    }
    Ok(Delta {
        object: object.ok_or(WireError::MissingField("oid"))?,
        delta: delta.ok_or(WireError::MissingField("delta"))?,
    })
}

/// Top-level frame decoder.
pub enum Frame<'a> {
    Call(CallFrame<'a>),
    Result(ResultFrame<'a>),
    Error(ErrorFrame<'a>),
    RefDelta(RefDeltaFrame),
}

impl<'a> Frame<'a> {
    /// Decode one frame; the bytes must hold exactly one frame.
    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let (kind, body) = dec.variant()?;
        if dec.remaining() != 0 {
            return Err(WireError::ProtocolViolation(format!(
                "{} trailing bytes after frame", dec.remaining()
            )));
        }
        match kind {
            CALL => Ok(Frame::Call(CallFrame::decode(body)?)),
            RESULT => Ok(Frame::Result(ResultFrame::decode(body)?)),
            ERROR => Ok(Frame::Error(ErrorFrame::decode(body)?)),
            REF_DELTA => Ok(Frame::RefDelta(RefDeltaFrame::decode(body)?)),
            other => Err(WireError::UnknownFrame(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Call(_) => CALL,
            Frame::Result(_) => RESULT,
            Frame::Error(_) => ERROR,
            Frame::RefDelta(_) => REF_DELTA,
        }
    }
}

// Helper functions

fn write_map_u64(enc: &mut Encoder, key: &str, val: u64) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u64(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_map_raw(enc: &mut Encoder, key: &str, item: &[u8]) -> Result<()> {
    enc.variant_begin(key)?;
    enc.raw(item)?;
    enc.variant_end()?;
    Ok(())
}
