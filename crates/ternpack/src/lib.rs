//! # Ternpack
//!
//! The byte format underneath tern envelopes: self-describing items, each led
//! by a one-byte tag, so a reader can walk or skip data it has no schema for.
//!
//! ## Layout
//!
//! | tag class  | tags                          | encoding                        |
//! |------------|-------------------------------|---------------------------------|
//! | fixed      | null, true, false, u64, i64, f64 | `tag` then 0 or 8 bytes      |
//! | blob       | string, bytes                 | `tag`, `u32` length, raw bytes  |
//! | container  | list, map, variant            | `tag`, `u32` length, items      |
//!
//! Numbers and lengths are little-endian. A map holds only variants (one
//! `name` string plus exactly one payload item), which is also how frames and
//! value markers are spelled.
//!
//! The encoder refuses to build anything a decoder would reject; the decoder
//! borrows from its input and reports truncation or bad tags as errors rather
//! than panicking.


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Not a known tag byte, or not the tag the caller asked for.
    InvalidTag(u8),
    InvalidUtf8,
    /// A `*_end` call closed a different kind of container than the open one.
    ScopeMismatch { expected: Scope, actual: Scope },
    /// A `*_end` call with nothing open.
    ScopeUnderflow,
    /// `into_bytes` with a container still open.
    ScopeStillOpen,
    /// Input ended inside an item.
    UnexpectedEnd,
    /// More than `u32::MAX` bytes in one blob or container.
    BlobTooLarge(usize),
    /// A second payload written into a variant.
    TooManyItems,
    /// A variant closed before its payload was written.
    EmptyVariant,
    /// A map entry that is not a variant.
    InvalidMapEntry,
    /// `Encoder::raw` was given something other than exactly one item.
    InvalidRaw,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidTag(byte) => write!(f, "unexpected tag {:#04x}", byte),
            Error::InvalidUtf8 => write!(f, "string is not utf-8"),
            Error::ScopeMismatch { expected, actual } => {
                write!(f, "closing {:?} while {:?} is open", expected, actual)
            }
            Error::ScopeUnderflow => write!(f, "no open container to close"),
            Error::ScopeStillOpen => write!(f, "container left open"),
            Error::UnexpectedEnd => write!(f, "input ends mid-item"),
            Error::BlobTooLarge(n) => write!(f, "{} bytes do not fit a u32 length", n),
            Error::TooManyItems => write!(f, "variant already holds its payload"),
            Error::EmptyVariant => write!(f, "variant closed without a payload"),
            Error::InvalidMapEntry => write!(f, "map entries must be variants"),
            Error::InvalidRaw => write!(f, "raw splice is not exactly one item"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Null = 0x01,
    True = 0x02,
    False = 0x03,
    U64 = 0x04,
    I64 = 0x05,
    F64 = 0x06,
    String = 0x10,
    Bytes = 0x11,
    List = 0x20,
    Map = 0x21,
    Variant = 0x30,
}

const TAGS: [Tag; 11] = [
    Tag::Null,
    Tag::True,
    Tag::False,
    Tag::U64,
    Tag::I64,
    Tag::F64,
    Tag::String,
    Tag::Bytes,
    Tag::List,
    Tag::Map,
    Tag::Variant,
];

impl Tag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        TAGS.into_iter().find(|tag| *tag as u8 == byte)
    }

    /// Bytes following the tag, or `None` when a `u32` length says how many.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Tag::Null | Tag::True | Tag::False => Some(0),
            Tag::U64 | Tag::I64 | Tag::F64 => Some(8),
            Tag::String | Tag::Bytes | Tag::List | Tag::Map | Tag::Variant => None,
        }
    }
}

/// The kind of container an encoder is currently writing into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Top level; takes any number of items.
    Root,
    List,
    /// Takes variants only.
    Map,
    /// Takes its name, then exactly one payload.
    Variant,
}

struct Open {
    scope: Scope,
    /// Offset of the first body byte; the length slot sits just before it.
    body_at: usize,
    items: usize,
}

const LEN_SLOT: usize = 4;

/// Writes items into a growing buffer, checking structure as it goes.
///
/// Container lengths are unknown until the container closes, so each one gets
/// a zeroed length slot that `*_end` fills in.
pub struct Encoder {
    buf: Vec<u8>,
    open: Vec<Open>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
            open: vec![Open { scope: Scope::Root, body_at: 0, items: 0 }],
        }
    }

    /// The finished bytes. Fails if a container is still open.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self.open.len() {
            1 => Ok(self.buf),
            _ => Err(Error::ScopeStillOpen),
        }
    }

    /// Open containers, not counting the top level.
    pub fn depth(&self) -> usize {
        self.open.len() - 1
    }

    fn top(&mut self) -> &mut Open {
        let last = self.open.len() - 1;
        &mut self.open[last]
    }

    /// Checks that an item tagged `tag` may go into the current container.
    fn admit(&mut self, tag: Tag) -> Result<()> {
        let top = self.top();
        match (top.scope, tag) {
            (Scope::Map, Tag::Variant) => Ok(()),
            (Scope::Map, _) => Err(Error::InvalidMapEntry),
            (Scope::Variant, _) if top.items > 0 => Err(Error::TooManyItems),
            _ => Ok(()),
        }
    }

    fn put_fixed(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.admit(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(data);
        self.top().items += 1;
        Ok(())
    }

    fn put_blob(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::BlobTooLarge(data.len()))?;
        self.admit(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.top().items += 1;
        Ok(())
    }

    fn open(&mut self, tag: Tag, scope: Scope) -> Result<()> {
        self.admit(tag)?;
        self.buf.push(tag as u8);
        self.buf.extend_from_slice(&[0; LEN_SLOT]);
        self.open.push(Open { scope, body_at: self.buf.len(), items: 0 });
        Ok(())
    }

    fn close(&mut self, scope: Scope) -> Result<()> {
        if self.open.len() == 1 {
            return Err(Error::ScopeUnderflow);
        }
        let top = self.top();
        if top.scope != scope {
            return Err(Error::ScopeMismatch { expected: scope, actual: top.scope });
        }
        if scope == Scope::Variant && top.items == 0 {
            return Err(Error::EmptyVariant);
        }
        let body_at = top.body_at;
        let body = self.buf.len() - body_at;
        let len = u32::try_from(body).map_err(|_| Error::BlobTooLarge(body))?;
        self.buf[body_at - LEN_SLOT..body_at].copy_from_slice(&len.to_le_bytes());
        self.open.pop();
        self.top().items += 1;
        Ok(())
    }

    pub fn null(&mut self) -> Result<()> {
        self.put_fixed(Tag::Null, &[])
    }

    pub fn bool(&mut self, v: bool) -> Result<()> {
        self.put_fixed(if v { Tag::True } else { Tag::False }, &[])
    }

    pub fn u64(&mut self, v: u64) -> Result<()> {
        self.put_fixed(Tag::U64, &v.to_le_bytes())
    }

    pub fn i64(&mut self, v: i64) -> Result<()> {
        self.put_fixed(Tag::I64, &v.to_le_bytes())
    }

    pub fn f64(&mut self, v: f64) -> Result<()> {
        self.put_fixed(Tag::F64, &v.to_le_bytes())
    }

    pub fn str(&mut self, v: &str) -> Result<()> {
        self.put_blob(Tag::String, v.as_bytes())
    }

    pub fn bytes(&mut self, v: &[u8]) -> Result<()> {
        self.put_blob(Tag::Bytes, v)
    }

    /// Copies in one item encoded elsewhere, e.g. call arguments built by
    /// another encoder. The item is validated and admitted like a direct write.
    pub fn raw(&mut self, item: &[u8]) -> Result<()> {
        let mut ahead = Decoder::new(item);
        let tag = ahead.peek_tag()?;
        ahead.skip().map_err(|_| Error::InvalidRaw)?;
        if ahead.remaining() > 0 {
            return Err(Error::InvalidRaw);
        }
        self.admit(tag)?;
        self.buf.extend_from_slice(item);
        self.top().items += 1;
        Ok(())
    }

    pub fn list_begin(&mut self) -> Result<()> {
        self.open(Tag::List, Scope::List)
    }

    pub fn list_end(&mut self) -> Result<()> {
        self.close(Scope::List)
    }

    /// Opens a map; its entries are written with `variant_begin`/`variant_end`.
    pub fn map_begin(&mut self) -> Result<()> {
        self.open(Tag::Map, Scope::Map)
    }

    pub fn map_end(&mut self) -> Result<()> {
        self.close(Scope::Map)
    }

    /// Opens a variant called `name`. Write its payload, then `variant_end`.
    pub fn variant_begin(&mut self, name: &str) -> Result<()> {
        self.open(Tag::Variant, Scope::Variant)?;
        self.str(name)?;
        // The name does not count as the payload.
        self.top().items = 0;
        Ok(())
    }

    pub fn variant_end(&mut self) -> Result<()> {
        self.close(Scope::Variant)
    }
}

/// A read cursor over borrowed bytes.
///
/// Each read consumes one item. Opening a container yields a new decoder
/// limited to that container's body, so a malformed child cannot read past
/// its parent.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Unread byte count.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.buf
    }

    pub fn peek_tag(&self) -> Result<Tag> {
        match self.buf.first() {
            Some(&byte) => Tag::from_u8(byte).ok_or(Error::InvalidTag(byte)),
            None => Err(Error::UnexpectedEnd),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let Some((head, rest)) = self.buf.split_at_checked(n) else {
            return Err(Error::UnexpectedEnd);
        };
        self.buf = rest;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?.try_into().map_err(|_| Error::UnexpectedEnd)
    }

    fn take_len(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    /// Consumes the tag byte if it is `want`.
    fn expect(&mut self, want: Tag) -> Result<()> {
        let tag = self.peek_tag()?;
        if tag != want {
            return Err(Error::InvalidTag(tag as u8));
        }
        self.buf = &self.buf[1..];
        Ok(())
    }

    fn prefixed(&mut self, want: Tag) -> Result<&'a [u8]> {
        self.expect(want)?;
        let len = self.take_len()?;
        self.take(len)
    }

    /// Steps over the next item, children included.
    pub fn skip(&mut self) -> Result<()> {
        let tag = self.peek_tag()?;
        self.take(1)?;
        let len = match tag.fixed_width() {
            Some(width) => width,
            None => self.take_len()?,
        };
        self.take(len)?;
        Ok(())
    }

    /// The next item's encoded bytes, tag included.
    pub fn raw(&mut self) -> Result<&'a [u8]> {
        let mut ahead = self.clone();
        ahead.skip()?;
        self.take(self.remaining() - ahead.remaining())
    }

    pub fn null(&mut self) -> Result<()> {
        self.expect(Tag::Null)
    }

    pub fn bool(&mut self) -> Result<bool> {
        let value = match self.peek_tag()? {
            Tag::True => true,
            Tag::False => false,
            other => return Err(Error::InvalidTag(other as u8)),
        };
        self.take(1)?;
        Ok(value)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.expect(Tag::U64)?;
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.expect(Tag::I64)?;
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.expect(Tag::F64)?;
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn str(&mut self) -> Result<&'a str> {
        let bytes = self.prefixed(Tag::String)?;
        std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        self.prefixed(Tag::Bytes)
    }

    pub fn list(&mut self) -> Result<ListIter<'a>> {
        let body = self.prefixed(Tag::List)?;
        Ok(ListIter { body: Decoder::new(body) })
    }

    pub fn map(&mut self) -> Result<MapIter<'a>> {
        let body = self.prefixed(Tag::Map)?;
        Ok(MapIter { body: Decoder::new(body) })
    }

    /// Opens a variant, returning its name and a decoder over its payload.
    pub fn variant(&mut self) -> Result<(&'a str, Decoder<'a>)> {
        let mut body = Decoder::new(self.prefixed(Tag::Variant)?);
        let name = body.str()?;
        Ok((name, body))
    }
}

/// Walks the items of a list. Not an `Iterator`: each step can fail.
#[derive(Debug)]
pub struct ListIter<'a> {
    body: Decoder<'a>,
}

impl<'a> ListIter<'a> {
    pub fn next(&mut self) -> Result<Option<Decoder<'a>>> {
        if self.body.remaining() == 0 {
            return Ok(None);
        }
        self.body.raw().map(|item| Some(Decoder::new(item)))
    }
}

/// Walks the `(name, payload)` entries of a map.
#[derive(Debug)]
pub struct MapIter<'a> {
    body: Decoder<'a>,
}

impl<'a> MapIter<'a> {
    pub fn next(&mut self) -> Result<Option<(&'a str, Decoder<'a>)>> {
        if self.body.remaining() == 0 {
            return Ok(None);
        }
        match self.body.peek_tag()? {
            Tag::Variant => self.body.variant().map(Some),
            other => Err(Error::InvalidTag(other as u8)),
        }
    }
}
