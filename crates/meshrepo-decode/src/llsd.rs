//! Binary structured-data codec.
//!
//! Every value starts with a one-byte ASCII type tag. Multi-byte scalars and
//! length prefixes are big-endian. Compressed blocks wrap exactly one value in
//! a zlib stream (see [`unzip_llsd`]).

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use uuid::Uuid;

use crate::error::{DecodeError, DecodeResult};

/// Nesting limit for arrays and maps.
const MAX_DEPTH: usize = 64;

/// A dynamically typed structured-data value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Llsd {
    #[default]
    Undefined,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    Uuid(Uuid),
    String(String),
    Uri(String),
    /// Seconds since the Unix epoch.
    Date(f64),
    Binary(Vec<u8>),
    Array(Vec<Llsd>),
    Map(BTreeMap<String, Llsd>),
}

impl Llsd {
    /// Create an empty map.
    #[must_use]
    pub fn map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Builder-style insert. Has no effect on non-map values.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Llsd>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a key into a map value. Returns false if `self` is not a map.
    pub fn insert(&mut self, key: &str, value: impl Into<Llsd>) -> bool {
        if let Self::Map(map) = self {
            map.insert(key.to_string(), value.into());
            true
        } else {
            false
        }
    }

    /// Look up a key in a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Llsd> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Integer view. Reals truncate toward zero and booleans map to 0/1.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_integer(&self) -> Option<i32> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Real(v) => Some(*v as i32),
            Self::Boolean(b) => Some(i32::from(*b)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(v) | Self::Date(v) => Some(*v),
            Self::Integer(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            Self::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Uri(s) => Some(s),
            _ => None,
        }
    }

    /// UUID view. Strings in hyphenated form are accepted too.
    #[must_use]
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(id) => Some(*id),
            Self::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(data) => Some(data),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Llsd]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Llsd>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Parse one value from the front of `data`.
    ///
    /// Returns the value and the number of bytes consumed. Trailing bytes are
    /// left untouched, which is how a header is separated from block data.
    pub fn parse_binary(data: &[u8]) -> DecodeResult<(Llsd, usize)> {
        let mut reader = Reader { data, pos: 0 };
        let value = reader.read_value(0)?;
        Ok((value, reader.pos))
    }

    /// Serialize to the binary form.
    #[must_use]
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_binary(&mut out);
        out
    }

    /// Append the binary form of this value to `out`.
    pub fn write_binary(&self, out: &mut Vec<u8>) {
        match self {
            Self::Undefined => out.push(b'!'),
            Self::Boolean(true) => out.push(b'1'),
            Self::Boolean(false) => out.push(b'0'),
            Self::Integer(v) => {
                out.push(b'i');
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Real(v) => {
                out.push(b'r');
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Uuid(id) => {
                out.push(b'u');
                out.extend_from_slice(id.as_bytes());
            }
            Self::String(s) => write_sized(out, b's', s.as_bytes()),
            Self::Uri(s) => write_sized(out, b'l', s.as_bytes()),
            Self::Date(v) => {
                out.push(b'd');
                out.extend_from_slice(&v.to_be_bytes());
            }
            Self::Binary(data) => write_sized(out, b'b', data),
            Self::Array(items) => {
                out.push(b'[');
                out.extend_from_slice(&len_u32(items.len()).to_be_bytes());
                for item in items {
                    item.write_binary(out);
                }
                out.push(b']');
            }
            Self::Map(map) => {
                out.push(b'{');
                out.extend_from_slice(&len_u32(map.len()).to_be_bytes());
                for (key, value) in map {
                    write_sized(out, b'k', key.as_bytes());
                    value.write_binary(out);
                }
                out.push(b'}');
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn len_u32(len: usize) -> u32 {
    len.min(u32::MAX as usize) as u32
}

fn write_sized(out: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&len_u32(bytes.len()).to_be_bytes());
    out.extend_from_slice(bytes);
}

impl From<bool> for Llsd {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Llsd {
    fn from(v: i32) -> Self {
        Self::Integer(v)
    }
}

impl From<u32> for Llsd {
    fn from(v: u32) -> Self {
        Self::Integer(i32::try_from(v).unwrap_or(i32::MAX))
    }
}

impl From<f64> for Llsd {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<f32> for Llsd {
    fn from(v: f32) -> Self {
        Self::Real(f64::from(v))
    }
}

impl From<&str> for Llsd {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Llsd {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Uuid> for Llsd {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Vec<u8>> for Llsd {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<Vec<Llsd>> for Llsd {
    fn from(v: Vec<Llsd>) -> Self {
        Self::Array(v)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, context: &'static str) -> DecodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(DecodeError::UnexpectedEof { context })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self, context: &'static str) -> DecodeResult<u8> {
        Ok(self.take(1, context)?[0])
    }

    fn read_array<const N: usize>(&mut self, context: &'static str) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, context)?);
        Ok(out)
    }

    fn read_len(&mut self, context: &'static str) -> DecodeResult<usize> {
        let len = u32::from_be_bytes(self.read_array(context)?) as usize;
        Ok(len)
    }

    fn read_sized(&mut self, context: &'static str) -> DecodeResult<&'a [u8]> {
        let len = self.read_len(context)?;
        if len > self.remaining() {
            return Err(DecodeError::BufferTooSmall {
                expected: len,
                actual: self.remaining(),
            });
        }
        self.take(len, context)
    }

    fn read_string(&mut self, context: &'static str) -> DecodeResult<String> {
        let bytes = self.read_sized(context)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::invalid(context, e.to_string()))
    }

    fn expect(&mut self, tag: u8, context: &'static str) -> DecodeResult<()> {
        let found = self.read_u8(context)?;
        if found == tag {
            Ok(())
        } else {
            Err(DecodeError::invalid(
                context,
                format!("expected '{}', found 0x{found:02x}", tag as char),
            ))
        }
    }

    fn read_value(&mut self, depth: usize) -> DecodeResult<Llsd> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::invalid("llsd", "nesting too deep"));
        }

        let tag = self.read_u8("llsd tag")?;
        let value = match tag {
            b'!' => Llsd::Undefined,
            b'1' => Llsd::Boolean(true),
            b'0' => Llsd::Boolean(false),
            b'i' => Llsd::Integer(i32::from_be_bytes(self.read_array("llsd integer")?)),
            b'r' => Llsd::Real(f64::from_be_bytes(self.read_array("llsd real")?)),
            b'd' => Llsd::Date(f64::from_be_bytes(self.read_array("llsd date")?)),
            b'u' => Llsd::Uuid(Uuid::from_bytes(self.read_array("llsd uuid")?)),
            b's' => Llsd::String(self.read_string("llsd string")?),
            b'l' => Llsd::Uri(self.read_string("llsd uri")?),
            b'b' => Llsd::Binary(self.read_sized("llsd binary")?.to_vec()),
            b'[' => {
                let count = self.read_len("llsd array")?;
                let mut items = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                self.expect(b']', "llsd array")?;
                Llsd::Array(items)
            }
            b'{' => {
                let count = self.read_len("llsd map")?;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key_tag = self.read_u8("llsd map key")?;
                    if key_tag != b'k' && key_tag != b's' {
                        return Err(DecodeError::invalid(
                            "llsd map key",
                            format!("unexpected tag 0x{key_tag:02x}"),
                        ));
                    }
                    let key = self.read_string("llsd map key")?;
                    let value = self.read_value(depth + 1)?;
                    map.insert(key, value);
                }
                self.expect(b'}', "llsd map")?;
                Llsd::Map(map)
            }
            other => {
                return Err(DecodeError::invalid(
                    "llsd",
                    format!("unknown type tag 0x{other:02x}"),
                ));
            }
        };
        Ok(value)
    }
}

/// Inflate a zlib block and parse the single value it contains.
pub fn unzip_llsd(data: &[u8]) -> DecodeResult<Llsd> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut inflated)
        .map_err(|e| DecodeError::Compression {
            context: "zlib block",
            detail: e.to_string(),
        })?;
    let (value, _) = Llsd::parse_binary(&inflated)?;
    Ok(value)
}

/// Serialize a value and deflate it into a zlib block.
pub fn zip_llsd(value: &Llsd) -> DecodeResult<Vec<u8>> {
    let to_error = |e: std::io::Error| DecodeError::Compression {
        context: "zlib block",
        detail: e.to_string(),
    };
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&value.to_binary()).map_err(to_error)?;
    encoder.finish().map_err(to_error)
}
