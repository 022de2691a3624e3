//! Binary primitives shared by the INPUT and STATE messages
//!
//! Everything is little-endian. Counts and lengths use a 7-bit variable
//! length encoding (VLE), low bits first.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

/// Wire decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("Unexpected end of message: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Unknown value type tag: {0}")]
    UnknownValueType(u8),

    #[error("Variable length integer does not fit in 32 bits")]
    VarintOverflow,

    #[error("String is not valid UTF-8")]
    InvalidUtf8,
}

/// Case-insensitive 32-bit string hash used for map keys and type tags
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StringHash(pub u32);

impl StringHash {
    /// SDBM hash over the lowercased bytes
    pub const fn new(s: &str) -> Self {
        let bytes = s.as_bytes();
        let mut hash: u32 = 0;
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i].to_ascii_lowercase() as u32;
            hash = c
                .wrapping_add(hash << 6)
                .wrapping_add(hash << 16)
                .wrapping_sub(hash);
            i += 1;
        }
        Self(hash)
    }
}

impl From<&str> for StringHash {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for StringHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}

/// Type tag of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ValueType {
    None = 0,
    Int = 1,
    Bool = 2,
    Float = 3,
    Vector2 = 4,
    Vector3 = 5,
    Quaternion = 6,
    String = 7,
    Buffer = 8,
    Int64 = 9,
    Double = 10,
}

impl ValueType {
    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            0 => Self::None,
            1 => Self::Int,
            2 => Self::Bool,
            3 => Self::Float,
            4 => Self::Vector2,
            5 => Self::Vector3,
            6 => Self::Quaternion,
            7 => Self::String,
            8 => Self::Buffer,
            9 => Self::Int64,
            10 => Self::Double,
            other => return Err(WireError::UnknownValueType(other)),
        })
    }

    /// Zero value of this type, identity for quaternions
    pub fn default_value(self) -> Value {
        match self {
            Self::None => Value::None,
            Self::Int => Value::Int(0),
            Self::Bool => Value::Bool(false),
            Self::Float => Value::Float(0.0),
            Self::Vector2 => Value::Vector2([0.0; 2]),
            Self::Vector3 => Value::Vector3([0.0; 3]),
            Self::Quaternion => Value::Quaternion([1.0, 0.0, 0.0, 0.0]),
            Self::String => Value::String(String::new()),
            Self::Buffer => Value::Buffer(Vec::new()),
            Self::Int64 => Value::Int64(0),
            Self::Double => Value::Double(0.0),
        }
    }
}

/// Generic attribute / variable value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    None,
    Int(i32),
    Bool(bool),
    Float(f32),
    Vector2([f32; 2]),
    Vector3([f32; 3]),
    /// w, x, y, z
    Quaternion([f32; 4]),
    String(String),
    Buffer(Vec<u8>),
    Int64(i64),
    Double(f64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::None => ValueType::None,
            Self::Int(_) => ValueType::Int,
            Self::Bool(_) => ValueType::Bool,
            Self::Float(_) => ValueType::Float,
            Self::Vector2(_) => ValueType::Vector2,
            Self::Vector3(_) => ValueType::Vector3,
            Self::Quaternion(_) => ValueType::Quaternion,
            Self::String(_) => ValueType::String,
            Self::Buffer(_) => ValueType::Buffer,
            Self::Int64(_) => ValueType::Int64,
            Self::Double(_) => ValueType::Double,
        }
    }

    /// Unsigned view of integer values. `Int` is reinterpreted bit for bit.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Self::Int(v) => Some(v as u32),
            Self::Int64(v) => u32::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<[f32; 3]> {
        match *self {
            Self::Vector3(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Hash-keyed value map, ordered so encoding is deterministic
pub type VariantMap = BTreeMap<StringHash, Value>;

pub fn write_vle(buf: &mut impl BufMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn write_len(buf: &mut impl BufMut, len: usize) {
    debug_assert!(len <= u32::MAX as usize, "length {len} does not fit the wire format");
    write_vle(buf, len as u32);
}

pub fn write_string_hash(buf: &mut impl BufMut, hash: StringHash) {
    buf.put_u32_le(hash.0);
}

/// Writes the value payload without a type tag. The reader must know the type.
pub fn write_value_data(buf: &mut impl BufMut, value: &Value) {
    match value {
        Value::None => {}
        Value::Int(v) => buf.put_i32_le(*v),
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::Float(v) => buf.put_f32_le(*v),
        Value::Vector2(v) => v.iter().for_each(|c| buf.put_f32_le(*c)),
        Value::Vector3(v) => v.iter().for_each(|c| buf.put_f32_le(*c)),
        Value::Quaternion(v) => v.iter().for_each(|c| buf.put_f32_le(*c)),
        Value::String(s) => {
            write_len(buf, s.len());
            buf.put_slice(s.as_bytes());
        }
        Value::Buffer(b) => {
            write_len(buf, b.len());
            buf.put_slice(b);
        }
        Value::Int64(v) => buf.put_i64_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
    }
}

/// Writes a type tag followed by the value payload
pub fn write_value(buf: &mut impl BufMut, value: &Value) {
    buf.put_u8(value.value_type() as u8);
    write_value_data(buf, value);
}

pub fn write_variant_map(buf: &mut impl BufMut, map: &VariantMap) {
    write_len(buf, map.len());
    for (key, value) in map {
        write_string_hash(buf, *key);
        write_value(buf, value);
    }
}

/// Bounds-checked reader over a received message
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn require(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.len() < needed {
            return Err(WireError::UnexpectedEof {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        self.require(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.require(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        self.require(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        self.require(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        self.require(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.require(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_vle(&mut self) -> Result<u32, WireError> {
        let mut result = 0u32;
        for shift in [0u32, 7, 14, 21, 28] {
            let byte = self.read_u8()?;
            let bits = u32::from(byte & 0x7f);
            if shift == 28 && bits > 0x0f {
                return Err(WireError::VarintOverflow);
            }
            result |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(WireError::VarintOverflow)
    }

    pub fn read_string_hash(&mut self) -> Result<StringHash, WireError> {
        self.read_u32().map(StringHash)
    }

    fn read_floats<const N: usize>(&mut self) -> Result<[f32; N], WireError> {
        self.require(N * 4)?;
        let mut out = [0.0; N];
        for c in out.iter_mut() {
            *c = self.buf.get_f32_le();
        }
        Ok(out)
    }

    fn read_len(&mut self) -> Result<usize, WireError> {
        self.read_vle().map(|len| len as usize)
    }

    /// Reads an untagged payload of a known type
    pub fn read_value_data(&mut self, value_type: ValueType) -> Result<Value, WireError> {
        Ok(match value_type {
            ValueType::None => Value::None,
            ValueType::Int => Value::Int(self.read_i32()?),
            ValueType::Bool => Value::Bool(self.read_u8()? != 0),
            ValueType::Float => Value::Float(self.read_f32()?),
            ValueType::Vector2 => Value::Vector2(self.read_floats()?),
            ValueType::Vector3 => Value::Vector3(self.read_floats()?),
            ValueType::Quaternion => Value::Quaternion(self.read_floats()?),
            ValueType::String => {
                let len = self.read_len()?;
                let raw = self.read_bytes(len)?;
                let s = std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)?;
                Value::String(s.to_owned())
            }
            ValueType::Buffer => {
                let len = self.read_len()?;
                Value::Buffer(self.read_bytes(len)?.to_vec())
            }
            ValueType::Int64 => Value::Int64(self.read_i64()?),
            ValueType::Double => Value::Double(self.read_f64()?),
        })
    }

    pub fn read_value(&mut self) -> Result<Value, WireError> {
        let value_type = ValueType::from_tag(self.read_u8()?)?;
        self.read_value_data(value_type)
    }

    pub fn read_variant_map(&mut self) -> Result<VariantMap, WireError> {
        let count = self.read_vle()?;
        let mut map = VariantMap::new();
        for _ in 0..count {
            let key = self.read_string_hash()?;
            let value = self.read_value()?;
            map.insert(key, value);
        }
        Ok(map)
    }
}
