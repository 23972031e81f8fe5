//! Declarative codec for SSH wire structures (RFC 4251 section 5).
//!
//! A message body is described as an ordered list of named fields, each with
//! a wire type. The same [`StructDef`] drives both encoding and decoding, so
//! a message layout is written down exactly once.
//!
//! Wire types:
//!
//! ```text
//! byte[n]    fixed-length raw bytes
//! uint32     big-endian 32-bit integer
//! boolean    single byte, zero is false
//! mpint      multiple-precision integer, two's complement, minimal
//! string     length-prefixed binary string
//! name-list  length-prefixed comma-separated ASCII names
//! ```

use bytes::{BufMut, BytesMut};
use kedge_platform::{KedgeError, KedgeResult};

/// Wire type of a single field in a [`StructDef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Fixed-length raw bytes (e.g. the 16-byte KEXINIT cookie).
    Fixed(usize),
    /// Big-endian unsigned 32-bit integer.
    U32,
    /// Single-byte boolean.
    Boolean,
    /// Multiple-precision integer in two's complement.
    Mpint,
    /// Length-prefixed binary string.
    BString,
    /// Length-prefixed UTF-8 text string.
    Str,
    /// Length-prefixed comma-separated name list.
    NameList,
    /// Reserved bytes, written as zeros and ignored on decode.
    Skip(usize),
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Raw bytes for [`FieldType::Fixed`].
    Fixed(Vec<u8>),
    /// Integer for [`FieldType::U32`].
    U32(u32),
    /// Boolean for [`FieldType::Boolean`].
    Boolean(bool),
    /// Magnitude bytes for [`FieldType::Mpint`], without sign prefix.
    Mpint(Vec<u8>),
    /// Binary string for [`FieldType::BString`].
    BString(Vec<u8>),
    /// Text string for [`FieldType::Str`].
    Str(String),
    /// Parsed names for [`FieldType::NameList`].
    NameList(Vec<String>),
    /// Placeholder for [`FieldType::Skip`]; carries no data.
    Skip,
}

/// Ordered collection of named field values.
///
/// Field order matters on the wire, so this is a thin wrapper over a `Vec`
/// rather than a hash map. Lookups are linear; messages have at most a
/// dozen fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    entries: Vec<(&'static str, Value)>,
}

impl FieldMap {
    /// Creates an empty field map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a field, replacing any existing field of the same name.
    pub fn set(&mut self, name: &'static str, value: Value) {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Looks up a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    /// Returns a uint32 field, or a protocol error if absent or mistyped.
    pub fn get_u32(&self, name: &str) -> KedgeResult<u32> {
        match self.get(name) {
            Some(Value::U32(v)) => Ok(*v),
            _ => Err(field_error(name, "uint32")),
        }
    }

    /// Returns a boolean field.
    pub fn get_bool(&self, name: &str) -> KedgeResult<bool> {
        match self.get(name) {
            Some(Value::Boolean(v)) => Ok(*v),
            _ => Err(field_error(name, "boolean")),
        }
    }

    /// Returns a text string field.
    pub fn get_str(&self, name: &str) -> KedgeResult<&str> {
        match self.get(name) {
            Some(Value::Str(v)) => Ok(v),
            _ => Err(field_error(name, "string")),
        }
    }

    /// Returns a binary string field.
    pub fn get_bytes(&self, name: &str) -> KedgeResult<&[u8]> {
        match self.get(name) {
            Some(Value::BString(v)) => Ok(v),
            Some(Value::Fixed(v)) => Ok(v),
            Some(Value::Mpint(v)) => Ok(v),
            _ => Err(field_error(name, "bytes")),
        }
    }

    /// Returns a name-list field.
    pub fn get_names(&self, name: &str) -> KedgeResult<&[String]> {
        match self.get(name) {
            Some(Value::NameList(v)) => Ok(v),
            _ => Err(field_error(name, "name-list")),
        }
    }

    /// Iterates over fields in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, Value)> {
        self.entries.iter()
    }
}

impl<const N: usize> From<[(&'static str, Value); N]> for FieldMap {
    fn from(entries: [(&'static str, Value); N]) -> Self {
        let mut map = FieldMap::new();
        for (name, value) in entries {
            map.set(name, value);
        }
        map
    }
}

fn field_error(name: &str, expected: &str) -> KedgeError {
    KedgeError::Frame(format!("missing or mistyped field {name} (expected {expected})"))
}

/// Description of a wire structure as an ordered list of typed fields.
#[derive(Debug, Clone)]
pub struct StructDef {
    fields: Vec<(&'static str, FieldType)>,
}

impl StructDef {
    /// Creates a definition from fields in wire order.
    pub fn new(fields: Vec<(&'static str, FieldType)>) -> Self {
        Self { fields }
    }

    /// Field descriptors in wire order.
    pub fn fields(&self) -> &[(&'static str, FieldType)] {
        &self.fields
    }

    /// Computes the encoded size of `values` without encoding.
    pub fn size(&self, values: &FieldMap) -> KedgeResult<usize> {
        let mut total = 0;
        for (name, ftype) in &self.fields {
            total += match ftype {
                FieldType::Fixed(n) | FieldType::Skip(n) => *n,
                FieldType::U32 => 4,
                FieldType::Boolean => 1,
                FieldType::Mpint => match values.get(name) {
                    Some(Value::Mpint(v)) => 4 + mpint_body_len(v),
                    _ => return Err(field_error(name, "mpint")),
                },
                FieldType::BString => 4 + values.get_bytes(name)?.len(),
                FieldType::Str => 4 + values.get_str(name)?.len(),
                FieldType::NameList => 4 + name_list_len(values.get_names(name)?),
            };
        }
        Ok(total)
    }

    /// Encodes `values` onto the end of `buf`.
    pub fn encode(&self, values: &FieldMap, buf: &mut BytesMut) -> KedgeResult<()> {
        for (name, ftype) in &self.fields {
            match ftype {
                FieldType::Fixed(n) => {
                    let bytes = values.get_bytes(name)?;
                    if bytes.len() != *n {
                        return Err(KedgeError::Frame(format!(
                            "field {name}: expected {n} bytes, got {}",
                            bytes.len()
                        )));
                    }
                    buf.put_slice(bytes);
                }
                FieldType::U32 => buf.put_u32(values.get_u32(name)?),
                FieldType::Boolean => buf.put_u8(values.get_bool(name)? as u8),
                FieldType::Mpint => match values.get(name) {
                    Some(Value::Mpint(v)) => write_mpint(buf, v),
                    _ => return Err(field_error(name, "mpint")),
                },
                FieldType::BString => {
                    let bytes = values.get_bytes(name)?;
                    buf.put_u32(bytes.len() as u32);
                    buf.put_slice(bytes);
                }
                FieldType::Str => {
                    let s = values.get_str(name)?;
                    buf.put_u32(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                }
                FieldType::NameList => write_name_list(buf, values.get_names(name)?),
                FieldType::Skip(n) => buf.put_bytes(0, *n),
            }
        }
        Ok(())
    }

    /// Encodes `values` into a freshly allocated buffer.
    pub fn encode_to_vec(&self, values: &FieldMap) -> KedgeResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.size(values)?);
        self.encode(values, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decodes a structure, requiring that `data` is consumed exactly.
    pub fn decode_from(&self, data: &[u8]) -> KedgeResult<FieldMap> {
        let mut reader = Reader::new(data);
        let values = self.decode(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(KedgeError::Frame(format!(
                "{} trailing bytes after structure",
                reader.remaining()
            )));
        }
        Ok(values)
    }

    /// Decodes a structure from `reader`, leaving any trailing bytes.
    pub fn decode(&self, reader: &mut Reader<'_>) -> KedgeResult<FieldMap> {
        let mut values = FieldMap::new();
        for (name, ftype) in &self.fields {
            let value = match ftype {
                FieldType::Fixed(n) => Value::Fixed(reader.read_bytes(*n)?.to_vec()),
                FieldType::U32 => Value::U32(reader.read_u32()?),
                FieldType::Boolean => Value::Boolean(reader.read_u8()? != 0),
                FieldType::Mpint => Value::Mpint(read_mpint_body(reader)?),
                FieldType::BString => Value::BString(reader.read_string()?.to_vec()),
                FieldType::Str => {
                    let bytes = reader.read_string()?;
                    let s = std::str::from_utf8(bytes).map_err(|_| {
                        KedgeError::Frame(format!("field {name}: invalid UTF-8"))
                    })?;
                    Value::Str(s.to_string())
                }
                FieldType::NameList => Value::NameList(read_name_list(reader)?),
                FieldType::Skip(n) => {
                    reader.read_bytes(*n)?;
                    Value::Skip
                }
            };
            values.set(name, value);
        }
        Ok(values)
    }
}

/// Cursor over a byte slice with bounds-checked reads.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> KedgeResult<u8> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> KedgeResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> KedgeResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(KedgeError::Frame(format!(
                "buffer underrun: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a length-prefixed string.
    pub fn read_string(&mut self) -> KedgeResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }
}

/// Writes an mpint from magnitude bytes, inserting a zero byte when the
/// high bit is set so the value decodes as positive.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    // Strip leading zeros so the encoding is minimal.
    let start = magnitude.iter().position(|&b| b != 0).unwrap_or(magnitude.len());
    let body = &magnitude[start..];
    if body.is_empty() {
        buf.put_u32(0);
        return;
    }
    if body[0] & 0x80 != 0 {
        buf.put_u32(body.len() as u32 + 1);
        buf.put_u8(0);
    } else {
        buf.put_u32(body.len() as u32);
    }
    buf.put_slice(body);
}

fn mpint_body_len(magnitude: &[u8]) -> usize {
    let start = magnitude.iter().position(|&b| b != 0).unwrap_or(magnitude.len());
    let body = &magnitude[start..];
    if body.is_empty() {
        0
    } else if body[0] & 0x80 != 0 {
        body.len() + 1
    } else {
        body.len()
    }
}

/// Encodes an mpint into a fresh buffer, length prefix included.
pub fn mpint_to_vec(magnitude: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + mpint_body_len(magnitude));
    write_mpint(&mut buf, magnitude);
    buf.to_vec()
}

fn read_mpint_body(reader: &mut Reader<'_>) -> KedgeResult<Vec<u8>> {
    let raw = reader.read_string()?;
    if !raw.is_empty() && raw[0] & 0x80 != 0 {
        return Err(KedgeError::Frame(
            "negative mpint not supported".to_string(),
        ));
    }
    // Drop sign/leading zero bytes so callers see the bare magnitude.
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Ok(raw[start..].to_vec())
}

/// Writes a comma-separated name list with a uint32 length prefix.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    let joined = names.join(",");
    buf.put_u32(joined.len() as u32);
    buf.put_slice(joined.as_bytes());
}

fn name_list_len(names: &[String]) -> usize {
    if names.is_empty() {
        0
    } else {
        names.iter().map(String::len).sum::<usize>() + names.len() - 1
    }
}

fn read_name_list(reader: &mut Reader<'_>) -> KedgeResult<Vec<String>> {
    let raw = reader.read_string()?;
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| KedgeError::Frame("name-list is not ASCII".to_string()))?;
    Ok(text.split(',').map(String::from).collect())
}

/// Convenience for building a `Vec<String>` name list from literals.
pub fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
