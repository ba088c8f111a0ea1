//! Command building and reply splitting against a [`Catalog`].
//!
//! A command is addressed by its `/`-separated path (`"discovery/get"`) and
//! packed as the opcode prefix followed by each field in table order. A reply
//! is walked code by code through the nested reply tables; when an entry has
//! several shapes the payload length picks one.

use crate::schema::{Catalog, FieldDef, FieldDefault, FieldLen, ReplyBody, ShapeDef};
use bytes::Bytes;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Command building and reply decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No command at this path
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// A required argument was not supplied
    #[error("command '{command}' requires argument '{field}'")]
    MissingField {
        /// Command path
        command: String,
        /// Field name
        field: &'static str,
    },

    /// A fixed-length byte argument has the wrong length
    #[error("argument '{field}' must be {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Field name
        field: &'static str,
        /// Table length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// An integer argument does not fit its encoding
    #[error("argument '{field}' value {value} out of range")]
    ValueOutOfRange {
        /// Field name
        field: &'static str,
        /// Supplied value
        value: i64,
    },

    /// Bytes where an integer was expected or the other way round
    #[error("argument '{field}' has the wrong type")]
    TypeMismatch {
        /// Field name
        field: &'static str,
    },

    /// A command-line argument could not be parsed
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    /// No reply entry for this code
    #[error("unknown reply code {code}")]
    UnknownReply {
        /// Reply code byte
        code: u8,
    },

    /// Reply payload longer than its layout
    #[error("reply '{id}' too long: expected {expected} bytes, got {actual}")]
    OverlongReply {
        /// Reply id
        id: &'static str,
        /// Layout length
        expected: usize,
        /// Payload length
        actual: usize,
    },

    /// Reply payload shorter than its layout
    #[error("reply '{id}' truncated: needed {needed} bytes, got {actual}")]
    TruncatedReply {
        /// Reply id
        id: &'static str,
        /// Minimum layout length
        needed: usize,
        /// Payload length
        actual: usize,
    },

    /// Reply without a code byte
    #[error("empty reply")]
    EmptyReply,
}

/// A command argument or decoded reply field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer field
    Int(i64),
    /// Repeated integer field
    Ints(Vec<i64>),
    /// Raw bytes
    Bytes(Bytes),
}

impl Value {
    /// Integer value, if this is one
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte value, if this is one
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

impl FromStr for Value {
    type Err = CodecError;

    /// `42`, `0x2A` and `-3` are integers, `1,2,3` is a list, `hex:0a0b`
    /// is raw bytes, and anything else is taken as UTF-8 text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("hex:") {
            return parse_hex(hex)
                .map(|b| Value::Bytes(Bytes::from(b)))
                .ok_or_else(|| CodecError::InvalidArgument(s.to_string()));
        }
        if let Some(v) = parse_int(s) {
            return Ok(Value::Int(v));
        }
        if s.contains(',') {
            if let Some(list) = s.split(',').map(parse_int).collect::<Option<Vec<_>>>() {
                return Ok(Value::Ints(list));
            }
        }
        Ok(Value::Bytes(Bytes::copy_from_slice(s.as_bytes())))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Ints(list) => {
                let parts: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Value::Bytes(b) => write!(f, "{}", hex(b)),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Ints(list) => {
                let mut seq = serializer.serialize_seq(Some(list.len()))?;
                for v in list {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            Value::Bytes(b) => serializer.serialize_str(&hex(b)),
        }
    }
}

/// Named command arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    values: HashMap<String, Value>,
}

impl Args {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an integer argument
    pub fn int(mut self, name: impl Into<String>, value: i64) -> Self {
        self.values.insert(name.into(), Value::Int(value));
        self
    }

    /// Add a list argument
    pub fn ints(mut self, name: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        self.values
            .insert(name.into(), Value::Ints(values.into_iter().collect()));
        self
    }

    /// Add a byte argument
    pub fn bytes(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.values.insert(name.into(), Value::Bytes(value.into()));
        self
    }

    /// Set an argument in place
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Look an argument up
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Parse `name=value` pairs, see [`Value::from_str`]
    pub fn parse_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self, CodecError> {
        let mut args = Self::new();
        for pair in pairs {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| CodecError::InvalidArgument(pair.to_string()))?;
            args.set(name.trim(), value.parse()?);
        }
        Ok(args)
    }
}

/// A decoded reply
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Reply {
    /// Logical id, the name of the command it answers
    pub id: &'static str,
    /// Enclosing reply group, for nested replies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<&'static str>,
    /// Decoded fields
    pub fields: BTreeMap<&'static str, Value>,
}

impl Reply {
    /// Field lookup
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Integer field lookup
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    /// Byte field lookup
    pub fn bytes(&self, name: &str) -> Option<&Bytes> {
        self.get(name).and_then(Value::as_bytes)
    }

    /// Whether this is a node error reply
    pub fn is_error(&self) -> bool {
        self.id == "error"
    }
}

/// Build the payload of command `path` from `args`.
///
/// Missing arguments take the table default; a field without one is an error.
pub fn build_command(catalog: &Catalog, path: &str, args: &Args) -> Result<Bytes, CodecError> {
    let (def, prefix) = catalog
        .resolve(path)
        .ok_or_else(|| CodecError::UnknownCommand(path.to_string()))?;

    let mut out = Vec::with_capacity(prefix.len() + 16);
    out.extend_from_slice(&prefix);
    for field in def.fields {
        encode_field(path, field, args.get(field.name), &mut out)?;
    }
    Ok(Bytes::from(out))
}

fn default_value(path: &str, field: &FieldDef) -> Result<Value, CodecError> {
    match field.default {
        FieldDefault::Required => Err(CodecError::MissingField {
            command: path.to_string(),
            field: field.name,
        }),
        FieldDefault::Int(v) => Ok(Value::Int(v)),
        FieldDefault::Empty if field.repeated => Ok(Value::Ints(Vec::new())),
        FieldDefault::Empty => Ok(Value::Bytes(Bytes::new())),
    }
}

fn put_int(field: &FieldDef, value: i64, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let (min, max) = field.encoding.range();
    if value < min || value > max {
        return Err(CodecError::ValueOutOfRange {
            field: field.name,
            value,
        });
    }
    field.encoding.put(value, out);
    Ok(())
}

fn encode_field(
    path: &str,
    field: &FieldDef,
    value: Option<&Value>,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let value = match value {
        Some(v) => v.clone(),
        None => default_value(path, field)?,
    };

    if field.repeated {
        let list = match value {
            Value::Ints(list) => list,
            Value::Int(v) => vec![v],
            Value::Bytes(_) => return Err(CodecError::TypeMismatch { field: field.name }),
        };
        for v in list {
            put_int(field, v, out)?;
        }
        return Ok(());
    }

    match (field.len, field.encoding.width(), value) {
        (FieldLen::Trailing, _, Value::Bytes(b)) => out.extend_from_slice(&b),
        (FieldLen::Fixed(len), None, Value::Bytes(b)) => {
            if b.len() != len {
                return Err(CodecError::LengthMismatch {
                    field: field.name,
                    expected: len,
                    actual: b.len(),
                });
            }
            out.extend_from_slice(&b);
        }
        (FieldLen::Fixed(_), Some(_), Value::Int(v)) => put_int(field, v, out)?,
        _ => return Err(CodecError::TypeMismatch { field: field.name }),
    }
    Ok(())
}

/// Decode a reply payload, code bytes included
pub fn split_response(catalog: &Catalog, payload: &[u8]) -> Result<Reply, CodecError> {
    let mut level = catalog.replies();
    let mut rest = payload;
    let mut group = None;

    loop {
        let (&code, tail) = rest.split_first().ok_or(CodecError::EmptyReply)?;
        let def = level
            .iter()
            .find(|r| r.code == code)
            .ok_or(CodecError::UnknownReply { code })?;

        match def.body {
            ReplyBody::Submenu(sub) => {
                group = Some(def.id);
                level = sub;
                rest = tail;
            }
            ReplyBody::Shapes(shapes) => {
                let shape = select_shape(shapes, tail.len()).ok_or(CodecError::UnknownReply { code })?;
                return decode_shape(shape, group, tail);
            }
        }
    }
}

/// Exact fixed-length match first, then the first open-ended layout, then the first layout
fn select_shape(shapes: &'static [ShapeDef], len: usize) -> Option<&'static ShapeDef> {
    shapes
        .iter()
        .find(|s| s.fixed_len() == Some(len))
        .or_else(|| shapes.iter().find(|s| s.fixed_len().is_none()))
        .or_else(|| shapes.first())
}

fn decode_shape(
    shape: &'static ShapeDef,
    group: Option<&'static str>,
    data: &[u8],
) -> Result<Reply, CodecError> {
    let needed: usize = shape.fields.iter().filter_map(FieldDef::fixed_len).sum();
    if data.len() < needed {
        return Err(CodecError::TruncatedReply {
            id: shape.id,
            needed,
            actual: data.len(),
        });
    }

    let mut fields = BTreeMap::new();
    let mut offset = 0;
    for field in shape.fields {
        let value = match field.len {
            FieldLen::Trailing => {
                let value = Value::Bytes(Bytes::copy_from_slice(&data[offset..]));
                offset = data.len();
                value
            }
            FieldLen::Fixed(len) => {
                let chunk = &data[offset..offset + len];
                offset += len;
                match field.encoding.get(chunk) {
                    Some(v) => Value::Int(v),
                    None => Value::Bytes(Bytes::copy_from_slice(chunk)),
                }
            }
        };
        fields.insert(field.name, value);
    }

    if offset < data.len() {
        return Err(CodecError::OverlongReply {
            id: shape.id,
            expected: offset,
            actual: data.len(),
        });
    }

    for (name, value) in shape.implied {
        fields.insert(*name, Value::Int(*value));
    }

    Ok(Reply {
        id: shape.id,
        group,
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::STANDARD;

    #[test]
    fn test_build_bare_command() {
        let payload = build_command(&STANDARD, "nodeId", &Args::new()).unwrap();
        assert_eq!(payload.as_ref(), &[0x04]);
    }

    #[test]
    fn test_decode_node_id() {
        let reply = split_response(&STANDARD, &[0x05, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(reply.id, "nodeId");
        assert_eq!(reply.group, None);
        assert_eq!(reply.int("serial"), Some(0x1234_5678));
    }

    #[test]
    fn test_build_nested_command() {
        let args = Args::new().int("mask", 1).int("filter", 2).int("slots", 3);
        let payload = build_command(&STANDARD, "discovery/start", &args).unwrap();
        assert_eq!(payload.as_ref(), &[26, 6, 1, 2, 3]);
    }

    #[test]
    fn test_defaults_fill_missing_arguments() {
        let payload = build_command(&STANDARD, "spiflash/getmd5", &Args::new()).unwrap();
        assert_eq!(payload.as_ref(), &[30, 1, 0, 0, 0, 0, 0, 0, 0, 0]);

        let payload = build_command(&STANDARD, "updateChunk", &Args::new()).unwrap();
        assert_eq!(payload.as_ref(), &[STANDARD.resolve("updateChunk").unwrap().0.opcode]);
    }

    #[test]
    fn test_missing_required_argument() {
        let err = build_command(&STANDARD, "discovery/get", &Args::new()).unwrap_err();
        assert_eq!(
            err,
            CodecError::MissingField {
                command: "discovery/get".to_string(),
                field: "index"
            }
        );

        let err = build_command(&STANDARD, "echo", &Args::new()).unwrap_err();
        assert_eq!(
            err,
            CodecError::MissingField {
                command: "echo".to_string(),
                field: "echo"
            }
        );
        let payload = build_command(&STANDARD, "echo", &Args::new().bytes("echo", &b"CIAO"[..])).unwrap();
        assert_eq!(payload.as_ref(), b"\x00CIAO");
    }

    #[test]
    fn test_out_of_range_argument() {
        let args = Args::new().int("index", 256);
        let err = build_command(&STANDARD, "discovery/get", &args).unwrap_err();
        assert!(matches!(err, CodecError::ValueOutOfRange { field: "index", value: 256 }));
    }

    #[test]
    fn test_type_mismatch() {
        let args = Args::new().bytes("index", vec![1u8]);
        let err = build_command(&STANDARD, "discovery/get", &args).unwrap_err();
        assert_eq!(err, CodecError::TypeMismatch { field: "index" });
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            build_command(&STANDARD, "warp", &Args::new()),
            Err(CodecError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_rssicheck_target_is_big_endian() {
        let args = Args::new().int("target", 0x0001_0203);
        let payload = build_command(&STANDARD, "rssicheck/startcheck", &args).unwrap();
        assert_eq!(payload.as_ref(), &[28, 2, 0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_multipath_repeated_path() {
        let args = Args::new()
            .int("target", 0x30)
            .int("pathlen", 2)
            .ints("path", [0x10, 0x20])
            .bytes("payload", vec![0x04u8]);
        let payload = build_command(&STANDARD, "multipath", &args).unwrap();
        assert_eq!(
            payload.as_ref(),
            &[118, 0x30, 0, 0, 0, 2, 0x10, 0, 0, 0, 0x20, 0, 0, 0, 0x04]
        );
    }

    #[test]
    fn test_unicast_envelope() {
        let args = Args::new().int("target", 0x0A0B0C).bytes("payload", vec![0x02u8]);
        let payload = build_command(&STANDARD, "unicast", &args).unwrap();
        assert_eq!(payload.as_ref(), &[114, 0x0C, 0x0B, 0x0A, 0x00, 0x02]);
    }

    #[test]
    fn test_entity_count_shapes_by_length() {
        let reply = split_response(&STANDARD, &[39, 5, 1, 1, 2, 1]).unwrap();
        assert_eq!(reply.id, "serviceEntitiesCount");
        assert_eq!(reply.int("lights"), Some(1));
        assert!(reply.get("texts").is_none());

        let reply = split_response(&STANDARD, &[39, 6, 1, 1, 2, 1, 1]).unwrap();
        assert_eq!(reply.int("texts"), Some(1));
    }

    #[test]
    fn test_entity_state_fixed_and_trailing() {
        let reply = split_response(&STANDARD, &[43, 0xFE, 0xFF]).unwrap();
        assert_eq!(reply.int("value"), Some(-2));

        let reply = split_response(&STANDARD, &[43, 3, b'o', b'n', b'!']).unwrap();
        assert_eq!(reply.int("type"), Some(3));
        assert_eq!(reply.bytes("value").unwrap().as_ref(), b"on!");
    }

    #[test]
    fn test_discovery_get_short_form_implies_rssi2() {
        let full = [27, 5, 2, 0x01, 0x02, 0x03, 0x00, 0xF6, 0xFF, 0xF5, 0xFF, 0x01, 0x00];
        let reply = split_response(&STANDARD, &full).unwrap();
        assert_eq!(reply.group, Some("discovery"));
        assert_eq!(reply.id, "get");
        assert_eq!(reply.int("rssi1"), Some(-10));
        assert_eq!(reply.int("rssi2"), Some(-11));

        let short = [27, 5, 2, 0x01, 0x02, 0x03, 0x00, 0xF6, 0xFF, 0x01, 0x00];
        let reply = split_response(&STANDARD, &short).unwrap();
        assert_eq!(reply.int("serial"), Some(0x030201));
        assert_eq!(reply.int("rssi2"), Some(-1));
        assert_eq!(reply.int("flags"), Some(1));
    }

    #[test]
    fn test_spiflash_reply_echoes_opcode() {
        let mut payload = vec![31, 1, 1];
        payload.extend_from_slice(&[0xAB; 16]);
        let reply = split_response(&STANDARD, &payload).unwrap();
        assert_eq!(reply.group, Some("spiflash"));
        assert_eq!(reply.id, "getmd5");
        assert_eq!(reply.int("erased"), Some(1));
        assert_eq!(reply.bytes("md5").unwrap().len(), 16);
    }

    #[test]
    fn test_overlong_reply() {
        let err = split_response(&STANDARD, &[0x05, 1, 2, 3, 4, 5]).unwrap_err();
        assert_eq!(
            err,
            CodecError::OverlongReply {
                id: "nodeId",
                expected: 4,
                actual: 5
            }
        );
    }

    #[test]
    fn test_truncated_reply() {
        let err = split_response(&STANDARD, &[0x05, 1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedReply { id: "nodeId", needed: 4, actual: 2 }));
    }

    #[test]
    fn test_unknown_and_empty_reply() {
        assert_eq!(
            split_response(&STANDARD, &[0x64]),
            Err(CodecError::UnknownReply { code: 0x64 })
        );
        assert_eq!(split_response(&STANDARD, &[]), Err(CodecError::EmptyReply));
        assert_eq!(split_response(&STANDARD, &[27]), Err(CodecError::EmptyReply));
    }

    #[test]
    fn test_error_reply() {
        let reply = split_response(&STANDARD, &[127, 0x02]).unwrap();
        assert!(reply.is_error());
        assert_eq!(reply.bytes("data").unwrap().as_ref(), &[0x02]);
    }

    #[test]
    fn test_parse_pairs() {
        let args = Args::parse_pairs(["target=0x10", "path=1,2", "payload=hex:0a0b", "tag=kitchen"])
            .unwrap();
        assert_eq!(args.get("target"), Some(&Value::Int(16)));
        assert_eq!(args.get("path"), Some(&Value::Ints(vec![1, 2])));
        assert_eq!(args.get("payload"), Some(&Value::Bytes(Bytes::from_static(&[10, 11]))));
        assert_eq!(args.get("tag"), Some(&Value::Bytes(Bytes::from_static(b"kitchen"))));
        assert!(Args::parse_pairs(["novalue"]).is_err());
    }

    #[test]
    fn test_reply_serializes_bytes_as_hex() {
        let reply = split_response(&STANDARD, &[3, b'1', b'.', b'2']).unwrap();
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(json, r#"{"id":"firm","fields":{"revision":"312e32"}}"#);
    }
}
