//! Codec catalog and codec requests.
//!
//! A codec turns a [`Value`] into the byte string the engine stores and back.
//! The built-in codecs form a closed set ([`Builtin`]); anything else is a
//! custom pair of [`Function`]s.

use std::fmt;
use std::str::FromStr;

use crate::capsule::{Function, Portable};
use crate::error::{Error, Result};
use crate::value::Value;

/// Encoding half of a built-in codec.
pub type DumpsFn = fn(&Value) -> Result<Vec<u8>>;

/// Decoding half of a built-in codec.
pub type LoadsFn = fn(&[u8]) -> Result<Value>;

/// The built-in codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// Bytes pass through untouched. Only for byte-string inputs.
    Identity,
    /// Text encoded as ASCII.
    Ascii,
    /// Text encoded as UTF-8.
    Utf8,
    /// bincode of the whole [`Value`]. The default.
    Bincode,
    /// JSON of the whole [`Value`], readable from other languages.
    Json,
    /// bincode compressed with Snappy.
    Snappy,
    /// bincode compressed with LZ4.
    Lz4,
}

impl Builtin {
    /// Every built-in codec.
    pub const ALL: [Builtin; 7] = [
        Builtin::Identity,
        Builtin::Ascii,
        Builtin::Utf8,
        Builtin::Bincode,
        Builtin::Json,
        Builtin::Snappy,
        Builtin::Lz4,
    ];

    /// The persisted name of the codec.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Identity => "identity",
            Builtin::Ascii => "ascii",
            Builtin::Utf8 => "utf8",
            Builtin::Bincode => "bincode",
            Builtin::Json => "json",
            Builtin::Snappy => "snappy",
            Builtin::Lz4 => "lz4",
        }
    }

    /// Looks a codec up by name.
    pub fn from_name(name: &str) -> Result<Self> {
        Builtin::ALL
            .into_iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| Error::UnknownCodec(name.to_string()))
    }

    /// Returns true if the codec was compiled in.
    pub fn is_available(self) -> bool {
        match self {
            Builtin::Json => cfg!(feature = "json"),
            Builtin::Snappy => cfg!(feature = "snappy"),
            Builtin::Lz4 => cfg!(feature = "lz4-compression"),
            _ => true,
        }
    }

    /// Resolves the codec into its function pair.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the codec's library was not compiled in.
    pub fn functions(self) -> Result<(DumpsFn, LoadsFn)> {
        match self {
            Builtin::Identity => Ok((identity_dumps, identity_loads)),
            Builtin::Ascii => Ok((ascii_dumps, ascii_loads)),
            Builtin::Utf8 => Ok((utf8_dumps, utf8_loads)),
            Builtin::Bincode => Ok((bincode_dumps, bincode_loads)),
            #[cfg(feature = "json")]
            Builtin::Json => Ok((json::dumps, json::loads)),
            #[cfg(feature = "snappy")]
            Builtin::Snappy => Ok((snappy::dumps, snappy::loads)),
            #[cfg(feature = "lz4-compression")]
            Builtin::Lz4 => Ok((lz4::dumps, lz4::loads)),
            #[allow(unreachable_patterns)]
            other => Err(Error::codec(format!("{} codec not available in this build", other))),
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Builtin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Builtin::from_name(s)
    }
}

/// Resolves a built-in codec name into its function pair.
pub fn resolve(name: &str) -> Result<(DumpsFn, LoadsFn)> {
    Builtin::from_name(name)?.functions()
}

fn identity_dumps(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        other => Err(Error::codec(format!("identity codec needs bytes, got {}", other.type_name()))),
    }
}

fn identity_loads(data: &[u8]) -> Result<Value> {
    Ok(Value::Bytes(data.to_vec()))
}

fn ascii_dumps(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Str(s) if s.is_ascii() => Ok(s.as_bytes().to_vec()),
        Value::Str(s) => Err(Error::codec(format!("{:?} is not ASCII", s))),
        other => Err(Error::codec(format!("ascii codec needs text, got {}", other.type_name()))),
    }
}

fn ascii_loads(data: &[u8]) -> Result<Value> {
    if !data.is_ascii() {
        return Err(Error::codec("stored bytes are not ASCII"));
    }
    utf8_loads(data)
}

fn utf8_dumps(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::Str(s) => Ok(s.as_bytes().to_vec()),
        other => Err(Error::codec(format!("utf8 codec needs text, got {}", other.type_name()))),
    }
}

fn utf8_loads(data: &[u8]) -> Result<Value> {
    String::from_utf8(data.to_vec())
        .map(Value::Str)
        .map_err(|e| Error::codec(format!("stored bytes are not UTF-8: {}", e)))
}

fn bincode_dumps(value: &Value) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn bincode_loads(data: &[u8]) -> Result<Value> {
    Ok(bincode::deserialize(data)?)
}

#[cfg(feature = "json")]
mod json {
    use super::*;

    pub(super) fn dumps(value: &Value) -> Result<Vec<u8>> {
        // serde_json writes NaN and infinities as null
        if !all_finite(value) {
            return Err(Error::codec("json codec cannot encode non-finite floats"));
        }
        Ok(serde_json::to_vec(value)?)
    }

    fn all_finite(value: &Value) -> bool {
        match value {
            Value::Float(f) => f.is_finite(),
            Value::Array(values) => values.iter().all(|f| f.is_finite()),
            Value::List(items) => items.iter().all(all_finite),
            _ => true,
        }
    }

    pub(super) fn loads(data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(feature = "snappy")]
mod snappy {
    use super::*;

    pub(super) fn dumps(value: &Value) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(&bincode_dumps(value)?)
            .map_err(|e| Error::codec(format!("Compression failed: {}", e)))
    }

    pub(super) fn loads(data: &[u8]) -> Result<Value> {
        let raw = snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::codec(format!("Decompression failed: {}", e)))?;
        bincode_loads(&raw)
    }
}

#[cfg(feature = "lz4-compression")]
mod lz4 {
    use super::*;

    pub(super) fn dumps(value: &Value) -> Result<Vec<u8>> {
        ::lz4::block::compress(&bincode_dumps(value)?, None, true)
            .map_err(|e| Error::codec(format!("Compression failed: {}", e)))
    }

    pub(super) fn loads(data: &[u8]) -> Result<Value> {
        let raw = ::lz4::block::decompress(data, None)
            .map_err(|e| Error::codec(format!("Decompression failed: {}", e)))?;
        bincode_loads(&raw)
    }
}

/// A resolved codec.
#[derive(Clone)]
pub enum Codec {
    /// A built-in codec, resolved to its function pair.
    Builtin {
        /// Which codec.
        kind: Builtin,
        /// Encoder.
        dumps: DumpsFn,
        /// Decoder.
        loads: LoadsFn,
    },
    /// A custom function pair.
    Custom {
        /// Encoder: takes the value, returns bytes (or text).
        dumps: Portable,
        /// Decoder: takes the stored bytes, returns the value.
        loads: Portable,
    },
}

impl Codec {
    /// Resolves a built-in codec.
    pub fn builtin(kind: Builtin) -> Result<Self> {
        let (dumps, loads) = kind.functions()?;
        Ok(Codec::Builtin { kind, dumps, loads })
    }

    /// The general-purpose serializer used when no codec is requested.
    pub fn default_serializer() -> Self {
        Codec::Builtin { kind: Builtin::Bincode, dumps: bincode_dumps, loads: bincode_loads }
    }

    /// Encodes a value.
    pub fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        match self {
            Codec::Builtin { dumps, .. } => dumps(value),
            Codec::Custom { dumps, .. } => {
                let out = dumps.call(value.clone())?;
                let kind = out.type_name();
                out.into_payload()
                    .ok_or_else(|| Error::codec(format!("dumps function returned {}, not bytes", kind)))
            }
        }
    }

    /// Decodes a stored payload.
    pub fn loads(&self, data: &[u8]) -> Result<Value> {
        match self {
            Codec::Builtin { loads, .. } => loads(data),
            Codec::Custom { loads, .. } => loads.call(Value::Bytes(data.to_vec())),
        }
    }

    /// The built-in codec, if this is one.
    pub fn builtin_kind(&self) -> Option<Builtin> {
        match self {
            Codec::Builtin { kind, .. } => Some(*kind),
            Codec::Custom { .. } => None,
        }
    }

    /// Returns true for a custom function pair.
    pub fn is_custom(&self) -> bool {
        matches!(self, Codec::Custom { .. })
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Builtin { kind, .. } => f.debug_tuple("Builtin").field(kind).finish(),
            Codec::Custom { dumps, loads } => f
                .debug_struct("Custom")
                .field("dumps", dumps.function())
                .field("loads", loads.function())
                .finish(),
        }
    }
}

/// The resolved key and value codecs of a store. Fixed once negotiated.
#[derive(Debug, Clone)]
pub struct Codecs {
    /// Codec applied to keys.
    pub key_codec: Codec,
    /// Codec applied to values.
    pub value_codec: Codec,
}

/// One side of a codec request.
#[derive(Debug, Clone)]
pub enum CodecSpec {
    /// A built-in codec by name.
    Named(String),
    /// A custom function.
    Function(Function),
}

impl From<Builtin> for CodecSpec {
    fn from(b: Builtin) -> Self {
        CodecSpec::Named(b.name().to_string())
    }
}

impl From<&str> for CodecSpec {
    fn from(name: &str) -> Self {
        CodecSpec::Named(name.to_string())
    }
}

impl From<String> for CodecSpec {
    fn from(name: String) -> Self {
        CodecSpec::Named(name)
    }
}

impl From<Function> for CodecSpec {
    fn from(f: Function) -> Self {
        CodecSpec::Function(f)
    }
}

/// What the caller asks for on one side (keys or values) of a store.
///
/// Either a single `method` standing for both directions, or an explicit
/// `dumps`/`loads` pair. Leaving everything unset accepts whatever the store
/// already records, or the default serializer for a new store.
#[derive(Debug, Clone, Default)]
pub struct CodecRequest {
    /// Codec used for both directions.
    pub method: Option<CodecSpec>,
    /// Encoder.
    pub dumps: Option<CodecSpec>,
    /// Decoder.
    pub loads: Option<CodecSpec>,
}

impl CodecRequest {
    /// An unset request.
    pub fn new() -> Self {
        Self::default()
    }

    /// A request for one codec in both directions.
    pub fn method(spec: impl Into<CodecSpec>) -> Self {
        Self { method: Some(spec.into()), ..Self::default() }
    }

    /// A request for an explicit encoder/decoder pair.
    pub fn pair(dumps: impl Into<CodecSpec>, loads: impl Into<CodecSpec>) -> Self {
        Self { method: None, dumps: Some(dumps.into()), loads: Some(loads.into()) }
    }

    /// Returns true if nothing was requested.
    pub fn is_unset(&self) -> bool {
        self.method.is_none() && self.dumps.is_none() && self.loads.is_none()
    }

    /// Splits the request into its dumps and loads halves.
    ///
    /// # Errors
    ///
    /// Returns a usage error if `method` is combined with `dumps` or `loads`.
    pub fn split(&self) -> Result<(Option<CodecSpec>, Option<CodecSpec>)> {
        match &self.method {
            Some(_) if self.dumps.is_some() || self.loads.is_some() => Err(Error::usage(
                "a codec method cannot be combined with explicit dumps/loads",
            )),
            Some(method) => Ok((Some(method.clone()), Some(method.clone()))),
            None => Ok((self.dumps.clone(), self.loads.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(kind: Builtin, value: Value) -> Value {
        let codec = Codec::builtin(kind).unwrap();
        let encoded = codec.dumps(&value).unwrap();
        codec.loads(&encoded).unwrap()
    }

    #[test]
    fn test_names_are_unique() {
        for b in Builtin::ALL {
            assert_eq!(Builtin::from_name(b.name()).unwrap(), b);
            assert_eq!(b.to_string().parse::<Builtin>().unwrap(), b);
        }
    }

    #[test]
    fn test_unknown_name() {
        assert!(matches!(Builtin::from_name("pickle"), Err(Error::UnknownCodec(_))));
        assert!(resolve("zstd").is_err());
    }

    #[test]
    fn test_identity() {
        assert_eq!(roundtrip(Builtin::Identity, Value::from(b"raw")), Value::from(b"raw"));
        let codec = Codec::builtin(Builtin::Identity).unwrap();
        assert_eq!(codec.dumps(&Value::from(b"abc")).unwrap(), b"abc");
        assert!(codec.dumps(&Value::from("text")).unwrap_err().is_codec());
    }

    #[test]
    fn test_ascii() {
        assert_eq!(roundtrip(Builtin::Ascii, Value::from("key")), Value::from("key"));
        let codec = Codec::builtin(Builtin::Ascii).unwrap();
        assert!(codec.dumps(&Value::from("健")).is_err());
        assert!(codec.loads(&[0xc3, 0xa9]).is_err());
        assert!(codec.dumps(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_utf8() {
        assert_eq!(roundtrip(Builtin::Utf8, Value::from("健")), Value::from("健"));
        let codec = Codec::builtin(Builtin::Utf8).unwrap();
        assert!(codec.loads(&[0xff]).is_err());
    }

    #[test]
    fn test_bincode_handles_everything() {
        let value = Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-5),
            Value::Float(0.5),
            Value::from("s"),
            Value::from(b"b"),
            Value::Array(vec![1.0, 2.0]),
        ]);
        assert_eq!(roundtrip(Builtin::Bincode, value.clone()), value);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_numeric_array() {
        let value = Value::Array(vec![0.0, 1.5, -2.25]);
        assert_eq!(roundtrip(Builtin::Json, value.clone()), value);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_rejects_non_finite() {
        let codec = Codec::builtin(Builtin::Json).unwrap();
        for bad in [
            Value::Float(f64::NAN),
            Value::Float(f64::INFINITY),
            Value::Array(vec![1.0, f64::NAN]),
            Value::Array(vec![f64::NEG_INFINITY]),
            Value::List(vec![Value::Int(1), Value::Float(f64::NAN)]),
        ] {
            assert!(codec.dumps(&bad).unwrap_err().is_codec(), "{:?}", bad);
        }
        assert!(codec.dumps(&Value::Float(f64::MAX)).is_ok());
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_snappy() {
        let value = Value::from("a".repeat(1000));
        let codec = Codec::builtin(Builtin::Snappy).unwrap();
        let encoded = codec.dumps(&value).unwrap();
        assert!(encoded.len() < 1000);
        assert_eq!(codec.loads(&encoded).unwrap(), value);
    }

    #[cfg(not(feature = "lz4-compression"))]
    #[test]
    fn test_unavailable_codec() {
        assert!(!Builtin::Lz4.is_available());
        assert!(Codec::builtin(Builtin::Lz4).unwrap_err().is_codec());
    }

    #[test]
    fn test_custom_codec() {
        let codec = Codec::Custom {
            dumps: crate::capsule::portable(
                Function::lua("function(x) return 'v:' .. tostring(x) end").unwrap(),
            ),
            loads: crate::capsule::portable(
                Function::lua("function(b) return tonumber(string.sub(b, 3)) end").unwrap(),
            ),
        };
        let encoded = codec.dumps(&Value::Int(12)).unwrap();
        assert_eq!(encoded, b"v:12");
        assert_eq!(codec.loads(&encoded).unwrap(), Value::Int(12));
        assert!(codec.is_custom());
        assert_eq!(codec.builtin_kind(), None);
    }

    #[test]
    fn test_request_split() {
        let (d, l) = CodecRequest::method(Builtin::Ascii).split().unwrap();
        assert!(matches!(d, Some(CodecSpec::Named(ref n)) if n == "ascii"));
        assert!(matches!(l, Some(CodecSpec::Named(ref n)) if n == "ascii"));

        let conflicting = CodecRequest {
            method: Some("ascii".into()),
            dumps: None,
            loads: Some("ascii".into()),
        };
        assert!(conflicting.split().unwrap_err().is_usage());
        assert!(CodecRequest::new().is_unset());
    }
}
