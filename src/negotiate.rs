//! Codec negotiation.
//!
//! For each side of a store (keys and values) the negotiator settles on one
//! codec and makes sure it matches what the store records, or records it when
//! the store is new. A store's codecs never change once recorded.

use serde::{Deserialize, Serialize};

use crate::capsule::{portable, Capsule, Portable, Serializers};
use crate::codec::{Builtin, Codec, CodecRequest, CodecSpec};
use crate::config::Mode;
use crate::error::{Error, Result};

/// Access to the reserved metadata records of a store.
pub(crate) trait MetaStore {
    /// Reads a reserved record.
    fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Writes a reserved record.
    fn put_meta(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
}

/// Which side of an entry a codec applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Key,
    Value,
}

impl Side {
    /// Reserved record names of the (dumps, loads) descriptors.
    pub(crate) fn records(self) -> (&'static [u8], &'static [u8]) {
        match self {
            Side::Key => (b"__key_dumps__", b"__key_loads__"),
            Side::Value => (b"__value_dumps__", b"__value_loads__"),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Side::Key => "key",
            Side::Value => "value",
        }
    }
}

/// Persisted form of one half of a codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Descriptor {
    Default,
    Builtin(String),
    Plain(String),
    Capsule(Vec<u8>),
}

impl Descriptor {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::corruption(format!("unreadable codec descriptor: {}", e)))
    }
}

/// The agreed codec of one side.
pub(crate) struct Negotiated {
    pub codec: Codec,
    /// True if descriptors were written and still need a commit.
    pub persisted: bool,
}

/// A validated request: both halves name the same scheme.
enum Scheme {
    Default,
    Builtin(Builtin),
    Custom { dumps: Portable, loads: Portable },
}

/// Settles the codec of `side`.
///
/// # Errors
///
/// - Usage: ambiguous or mismatched request, an explicit request against a
///   store that already records its codec, or an explicit request in read
///   mode on a store without one.
/// - Codec: the requested or recorded codec cannot be used in this process.
/// - Corruption: only one of the two descriptor records exists.
pub(crate) fn negotiate<M: MetaStore>(
    meta: &mut M,
    side: Side,
    request: &CodecRequest,
    mode: Mode,
    serializers: &Serializers,
) -> Result<Negotiated> {
    let scheme = validate(side, request)?;
    let (dumps_record, loads_record) = side.records();

    match (meta.get_meta(dumps_record)?, meta.get_meta(loads_record)?) {
        (Some(dumps), Some(loads)) => {
            if scheme.is_some() {
                return Err(Error::usage(format!(
                    "{} codec already fixed by this store, pass no codec to reopen it",
                    side.label()
                )));
            }
            let codec = restore(side, Descriptor::decode(&dumps)?, Descriptor::decode(&loads)?, serializers)?;
            log::debug!("Reusing recorded {} codec {:?}", side.label(), codec);
            Ok(Negotiated { codec, persisted: false })
        }
        (None, None) => match mode {
            Mode::Write => {
                let scheme = scheme.unwrap_or(Scheme::Default);
                let (dumps, loads) = describe(&scheme, serializers)?;
                meta.put_meta(dumps_record, &dumps.encode()?)?;
                meta.put_meta(loads_record, &loads.encode()?)?;
                let codec = resolve(scheme)?;
                log::debug!("Recorded {} codec {:?}", side.label(), codec);
                Ok(Negotiated { codec, persisted: true })
            }
            Mode::Read => {
                if scheme.is_some() {
                    return Err(Error::usage(format!(
                        "cannot set a {} codec in read mode",
                        side.label()
                    )));
                }
                log::debug!("No {} codec recorded, using the default serializer", side.label());
                Ok(Negotiated { codec: Codec::default_serializer(), persisted: false })
            }
        },
        _ => Err(Error::corruption(format!(
            "only one of the {} codec records is present",
            side.label()
        ))),
    }
}

/// Checks that both halves of a request name the same scheme.
fn validate(side: Side, request: &CodecRequest) -> Result<Option<Scheme>> {
    let scheme = match request.split()? {
        (None, None) => None,
        (Some(CodecSpec::Named(dumps)), Some(CodecSpec::Named(loads))) => {
            if dumps != loads {
                return Err(Error::usage(format!(
                    "{} dumps and loads must be the same codec, got {:?} and {:?}",
                    side.label(),
                    dumps,
                    loads
                )));
            }
            Some(Scheme::Builtin(Builtin::from_name(&dumps)?))
        }
        (Some(CodecSpec::Function(dumps)), Some(CodecSpec::Function(loads))) => {
            Some(Scheme::Custom { dumps: portable(dumps), loads: portable(loads) })
        }
        (dumps, loads) => {
            return Err(Error::usage(format!(
                "{} dumps and loads must both be set to the same kind of codec, got {} and {}",
                side.label(),
                spec_kind(dumps.as_ref()),
                spec_kind(loads.as_ref())
            )))
        }
    };
    Ok(scheme)
}

fn spec_kind(spec: Option<&CodecSpec>) -> &'static str {
    match spec {
        None => "nothing",
        Some(CodecSpec::Named(_)) => "a codec name",
        Some(CodecSpec::Function(_)) => "a function",
    }
}

/// Builds the descriptors for a new store, refusing functions that could not
/// be rebuilt from them.
fn describe(scheme: &Scheme, serializers: &Serializers) -> Result<(Descriptor, Descriptor)> {
    match scheme {
        Scheme::Default => Ok((Descriptor::Default, Descriptor::Default)),
        Scheme::Builtin(kind) => {
            // fail before anything is written
            kind.functions()?;
            let name = kind.name().to_string();
            Ok((Descriptor::Builtin(name.clone()), Descriptor::Builtin(name)))
        }
        Scheme::Custom { dumps, loads } => {
            Ok((describe_function(dumps, serializers)?, describe_function(loads, serializers)?))
        }
    }
}

fn describe_function(f: &Portable, serializers: &Serializers) -> Result<Descriptor> {
    match f {
        Portable::Plain(f) => {
            let name = f.name().unwrap_or_default();
            if !serializers.registry().contains(name) {
                return Err(Error::codec(format!(
                    "function {} is not in the store's function registry",
                    name
                )));
            }
            Ok(Descriptor::Plain(name.to_string()))
        }
        Portable::Wrapped(capsule) => {
            let bytes = capsule.to_bytes(serializers);
            Capsule::from_bytes(&bytes, serializers)?;
            Ok(Descriptor::Capsule(bytes))
        }
    }
}

fn resolve(scheme: Scheme) -> Result<Codec> {
    match scheme {
        Scheme::Default => Ok(Codec::default_serializer()),
        Scheme::Builtin(kind) => Codec::builtin(kind),
        Scheme::Custom { dumps, loads } => Ok(Codec::Custom { dumps, loads }),
    }
}

/// Rebuilds a recorded codec.
fn restore(side: Side, dumps: Descriptor, loads: Descriptor, serializers: &Serializers) -> Result<Codec> {
    match (dumps, loads) {
        (Descriptor::Default, Descriptor::Default) => Ok(Codec::default_serializer()),
        (Descriptor::Builtin(dumps), Descriptor::Builtin(loads)) if dumps == loads => {
            Codec::builtin(Builtin::from_name(&dumps)?)
        }
        (dumps @ (Descriptor::Plain(_) | Descriptor::Capsule(_)), loads @ (Descriptor::Plain(_) | Descriptor::Capsule(_))) => {
            Ok(Codec::Custom {
                dumps: restore_function(dumps, serializers)?,
                loads: restore_function(loads, serializers)?,
            })
        }
        (dumps, loads) => Err(Error::corruption(format!(
            "recorded {} codec halves disagree: {:?} and {:?}",
            side.label(),
            dumps,
            loads
        ))),
    }
}

fn restore_function(descriptor: Descriptor, serializers: &Serializers) -> Result<Portable> {
    let f = match descriptor {
        Descriptor::Plain(name) => serializers.registry().lookup(&name).ok_or_else(|| {
            Error::codec(format!("cannot reconstruct function: {} is not registered", name))
        })?,
        Descriptor::Capsule(bytes) => Capsule::from_bytes(&bytes, serializers)?.into_inner(),
        other => return Err(Error::corruption(format!("{:?} is not a function descriptor", other))),
    };
    // re-wrapped so the codec can be handed on to yet another process
    Ok(portable(f))
}
