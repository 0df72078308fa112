//! Portable functions for custom codecs.
//!
//! A custom codec is a pair of functions, and the store persists them next to
//! the data so a later reader can rebuild them. Two serializers are available
//! for that:
//!
//! - **Plain**: a [`FunctionRegistry`] name. Cheap, but only works for native
//!   functions the reading process has registered under the same name.
//! - **Rich**: the Lua source of a script function. Captures closures, but
//!   needs a Lua runtime on the reading side.
//!
//! A [`Capsule`] writes both payloads when it can and, on the way back, tries
//! the rich payload first and falls back to the plain one. [`portable`] only
//! wraps a function in a capsule when the plain serializer alone is not
//! enough.
//!
//! # Wire Format
//!
//! ```text
//! [crc32: u32][flags: u8][rich_len: u32][rich][plain_len: u32][plain]
//! ```
//!
//! Integers are little endian. `flags` bit 0 marks a rich payload, bit 1 a
//! plain one; an absent payload has length 0. The checksum covers every byte
//! after itself.

mod registry;
mod script;

pub use registry::FunctionRegistry;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::value::Value;
use script::ScriptFn;

/// A native function body.
pub type NativeFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

const FLAG_RICH: u8 = 0b01;
const FLAG_PLAIN: u8 = 0b10;
const HEADER_SIZE: usize = 5;

/// A callable taking and returning a [`Value`].
#[derive(Clone)]
pub struct Function {
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Native { name: String, f: NativeFn },
    Script(Arc<ScriptFn>),
}

impl Function {
    /// Compiles a Lua chunk that evaluates to a function.
    ///
    /// # Example
    ///
    /// ```rust
    /// use redbdict::capsule::Function;
    /// use redbdict::Value;
    ///
    /// # fn main() -> Result<(), redbdict::Error> {
    /// let shout = Function::lua("function(s) return string.upper(s) end")?;
    /// assert_eq!(shout.call(Value::from("hi"))?, Value::from("HI"));
    /// # Ok(())
    /// # }
    /// ```
    pub fn lua(source: impl Into<String>) -> Result<Self> {
        Ok(Self { kind: Kind::Script(Arc::new(ScriptFn::compile(source)?)) })
    }

    pub(crate) fn native(name: String, f: NativeFn) -> Self {
        Self { kind: Kind::Native { name, f } }
    }

    /// Invokes the function.
    pub fn call(&self, arg: Value) -> Result<Value> {
        match &self.kind {
            Kind::Native { f, .. } => f(arg),
            Kind::Script(script) => script.call(arg),
        }
    }

    /// The registry name of a native function.
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            Kind::Native { name, .. } => Some(name),
            Kind::Script(_) => None,
        }
    }

    /// The Lua source of a script function.
    pub fn source(&self) -> Option<&str> {
        match &self.kind {
            Kind::Native { .. } => None,
            Kind::Script(script) => Some(script.source()),
        }
    }

    /// Returns true if the plain serializer can carry this function.
    pub fn is_plain(&self) -> bool {
        matches!(self.kind, Kind::Native { .. })
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Native { name, .. } => f.debug_tuple("Native").field(name).finish(),
            Kind::Script(script) => f.debug_tuple("Script").field(&script.source()).finish(),
        }
    }
}

/// The serializers available in the current process.
#[derive(Debug, Clone)]
pub struct Serializers {
    registry: FunctionRegistry,
    rich: bool,
}

impl Default for Serializers {
    fn default() -> Self {
        Self::new(FunctionRegistry::new())
    }
}

impl Serializers {
    /// Both serializers, resolving plain payloads through `registry`.
    pub fn new(registry: FunctionRegistry) -> Self {
        Self { registry, rich: true }
    }

    /// Only the plain serializer.
    pub fn plain_only(registry: FunctionRegistry) -> Self {
        Self { registry, rich: false }
    }

    /// Enables or disables the rich serializer.
    pub fn with_rich(mut self, rich: bool) -> Self {
        self.rich = rich;
        self
    }

    /// Returns true if rich payloads may be written and read.
    pub fn rich_enabled(&self) -> bool {
        self.rich
    }

    /// The registry backing plain payloads.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }
}

/// A function wrapped for persistence.
///
/// Derefs to the wrapped [`Function`], so a capsule can be called wherever the
/// function could.
#[derive(Debug, Clone)]
pub struct Capsule {
    inner: Function,
}

impl Capsule {
    /// Wraps a function.
    pub fn new(inner: Function) -> Self {
        Self { inner }
    }

    /// Unwraps the function.
    pub fn into_inner(self) -> Function {
        self.inner
    }

    /// Encodes both payloads, each on a best-effort basis.
    ///
    /// A capsule whose function neither serializer can carry still encodes;
    /// it just cannot be rebuilt, which [`Capsule::from_bytes`] reports.
    pub fn to_bytes(&self, serializers: &Serializers) -> Vec<u8> {
        let rich = match self.inner.source() {
            Some(source) if serializers.rich_enabled() => Some(source.as_bytes()),
            _ => None,
        };
        let plain = self.inner.name().map(str::as_bytes);

        if rich.is_none() && plain.is_none() {
            log::warn!("Capsule for {:?} has no usable payload", self.inner);
        }

        let mut flags = 0u8;
        if rich.is_some() {
            flags |= FLAG_RICH;
        }
        if plain.is_some() {
            flags |= FLAG_PLAIN;
        }

        let rich = rich.unwrap_or_default();
        let plain = plain.unwrap_or_default();
        let mut body = Vec::with_capacity(1 + 8 + rich.len() + plain.len());
        body.put_u8(flags);
        body.put_u32_le(rich.len() as u32);
        body.put_slice(rich);
        body.put_u32_le(plain.len() as u32);
        body.put_slice(plain);

        let mut out = Vec::with_capacity(4 + body.len());
        out.put_u32_le(crc32fast::hash(&body));
        out.put_slice(&body);
        out
    }

    /// Rebuilds a capsule: rich payload first when the rich serializer is
    /// enabled, then the plain payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes are damaged or if neither payload
    /// is usable in this process.
    pub fn from_bytes(data: &[u8], serializers: &Serializers) -> Result<Self> {
        let (rich, plain) = decode_slots(data)?;

        if serializers.rich_enabled() {
            if let Some(source) = rich {
                let source = std::str::from_utf8(source)
                    .map_err(|e| Error::codec(format!("rich payload is not UTF-8: {}", e)))?;
                return Ok(Self::new(Function::lua(source)?));
            }
        }

        if let Some(name) = plain {
            let name = std::str::from_utf8(name)
                .map_err(|e| Error::codec(format!("plain payload is not UTF-8: {}", e)))?;
            if let Some(f) = serializers.registry().lookup(name) {
                return Ok(Self::new(f));
            }
            log::debug!("Function {} is not registered in this process", name);
        }

        Err(Error::codec("cannot reconstruct function: no usable payload"))
    }
}

impl Deref for Capsule {
    type Target = Function;

    fn deref(&self) -> &Function {
        &self.inner
    }
}

fn decode_slots(mut data: &[u8]) -> Result<(Option<&[u8]>, Option<&[u8]>)> {
    if data.len() < 4 + HEADER_SIZE {
        return Err(Error::codec(format!("capsule too short: {} bytes", data.len())));
    }
    let checksum = data.get_u32_le();
    let actual = crc32fast::hash(data);
    if checksum != actual {
        return Err(Error::codec(format!(
            "capsule checksum mismatch: expected {:#x}, got {:#x}",
            checksum, actual
        )));
    }

    let flags = data.get_u8();
    let rich = take_slot(&mut data)?;
    if data.remaining() < 4 {
        return Err(Error::codec("capsule truncated before plain payload"));
    }
    let plain = take_slot(&mut data)?;

    Ok((
        (flags & FLAG_RICH != 0).then_some(rich),
        (flags & FLAG_PLAIN != 0).then_some(plain),
    ))
}

fn take_slot<'a>(data: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = data.get_u32_le() as usize;
    if data.len() < len {
        return Err(Error::codec(format!(
            "capsule payload truncated: expected {} bytes, got {}",
            len,
            data.len()
        )));
    }
    let (slot, rest) = data.split_at(len);
    *data = rest;
    Ok(slot)
}

/// A function ready for persistence: as-is when the plain serializer can
/// carry it, wrapped in a [`Capsule`] otherwise.
#[derive(Debug, Clone)]
pub enum Portable {
    /// A registered native function.
    Plain(Function),
    /// Anything else.
    Wrapped(Capsule),
}

impl Portable {
    /// Invokes the underlying function.
    pub fn call(&self, arg: Value) -> Result<Value> {
        self.function().call(arg)
    }

    /// The underlying function.
    pub fn function(&self) -> &Function {
        match self {
            Portable::Plain(f) => f,
            Portable::Wrapped(capsule) => &capsule.inner,
        }
    }
}

impl Deref for Portable {
    type Target = Function;

    fn deref(&self) -> &Function {
        self.function()
    }
}

/// Leaves plain-serializable functions alone and wraps the rest.
pub fn portable(f: Function) -> Portable {
    if f.is_plain() {
        Portable::Plain(f)
    } else {
        Portable::Wrapped(Capsule::new(f))
    }
}
