//! Named native functions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Function, NativeFn};
use crate::error::Result;
use crate::value::Value;

/// A table of native functions addressable by name.
///
/// A registered function is plain-serializable: its name is all that needs to
/// be written down, and any process that registers the same name can rebuild
/// it. Clones share the same table.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    fns: Arc<RwLock<HashMap<String, NativeFn>>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `name`, replacing any previous entry, and returns
    /// the resulting function.
    pub fn register<F>(&self, name: impl Into<String>, f: F) -> Function
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let f: NativeFn = Arc::new(f);
        if self.fns.write().insert(name.clone(), Arc::clone(&f)).is_some() {
            log::debug!("Replaced registered function {}", name);
        }
        Function::native(name, f)
    }

    /// Looks up a function by name.
    pub fn lookup(&self, name: &str) -> Option<Function> {
        self.fns.read().get(name).map(|f| Function::native(name.to_string(), Arc::clone(f)))
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.fns.read().contains_key(name)
    }

    /// Returns the number of registered functions.
    pub fn len(&self) -> usize {
        self.fns.read().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.fns.read().is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fns = self.fns.read();
        let mut names: Vec<&String> = fns.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("names", &names).finish()
    }
}
