//! Lua-backed functions.
//!
//! A script function is a Lua chunk that evaluates to a function. The chunk
//! may bind locals before returning the function, so the source text carries
//! the closure's captured state with it and can be rebuilt in any process that
//! embeds a Lua runtime.

use mlua::Lua;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::value::Value;

/// A compiled Lua function together with the source it was built from.
pub(crate) struct ScriptFn {
    source: String,
    lua: Mutex<Lua>,
    key: mlua::RegistryKey,
}

impl ScriptFn {
    /// Compiles `source` in a fresh Lua state.
    ///
    /// The chunk must evaluate to a function, either as a bare expression
    /// (`function(x) return x end`) or as a block ending in `return`.
    pub(crate) fn compile(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let lua = Lua::new();
        let key = {
            let value = lua.load(source.as_str()).set_name("capsule").eval::<mlua::Value<'_>>()?;
            let func = match value {
                mlua::Value::Function(func) => func,
                other => {
                    return Err(Error::codec(format!(
                        "Lua chunk evaluated to {} instead of a function",
                        other.type_name()
                    )))
                }
            };
            lua.create_registry_value(func)?
        };
        Ok(Self { source, lua: Mutex::new(lua), key })
    }

    pub(crate) fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn call(&self, arg: Value) -> Result<Value> {
        let lua = self.lua.lock();
        let func: mlua::Function<'_> = lua.registry_value(&self.key)?;
        let arg = to_lua(&lua, &arg)?;
        let out = func.call::<_, mlua::Value<'_>>(arg)?;
        from_lua(out)
    }
}

fn to_lua<'lua>(lua: &'lua Lua, value: &Value) -> mlua::Result<mlua::Value<'lua>> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Int(i) => mlua::Value::Integer(*i),
        Value::Float(f) => mlua::Value::Number(*f),
        Value::Str(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Bytes(b) => mlua::Value::String(lua.create_string(b)?),
        Value::List(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set((i + 1) as i64, to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Array(xs) => mlua::Value::Table(lua.create_sequence_from(xs.iter().copied())?),
    })
}

// Lua strings carry no encoding: valid UTF-8 comes back as text, anything
// else as bytes.
fn from_lua(value: mlua::Value<'_>) -> Result<Value> {
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Int(i)),
        mlua::Value::Number(n) => Ok(Value::Float(n)),
        mlua::Value::String(s) => Ok(match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => Value::Str(text.to_string()),
            Err(_) => Value::Bytes(s.as_bytes().to_vec()),
        }),
        mlua::Value::Table(table) => {
            let mut items = Vec::new();
            for item in table.sequence_values::<mlua::Value<'_>>() {
                items.push(from_lua(item?)?);
            }
            Ok(Value::List(items))
        }
        other => Err(Error::codec(format!("Lua function returned unsupported {}", other.type_name()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_expression() {
        let f = ScriptFn::compile("function(x) return x * 2 end").unwrap();
        assert_eq!(f.call(Value::Int(21)).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_compile_block_with_upvalue() {
        let f = ScriptFn::compile(
            r#"
            local prefix = "key:"
            return function(x) return prefix .. x end
        "#,
        )
        .unwrap();
        assert_eq!(f.call(Value::from("a")).unwrap(), Value::from("key:a"));
    }

    #[test]
    fn test_compile_rejects_non_function() {
        let err = ScriptFn::compile("return 42").err().unwrap();
        assert!(err.is_codec());
    }

    #[test]
    fn test_syntax_error() {
        let result = ScriptFn::compile("function(x) return x");
        assert!(matches!(result, Err(Error::Script(_))));
    }

    #[test]
    fn test_binary_strings_come_back_as_bytes() {
        let f = ScriptFn::compile("function(x) return x end").unwrap();
        assert_eq!(f.call(Value::Bytes(vec![0xff, 0x00])).unwrap(), Value::Bytes(vec![0xff, 0x00]));
    }

    #[test]
    fn test_tables_become_lists() {
        let f = ScriptFn::compile("function(x) return { x[2], x[1] } end").unwrap();
        let out = f.call(Value::List(vec![Value::Int(1), Value::from("b")])).unwrap();
        assert_eq!(out, Value::List(vec![Value::from("b"), Value::Int(1)]));
    }
}
