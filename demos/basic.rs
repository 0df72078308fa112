//! Basic usage example for redbdict
//!
//! This example demonstrates the fundamental operations:
//! - Creating a store with a key codec
//! - Writing, reading and deleting entries
//! - Reopening the store without repeating the codec
//! - Scanning every entry

use redbdict::{Function, Options, Store, Value};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    let path = std::env::temp_dir().join("redbdict_example.redb");
    let _ = std::fs::remove_file(&path);

    // Keys as UTF-8 text, values through a Lua codec stored with the data
    let dumps = Function::lua("function(v) return string.format('%d', v) end")?;
    let loads = Function::lua("function(b) return math.tointeger(tonumber(b)) end")?;
    let options = Options::write().key_method("utf8").value_codec(dumps, loads);

    let mut store = Store::open(&path, options)?;
    println!("Store opened at {}", path.display());

    println!("Writing data...");
    store.set("apples", 3)?;
    store.set("pears", 5)?;
    store.set("plums", 8)?;
    store.flush()?;

    println!("Deleting pears...");
    store.delete("pears")?;
    store.close()?;

    // No codec arguments: the store knows its own
    let store = Store::open(&path, Options::read())?;
    println!("Reopened with {} keys: {:?}", store.len(), store.keys());

    if let Some(value) = store.get_opt("apples")? {
        println!("apples => {:?}", value);
    }
    match store.get("pears") {
        Ok(_) => println!("pears still exists (unexpected)"),
        Err(e) if e.is_not_found() => println!("pears was successfully deleted"),
        Err(e) => return Err(e.into()),
    }

    println!("Scanning...");
    for entry in store.sequential_iter()? {
        let (key, value) = entry?;
        if let (Some(name), Value::Int(n)) = (key.as_str(), value) {
            println!("  {} = {}", name, n);
        }
    }

    store.close()?;
    println!("Store closed");

    Ok(())
}
