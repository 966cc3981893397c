//! Generic mechanism for the extension/capability registry.
//!
//! `alpenhorn`'s Python original loads extensions dynamically via
//! `importlib` from names listed in the config file. Rust has no equivalent
//! of dynamic module loading without `dlopen`, so here `config.extensions`
//! names a fixed set of *built-in* extensions, each resolved through a
//! `match` in the binary crate (`alpenhornd`) that knows about the concrete
//! capability types (I/O backends, import detectors, database backends).
//!
//! This module only provides the name-keyed, duplicate-rejecting container
//! those concrete registrations are collected into; it has no knowledge of
//! what a "capability" actually is.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// A name-keyed collection of values of type `T`, one extension's worth at
/// a time, rejecting a later extension that tries to reuse an earlier
/// extension's key.
#[derive(Debug, Default)]
pub struct KeyedRegistry<T> {
    entries: HashMap<String, (T, String)>,
}

impl<T> KeyedRegistry<T> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Register `value` under `key`, attributing it to `extension` for
    /// error messages. Fails if `key` is already taken.
    pub fn register(&mut self, key: &str, extension: &str, value: T) -> Result<()> {
        if self.entries.contains_key(key) {
            return Err(Error::DuplicateCapability {
                key: key.to_string(),
                extension: extension.to_string(),
            });
        }
        self.entries.insert(key.to_string(), (value, extension.to_string()));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key).map(|(v, _)| v)
    }

    pub fn into_values(self) -> impl Iterator<Item = T> {
        self.entries.into_values().map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A slot that may be filled at most once, used for the database
/// capability: at most one extension may provide a database backend.
#[derive(Debug, Default)]
pub struct SingleSlot<T> {
    value: Option<(T, String)>,
}

impl<T> SingleSlot<T> {
    pub fn new() -> Self {
        Self { value: None }
    }

    pub fn fill(&mut self, extension: &str, value: T) -> Result<()> {
        if self.value.is_some() {
            return Err(Error::DuplicateDatabaseCapability(extension.to_string()));
        }
        self.value = Some((value, extension.to_string()));
        Ok(())
    }

    pub fn into_inner(self) -> Option<T> {
        self.value.map(|(v, _)| v)
    }
}

/// Validate a list of requested extension names against the set of
/// identifiers the caller knows how to resolve, per `config.extensions`.
pub fn validate_known(requested: &[String], known: &[&str]) -> Result<()> {
    for name in requested {
        if !known.contains(&name.as_str()) {
            return Err(Error::UnknownExtension(name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_rejected() {
        let mut reg: KeyedRegistry<i32> = KeyedRegistry::new();
        reg.register("lustrehsm", "ext_a", 1).unwrap();
        let err = reg.register("lustrehsm", "ext_b", 2);
        assert!(err.is_err());
    }

    #[test]
    fn single_slot_rejects_second_fill() {
        let mut slot: SingleSlot<&str> = SingleSlot::new();
        slot.fill("ext_a", "postgres").unwrap();
        assert!(slot.fill("ext_b", "mysql").is_err());
    }

    #[test]
    fn unknown_extension_rejected() {
        let requested = vec!["bogus".to_string()];
        assert!(validate_known(&requested, &["lustrehsm"]).is_err());
    }
}
