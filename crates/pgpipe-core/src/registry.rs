//! Explicit service registry.
//!
//! Command handlers and other collaborators are wired by stable string ids.
//! Each id maps to a factory closure; resolution runs the factory and
//! downcasts the erased instance back to the requested type. A type that
//! does not match what the factory produced is reported as a
//! [`ConfigError`], never as a panic or an unchecked cast.
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register("greeting", |_| Ok(String::from("hello")));
//! registry.register_singleton("pool_size", |_| Ok(4usize));
//!
//! let greeting: String = registry.resolve("greeting")?;
//! let size: Arc<usize> = registry.shared("pool_size")?;
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ConfigError, Error, Result};

type ErasedFactory = Box<dyn Fn(&Registry) -> Result<Box<dyn Any + Send>> + Send + Sync>;
type ErasedSharedFactory =
    Box<dyn Fn(&Registry) -> Result<Arc<dyn Any + Send + Sync>> + Send + Sync>;

enum Entry {
    /// Builds a fresh owned instance on every resolution.
    Factory {
        build: ErasedFactory,
        produces: &'static str,
    },
    /// Builds once on first use, then hands out clones of the same `Arc`.
    Singleton {
        build: ErasedSharedFactory,
        instance: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
        produces: &'static str,
    },
}

impl Entry {
    fn produces(&self) -> &'static str {
        match self {
            Entry::Factory { produces, .. } | Entry::Singleton { produces, .. } => produces,
        }
    }
}

/// Registry of named factories.
///
/// Registration takes `&mut self` and happens during setup; resolution takes
/// `&self`, so a built registry can be shared across threads. Factories
/// receive the registry so they can resolve their own dependencies.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory producing a new `T` per resolution.
    ///
    /// Registering an id twice replaces the earlier factory.
    pub fn register<T, F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        T: Send + 'static,
        F: Fn(&Registry) -> Result<T> + Send + Sync + 'static,
    {
        let build: ErasedFactory =
            Box::new(move |registry| factory(registry).map(|v| Box::new(v) as Box<dyn Any + Send>));
        self.insert(
            id.into(),
            Entry::Factory {
                build,
                produces: type_name::<T>(),
            },
        );
        self
    }

    /// Register a lazily-built shared instance of `T`.
    pub fn register_singleton<T, F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Registry) -> Result<T> + Send + Sync + 'static,
    {
        let build: ErasedSharedFactory = Box::new(move |registry| {
            factory(registry).map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>)
        });
        self.insert(
            id.into(),
            Entry::Singleton {
                build,
                instance: Mutex::new(None),
                produces: type_name::<T>(),
            },
        );
        self
    }

    fn insert(&mut self, id: String, entry: Entry) {
        if self.entries.contains_key(&id) {
            tracing::warn!(id = %id, "Replacing existing registry entry");
        }
        self.entries.insert(id, entry);
    }

    /// Resolve a fresh owned `T` from a factory entry.
    pub fn resolve<T: 'static>(&self, id: &str) -> Result<T> {
        let entry = self.entry(id)?;
        let Entry::Factory { build, produces } = entry else {
            return Err(config_error(format!(
                "'{id}' is registered as a singleton; use shared() to retrieve it"
            )));
        };

        let erased: Box<dyn Any> = build(self)?;
        erased
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| mismatch(id, type_name::<T>(), produces))
    }

    /// Resolve the shared `Arc<T>` of a singleton entry, building it on
    /// first use.
    pub fn shared<T: Send + Sync + 'static>(&self, id: &str) -> Result<Arc<T>> {
        let entry = self.entry(id)?;
        let Entry::Singleton {
            build,
            instance,
            produces,
        } = entry
        else {
            return Err(config_error(format!(
                "'{id}' is registered as a factory; use resolve() to retrieve it"
            )));
        };

        let existing = instance
            .lock()
            .map_err(|_| config_error(format!("singleton '{id}' lock poisoned")))?
            .clone();

        let erased = if let Some(existing) = existing {
            existing
        } else {
            // Built without the lock held so the factory may resolve other
            // entries. If two threads race, the first stored instance wins.
            let built = build(self)?;
            let mut slot = instance
                .lock()
                .map_err(|_| config_error(format!("singleton '{id}' lock poisoned")))?;
            Arc::clone(slot.get_or_insert(built))
        };

        erased
            .downcast::<T>()
            .map_err(|_| mismatch(id, type_name::<T>(), produces))
    }

    /// Whether an entry exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, id: &str) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| config_error(format!("no service registered under '{id}'")))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (id, entry) in &self.entries {
            map.entry(id, &entry.produces());
        }
        map.finish()
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}

fn mismatch(id: &str, requested: &str, produces: &str) -> Error {
    config_error(format!(
        "service '{id}' produces {produces}, not the requested {requested}"
    ))
}
