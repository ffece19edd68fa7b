//! # Module Registry
//!
//! Name -> module metadata, type schemas, and callable. Modules register at
//! startup (and during provider reconnection) under dot-separated names;
//! `register_namespaced` additionally claims a short-name alias when no
//! other module owns it.
//!
//! ## Design
//!
//! Reads vastly outnumber writes, so the registry keeps its whole state in
//! an [`arc_swap::ArcSwap`] snapshot: `get` is a lock-free load, while
//! `register`/`deregister` clone the snapshot under a short mutex and swap
//! it in.

use crate::hash::fingerprint;
use crate::types::SemType;
use crate::value::Value;
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

/// Parameter/output schema: name -> type
pub type ModuleSchema = BTreeMap<String, SemType>;

/// Descriptive module metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub name: String,
    pub description: String,
    /// Semver string, informational
    pub version: String,
}

/// Categories of module invocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleErrorKind {
    NotFound,
    TypeError,
    RuntimeError,
    Timeout,
    Cancelled,
}

impl fmt::Display for ModuleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleErrorKind::NotFound => "not found",
            ModuleErrorKind::TypeError => "type error",
            ModuleErrorKind::RuntimeError => "runtime error",
            ModuleErrorKind::Timeout => "timeout",
            ModuleErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Module invocation failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("module error ({kind}): {message}")]
pub struct ModuleError {
    pub kind: ModuleErrorKind,
    pub message: String,
}

impl ModuleError {
    pub fn new(kind: ModuleErrorKind, message: impl Into<String>) -> Self {
        ModuleError {
            kind,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        ModuleError::new(ModuleErrorKind::RuntimeError, message)
    }
}

/// The opaque async callable backing a module
pub type InvokeFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ModuleError>> + Send + Sync>;

/// A registered module: metadata, schemas, and the callable
///
/// The core treats the callable opaquely; only the schemas are visible to
/// the compiler.
#[derive(Clone)]
pub struct Module {
    pub metadata: ModuleMetadata,
    /// Parameter name -> type
    pub consumes: ModuleSchema,
    /// Output port -> type
    pub produces: ModuleSchema,
    invoke: InvokeFn,
}

impl Module {
    pub fn new(
        metadata: ModuleMetadata,
        consumes: ModuleSchema,
        produces: ModuleSchema,
        invoke: InvokeFn,
    ) -> Self {
        Module {
            metadata,
            consumes,
            produces,
            invoke,
        }
    }

    /// Invoke the callable with the gathered input record
    pub fn invoke(&self, input: Value) -> BoxFuture<'static, Result<Value, ModuleError>> {
        (self.invoke)(input)
    }

    /// The type a call-site observes: the single output port's type, or a
    /// record of all ports for multi-output modules
    pub fn output_type(&self) -> SemType {
        if self.produces.len() == 1 {
            self.produces
                .values()
                .next()
                .cloned()
                .unwrap_or(SemType::Unit)
        } else {
            SemType::Record(
                self.produces
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.clone()))
                    .collect(),
            )
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("metadata", &self.metadata)
            .field("consumes", &self.consumes)
            .field("produces", &self.produces)
            .finish_non_exhaustive()
    }
}

/// Registration failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid module name '{name}': expected dot-separated identifiers")]
    InvalidName { name: String },

    #[error("module '{name}' is already registered")]
    Duplicate { name: String },
}

#[derive(Default)]
struct RegistrySnapshot {
    /// Full name -> module
    modules: HashMap<String, Arc<Module>>,
    /// Short-name alias -> full name it points to
    aliases: HashMap<String, String>,
}

/// Process-wide module registry
pub struct ModuleRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    write_lock: Mutex<()>,
    name_pattern: Regex,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        ModuleRegistry {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: Mutex::new(()),
            name_pattern: Regex::new(r"^[a-zA-Z_][a-zA-Z_0-9]*(\.[a-zA-Z_][a-zA-Z_0-9]*)*$")
                .expect("static pattern"),
        }
    }

    /// Register a module under its full dot-separated name
    pub fn register(&self, name: &str, module: Module) -> Result<(), RegistryError> {
        if !self.name_pattern.is_match(name) {
            return Err(RegistryError::InvalidName {
                name: name.to_string(),
            });
        }

        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();
        if current.modules.contains_key(name) {
            return Err(RegistryError::Duplicate {
                name: name.to_string(),
            });
        }

        let mut next = RegistrySnapshot {
            modules: current.modules.clone(),
            aliases: current.aliases.clone(),
        };
        next.modules.insert(name.to_string(), Arc::new(module));
        self.snapshot.store(Arc::new(next));
        tracing::debug!(module = name, "module_registered");
        Ok(())
    }

    /// Register under `prefix.short_name`, claiming the bare `short_name`
    /// alias when no other module owns it
    pub fn register_namespaced(
        &self,
        prefix: &str,
        short_name: &str,
        module: Module,
    ) -> Result<(), RegistryError> {
        let full = format!("{prefix}.{short_name}");
        if !self.name_pattern.is_match(&full) || short_name.contains('.') {
            return Err(RegistryError::InvalidName { name: full });
        }

        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();
        if current.modules.contains_key(&full) {
            return Err(RegistryError::Duplicate { name: full });
        }

        let mut next = RegistrySnapshot {
            modules: current.modules.clone(),
            aliases: current.aliases.clone(),
        };
        next.modules.insert(full.clone(), Arc::new(module));
        if !next.aliases.contains_key(short_name) && !next.modules.contains_key(short_name) {
            next.aliases.insert(short_name.to_string(), full.clone());
        }
        self.snapshot.store(Arc::new(next));
        tracing::debug!(module = %full, "module_registered");
        Ok(())
    }

    /// Resolve a module: full name first, then short-name alias
    pub fn get(&self, name: &str) -> Option<Arc<Module>> {
        let snapshot = self.snapshot.load();
        if let Some(module) = snapshot.modules.get(name) {
            return Some(Arc::clone(module));
        }
        snapshot
            .aliases
            .get(name)
            .and_then(|full| snapshot.modules.get(full))
            .map(Arc::clone)
    }

    /// The fully-qualified name `name` resolves to, if any
    pub fn resolve_name(&self, name: &str) -> Option<String> {
        let snapshot = self.snapshot.load();
        if snapshot.modules.contains_key(name) {
            return Some(name.to_string());
        }
        snapshot.aliases.get(name).cloned()
    }

    /// Remove a module; idempotent. Aliases pointing at the removed module
    /// are dropped with it; aliases pointing elsewhere stay.
    pub fn deregister(&self, name: &str) {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load();

        let full = if current.modules.contains_key(name) {
            name.to_string()
        } else if let Some(full) = current.aliases.get(name) {
            full.clone()
        } else {
            return;
        };

        let mut next = RegistrySnapshot {
            modules: current.modules.clone(),
            aliases: current.aliases.clone(),
        };
        next.modules.remove(&full);
        next.aliases.retain(|_, target| *target != full);
        self.snapshot.store(Arc::new(next));
        tracing::debug!(module = %full, "module_deregistered");
    }

    /// Registered full names, sorted
    pub fn names(&self) -> Vec<String> {
        let snapshot = self.snapshot.load();
        let mut names: Vec<String> = snapshot.modules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered modules (full names only)
    pub fn len(&self) -> usize {
        self.snapshot.load().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().modules.is_empty()
    }

    /// Deterministic digest over every module's name, version, and schemas.
    /// A compile output is only valid against the registry state it was
    /// produced from; this hash detects drift.
    pub fn registry_hash(&self) -> String {
        let snapshot = self.snapshot.load();
        let mut names: Vec<&String> = snapshot.modules.keys().collect();
        names.sort();

        let mut canonical = String::new();
        for name in names {
            let module = &snapshot.modules[name];
            let _ = write!(canonical, "{name}@{};", module.metadata.version);
            for (param, ty) in &module.consumes {
                let _ = write!(canonical, "<{param}:{ty}");
            }
            for (port, ty) in &module.produces {
                let _ = write!(canonical, ">{port}:{ty}");
            }
            canonical.push('\n');
        }
        fingerprint(&canonical)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        ModuleRegistry::new()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
