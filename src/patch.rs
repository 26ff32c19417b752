//! Method patch capability.
//!
//! The wrapped client is reached exclusively through an explicit indirection
//! table keyed by (module, path). Hosts register the client's entry points in
//! a [`PatchRegistry`]; the instrumentation locates targets there and swaps
//! implementations in and out without ever touching the client's internals.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::dispatch::{CallArgs, CallOutput, MethodFn};

/// Errors from the patch capability. These indicate host miswiring, a
/// module or method that was never registered, not runtime failures of the
/// traced operations themselves.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("unknown module `{0}`")]
    UnknownModule(String),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("method `{0}` is already wrapped")]
    AlreadyWrapped(String),
}

struct MethodSlot {
    current: MethodFn,
    /// Saved implementation while a wrapper is installed. `Some` is the
    /// wrapped state.
    original: Option<MethodFn>,
}

/// A dispatch table mapping method paths to implementations.
///
/// One table backs each registered module; client handles carry their own
/// override tables on top (see [`ClientHandle`]).
#[derive(Default)]
pub struct MethodTable {
    slots: RwLock<HashMap<String, MethodSlot>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) a method implementation.
    pub fn register(&self, path: impl Into<String>, method: MethodFn) {
        self.slots.write().insert(
            path.into(),
            MethodSlot {
                current: method,
                original: None,
            },
        );
    }

    /// Returns the current implementation of `path`, if registered.
    pub fn resolve(&self, path: &str) -> Option<MethodFn> {
        self.slots.read().get(path).map(|slot| slot.current.clone())
    }

    /// Invoke the current implementation of `path`.
    pub fn call(&self, path: &str, args: CallArgs) -> Result<CallOutput, PatchError> {
        let method = self
            .resolve(path)
            .ok_or_else(|| PatchError::UnknownMethod(path.to_string()))?;
        Ok(method(args))
    }

    /// Swap in a wrapper built from the current implementation, saving the
    /// original for [`MethodTable::restore`].
    pub fn wrap(
        &self,
        path: &str,
        wrapper: impl FnOnce(MethodFn) -> MethodFn,
    ) -> Result<(), PatchError> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(path)
            .ok_or_else(|| PatchError::UnknownMethod(path.to_string()))?;
        if slot.original.is_some() {
            return Err(PatchError::AlreadyWrapped(path.to_string()));
        }
        let original = slot.current.clone();
        slot.current = wrapper(original.clone());
        slot.original = Some(original);
        Ok(())
    }

    /// Remove the installed wrapper, restoring direct delegation to the
    /// original implementation. Returns `true` if a wrapper was removed;
    /// idempotent otherwise.
    pub fn restore(&self, path: &str) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(path) {
            Some(slot) => match slot.original.take() {
                Some(original) => {
                    slot.current = original;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Returns `true` if `path` currently has a wrapper installed.
    pub fn is_wrapped(&self, path: &str) -> bool {
        self.slots
            .read()
            .get(path)
            .is_some_and(|slot| slot.original.is_some())
    }

    /// Returns `true` if `path` is registered at all.
    pub fn contains(&self, path: &str) -> bool {
        self.slots.read().contains_key(path)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("MethodTable")
            .field("paths", &slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A patchable (table, path) pair: the locate result of the registry.
#[derive(Clone)]
pub struct PatchTarget {
    table: Arc<MethodTable>,
    path: String,
}

impl PatchTarget {
    pub(crate) fn new(table: Arc<MethodTable>, path: impl Into<String>) -> Self {
        Self {
            table,
            path: path.into(),
        }
    }

    /// The method path this target addresses.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Install a wrapper around the current implementation.
    pub fn replace(&self, wrapper: impl FnOnce(MethodFn) -> MethodFn) -> Result<(), PatchError> {
        self.table.wrap(&self.path, wrapper)
    }

    /// Remove the installed wrapper. Idempotent.
    pub fn restore(&self) -> bool {
        self.table.restore(&self.path)
    }

    /// Returns `true` if a wrapper is currently installed.
    pub fn is_wrapped(&self) -> bool {
        self.table.is_wrapped(&self.path)
    }

    /// Invoke the target's current implementation.
    pub fn invoke(&self, args: CallArgs) -> Result<CallOutput, PatchError> {
        self.table.call(&self.path, args)
    }
}

impl fmt::Debug for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchTarget")
            .field("path", &self.path)
            .finish()
    }
}

/// Registry of patchable modules: the (module, path) indirection table.
#[derive(Default)]
pub struct PatchRegistry {
    modules: RwLock<HashMap<String, Arc<MethodTable>>>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module's dispatch table under `name`.
    pub fn register_module(&self, name: impl Into<String>, table: Arc<MethodTable>) {
        self.modules.write().insert(name.into(), table);
    }

    /// Returns the dispatch table registered under `name`.
    pub fn module(&self, name: &str) -> Result<Arc<MethodTable>, PatchError> {
        self.modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PatchError::UnknownModule(name.to_string()))
    }

    /// Locate a patch target by (module, path).
    pub fn locate(&self, module: &str, path: &str) -> Result<PatchTarget, PatchError> {
        let table = self.module(module)?;
        if !table.contains(path) {
            return Err(PatchError::UnknownMethod(path.to_string()));
        }
        Ok(PatchTarget::new(table, path))
    }

    /// Invoke a method by (module, path). Convenience for hosts and tests.
    pub fn call(&self, module: &str, path: &str, args: CallArgs) -> Result<CallOutput, PatchError> {
        self.module(module)?.call(path, args)
    }
}

/// A child client object produced by a factory operation.
///
/// Methods resolve through a per-instance override table first, falling back
/// to the shared class table, so a class-level patch covers every handle
/// while an instance-level patch covers exactly one.
#[derive(Clone)]
pub struct ClientHandle {
    class: Arc<MethodTable>,
    overrides: Arc<MethodTable>,
}

impl ClientHandle {
    /// Create a handle dispatching against `class`.
    pub fn new(class: Arc<MethodTable>) -> Self {
        Self {
            class,
            overrides: Arc::new(MethodTable::new()),
        }
    }

    /// Invoke a method on this handle.
    pub fn call(&self, path: &str, args: CallArgs) -> Result<CallOutput, PatchError> {
        if self.overrides.contains(path) {
            self.overrides.call(path, args)
        } else {
            self.class.call(path, args)
        }
    }

    /// The patch target an instrumentation should wrap for `path` on this
    /// specific handle.
    ///
    /// When the class slot is already wrapped the class target is returned,
    /// so the caller's idempotency check sees it and one call never runs
    /// through two wrappers. Otherwise the current class implementation is
    /// promoted into this handle's override table and the instance target is
    /// returned.
    pub fn target(&self, path: &str) -> Result<PatchTarget, PatchError> {
        if self.overrides.contains(path) {
            return Ok(PatchTarget::new(self.overrides.clone(), path));
        }
        if self.class.is_wrapped(path) {
            return Ok(PatchTarget::new(self.class.clone(), path));
        }
        let method = self
            .class
            .resolve(path)
            .ok_or_else(|| PatchError::UnknownMethod(path.to_string()))?;
        self.overrides.register(path, method);
        Ok(PatchTarget::new(self.overrides.clone(), path))
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("overrides", &self.overrides)
            .finish()
    }
}
