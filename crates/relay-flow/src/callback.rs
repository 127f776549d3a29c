//! Name-indexed callback registry.
//!
//! Completion continuations are referenced by a registered string name, not
//! by a function pointer: a name survives persistence and cross-node
//! delivery where an in-memory closure cannot. The registry is held by the
//! scheduler instance it serves; independent schedulers (and tests) carry
//! independent registries.
//!
//! Callbacks receive `(context, data)` as JSON values: the context stored
//! when the callback was attached, and the completion data produced by the
//! engine. Built-in engine continuations additionally mutate engine state
//! through the [`EngineCx`] they are handed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::scheduler::EngineCx;

/// Callback name invoked when a transaction's root step resolves.
pub const ROOT_STEP_COMPLETE: &str = "root_step_complete";

/// Callback name invoked when a pipeline child resolves.
pub const PIPELINE_CHILD_COMPLETE: &str = "pipeline_child_complete";

/// A continuation invocable by registered name.
pub trait Callback: Send + Sync {
    /// Invokes the callback with its stored context and completion data.
    ///
    /// # Errors
    ///
    /// Errors propagate to the tick boundary, where they are isolated
    /// per-event and logged.
    fn invoke(&self, cx: &mut EngineCx<'_>, context: &Value, data: &Value) -> Result<()>;
}

/// Name-indexed table of callbacks held by one scheduler instance.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Arc<dyn Callback>>,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl CallbackRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback under a globally unique name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateCallback`] if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        callback: Arc<dyn Callback>,
    ) -> Result<()> {
        let name = name.into();
        if self.callbacks.contains_key(&name) {
            return Err(Error::DuplicateCallback { name });
        }
        self.callbacks.insert(name, callback);
        Ok(())
    }

    /// Invokes a callback by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCallback`] listing the known names when the
    /// name is absent; otherwise propagates the callback's own error.
    pub fn call(
        &self,
        name: &str,
        cx: &mut EngineCx<'_>,
        context: &Value,
        data: &Value,
    ) -> Result<()> {
        let callback = self
            .callbacks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCallback {
                name: name.to_string(),
                known: self.names(),
            })?;
        callback.invoke(cx, context, data)
    }

    /// Returns true if a callback name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    /// Returns the registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callbacks.keys().cloned().collect();
        names.sort();
        names
    }
}
