//! Command executor with a reentrant "silent" mode.
//!
//! When silent, `execute` still runs the handler and still pushes onto the
//! undo-bookkeeping stack, but suppresses the `commandStack.changed`
//! notification that would otherwise fire. `execute_silently` /
//! `execute_batch_silently` enter silent mode for the duration of the call
//! and restore the prior flag on every exit path — including a handler
//! returning `Err` — via an RAII guard rather than a manual try/finally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};

/// A registered command handler. Implemented for any
/// `Fn(&Value) -> Result<Value>` closure via the blanket impl below.
pub trait CommandHandler: Send + Sync {
    fn execute(&self, ctx: &Value) -> Result<Value>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Value) -> Result<Value> + Send + Sync,
{
    fn execute(&self, ctx: &Value) -> Result<Value> {
        self(ctx)
    }
}

/// RAII guard that forces the stack's silent flag on construction and
/// restores its pre-guard value on drop, regardless of how the guarded
/// scope exits (return, `?`, or panic during unwinding).
pub struct SilentGuard {
    flag: Arc<AtomicBool>,
    prev: bool,
}

impl SilentGuard {
    fn enter(flag: Arc<AtomicBool>) -> Self {
        let prev = flag.swap(true, Ordering::SeqCst);
        Self { flag, prev }
    }
}

impl Drop for SilentGuard {
    fn drop(&mut self) {
        self.flag.store(self.prev, Ordering::SeqCst);
    }
}

pub struct SilentCommandStack {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
    /// Names of applied commands, most recent last — the undo bookkeeping
    /// stack. Non-goal territory (no actual undo/redo here; the diagram
    /// editor's own history stack is the out-of-scope collaborator this
    /// suppresses) but kept so `history().len()` is observable in tests.
    history: Vec<String>,
    silent: Arc<AtomicBool>,
    listeners: Vec<Box<dyn Fn() + Send + Sync>>,
}

impl Default for SilentCommandStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SilentCommandStack {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            history: Vec::new(),
            silent: Arc::new(AtomicBool::new(false)),
            listeners: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    /// Subscribe to `commandStack.changed`. Fired once per non-silent
    /// `execute`.
    pub fn on_changed(&mut self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::SeqCst)
    }

    pub fn set_silent_mode(&mut self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Invoke the named handler. Emits `commandStack.changed` unless silent
    /// mode is active.
    pub fn execute(&mut self, name: &str, ctx: &Value) -> Result<Value> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| Error::MalformedChange(format!("unknown command: {name}")))?;
        let result = handler.execute(ctx)?;
        self.history.push(name.to_string());
        if !self.is_silent() {
            for listener in &self.listeners {
                listener();
            }
        }
        Ok(result)
    }

    /// Execute one command under a forced silent span. The prior silent
    /// flag is restored whether the handler succeeds or fails.
    pub fn execute_silently(&mut self, name: &str, ctx: &Value) -> Result<Value> {
        let _guard = SilentGuard::enter(self.silent.clone());
        self.execute(name, ctx)
    }

    /// Execute each `(name, ctx)` pair in order under a single silent span.
    /// Stops at the first failure (after restoring the prior silent flag)
    /// and propagates it; commands executed before the failure keep their
    /// effects (there is no automatic rollback).
    pub fn execute_batch_silently(&mut self, cmds: &[(String, Value)]) -> Result<Vec<Value>> {
        let _guard = SilentGuard::enter(self.silent.clone());
        let mut results = Vec::with_capacity(cmds.len());
        for (name, ctx) in cmds {
            results.push(self.execute(name, ctx)?);
        }
        Ok(results)
    }
}
