//! Operation call observers.
//!
//! The dispatcher reports every handler invocation, with its arguments, to an injected
//! [`OpObserver`] before doing any work.

use std::fmt;
use std::sync::Mutex;

pub trait OpObserver: Send + Sync {
    fn observe(&self, op: &'static str, args: fmt::Arguments<'_>);
}

/// Emits one `tracing` event per call under the `stampfs::ops` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl OpObserver for TracingObserver {
    fn observe(&self, op: &'static str, args: fmt::Arguments<'_>) {
        tracing::info!(target: "stampfs::ops", "{op}({args})");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl OpObserver for NoopObserver {
    fn observe(&self, _op: &'static str, _args: fmt::Arguments<'_>) {}
}

/// Keeps every call in memory, in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    calls: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingObserver {
    pub fn calls(&self) -> Vec<(&'static str, String)> {
        self.calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn ops(&self) -> Vec<&'static str> {
        self.calls().into_iter().map(|(op, _)| op).collect()
    }
}

impl OpObserver for RecordingObserver {
    fn observe(&self, op: &'static str, args: fmt::Arguments<'_>) {
        let mut calls = match self.calls.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        calls.push((op, args.to_string()));
    }
}

impl<T: OpObserver + ?Sized> OpObserver for std::sync::Arc<T> {
    fn observe(&self, op: &'static str, args: fmt::Arguments<'_>) {
        (**self).observe(op, args)
    }
}
