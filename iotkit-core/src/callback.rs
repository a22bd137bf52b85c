// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User callback plumbing: handler traits, swappable handler slots and the
//! panic guard every invocation goes through.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::error;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::CallbackError;

/// Receives decoded inbound messages from a client session.
///
/// `source` is the MQTT topic the message arrived on, or the URI of the
/// WebSocket endpoint. Invoked synchronously on the session's task, so
/// implementations should return quickly.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, source: &str, data: &Value);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &Value) + Send + Sync + 'static,
{
    fn on_message(&self, source: &str, data: &Value) {
        self(source, data)
    }
}

/// A handler that can be installed or replaced while the session runs.
pub struct HandlerSlot<H: ?Sized> {
    inner: Arc<RwLock<Option<Arc<H>>>>,
}

impl<H: ?Sized> HandlerSlot<H> {
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub fn new(handler: Arc<H>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(handler))),
        }
    }

    pub fn set(&self, handler: Arc<H>) {
        *self.inner.write() = Some(handler);
    }

    /// Snapshot of the current handler. The lock is released before the caller invokes it.
    pub fn get(&self) -> Option<Arc<H>> {
        self.inner.read().clone()
    }
}

impl<H: ?Sized> Clone for HandlerSlot<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for HandlerSlot<H> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Run a user callback, converting a panic into a logged [`CallbackError`].
pub fn guard<F>(owner: &str, callback: &'static str, f: F) -> Result<(), CallbackError>
where
    F: FnOnce(),
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let err = CallbackError { callback, message };
        error!("[{owner}] {err}");
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_closure_is_a_message_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |source: &str, _data: &Value| {
            assert_eq!(source, "sensors/t");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handler.on_message("sensors/t", &Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_slot_replacement_is_visible_to_clones() {
        let slot: HandlerSlot<dyn MessageHandler> = HandlerSlot::empty();
        let shared = slot.clone();
        assert!(shared.get().is_none());

        slot.set(Arc::new(|_: &str, _: &Value| {}));
        assert!(shared.get().is_some());
    }

    #[test]
    fn test_guard_catches_panics() {
        let err = guard("test", "on_message", || panic!("boom")).unwrap_err();
        assert_eq!(err.callback, "on_message");
        assert_eq!(err.message, "boom");

        let err = guard("test", "on_connect", || panic!("{} failed", "peer")).unwrap_err();
        assert_eq!(err.message, "peer failed");

        assert!(guard("test", "on_message", || {}).is_ok());
    }
}
