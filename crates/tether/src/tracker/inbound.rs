//! Inbound call registry: deduplication by id.

use std::sync::Arc;

use dashmap::DashMap;

use crate::call::InboundCall;

#[derive(Debug, Default)]
pub struct InboundCallTracker {
    calls: DashMap<i64, Arc<InboundCall>>,
}

impl InboundCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `call` unless its id is taken, returning the registered
    /// instance. NoWait calls are returned as is and never stored.
    ///
    /// The caller runs the call only if it gets its own instance back.
    pub fn get_or_register(&self, call: Arc<InboundCall>) -> Arc<InboundCall> {
        if call.is_no_wait() {
            return call;
        }
        self.calls.entry(call.id()).or_insert(call).value().clone()
    }

    /// Removes the call if it is the registered instance for its id.
    pub fn unregister(&self, call: &InboundCall) -> bool {
        if call.is_no_wait() {
            return true;
        }
        self.calls
            .remove_if(&call.id(), |_, registered| std::ptr::eq(Arc::as_ptr(registered), call))
            .is_some()
    }

    /// Whether `call` is still the registered instance for its id.
    pub fn is_tracked(&self, call: &InboundCall) -> bool {
        self.calls
            .get(&call.id())
            .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered.value()), call))
    }

    pub fn get(&self, id: i64) -> Option<Arc<InboundCall>> {
        self.calls.get(&id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.calls.len()
    }

    /// Cancels and forgets every tracked call. Returns how many there were.
    pub fn clear(&self) -> usize {
        let calls: Vec<Arc<InboundCall>> = self.calls.iter().map(|e| e.value().clone()).collect();
        self.calls.clear();
        for call in &calls {
            call.cancel();
        }
        calls.len()
    }
}
