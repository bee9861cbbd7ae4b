// ABOUTME: EventRouter classifies inbound envelopes and fans them out to registered handlers.
// ABOUTME: A failing handler is logged and never stops the remaining handlers.

use crate::blueprint::{EventBlueprint, EventType};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Receives the payload of every envelope of the types it is registered for
pub trait EventHandler: Send + Sync {
    fn handle(&self, payload: &Value) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&Value) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, payload: &Value) -> anyhow::Result<()> {
        self(payload)
    }
}

/// Token returned by `register`, used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Entry = (HandlerId, Arc<dyn EventHandler>);

#[derive(Default)]
pub struct EventRouter {
    handlers: RwLock<HashMap<EventType, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&self, event_type: EventType, handler: H) -> HandlerId
    where
        H: EventHandler + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        tracing::trace!(event_type = ?event_type, handler = id.0, "Registered event handler");
        id
    }

    /// Remove one handler. Returns false if it was not registered.
    pub fn deregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for entries in handlers.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
        }
        handlers.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Drop every handler; used on session teardown
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the envelope's resolved type.
    ///
    /// Returns how many handlers ran. Handlers are invoked outside the lock,
    /// so they may register or deregister freely.
    pub fn dispatch(&self, envelope: &EventBlueprint) -> usize {
        let Some(event_type) = envelope.any_type() else {
            tracing::trace!(event_id = ?envelope.event_id, "Dropping envelope without a known type");
            return 0;
        };

        let matched: Vec<Entry> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event_type)
            .cloned()
            .unwrap_or_default();

        if matched.is_empty() {
            tracing::trace!(event_type = ?event_type, "No handler for event");
            return 0;
        }

        let payload = envelope.payload();
        for (id, handler) in &matched {
            if let Err(e) = handler.handle(payload) {
                tracing::warn!(event_type = ?event_type, handler = id.0, error = %e, "Event handler failed");
            }
        }
        matched.len()
    }

    /// Parse a raw text frame and dispatch it. Unparseable frames are dropped.
    pub fn route_text(&self, frame: &str) -> usize {
        match EventBlueprint::parse(frame) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(e) => {
                tracing::warn!(error = %e, frame_len = frame.len(), "Dropping malformed frame");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &str| {
                let log = Arc::clone(&log);
                let name = name.to_string();
                Box::new(move |_: &Value| {
                    log.lock().unwrap().push(name.clone());
                    Ok(())
                }) as Box<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>
            }
        };
        (log, make)
    }

    #[test]
    fn test_dispatches_by_resolved_type() {
        let router = EventRouter::new();
        let (log, make) = recorder();
        router.register(EventType::MessageCreated, make("message"));
        router.register(EventType::ThreadRecovered, make("recovered"));

        let n = router.route_text(
            r#"{"event":"MessageCreated","postback":{"type":"ThreadRecovered"}}"#,
        );
        assert_eq!(n, 1);
        assert_eq!(*log.lock().unwrap(), vec!["message"]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let router = EventRouter::new();
        let (log, make) = recorder();
        router.register(EventType::MessageCreated, make("first"));
        router.register(EventType::MessageCreated, |_: &Value| -> anyhow::Result<()> {
            anyhow::bail!("boom")
        });
        router.register(EventType::MessageCreated, make("third"));

        let n = router.route_text(r#"{"postback":{"type":"MessageCreated","data":{}}}"#);
        assert_eq!(n, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn test_unmatched_and_malformed_are_dropped() {
        let router = EventRouter::new();
        assert_eq!(router.route_text(r#"{"postback":{"type":"ThreadArchived"}}"#), 0);
        assert_eq!(router.route_text(r#"{"event":"NotAThing"}"#), 0);
        assert_eq!(router.route_text("not json"), 0);
    }

    #[test]
    fn test_deregister_and_clear() {
        let router = EventRouter::new();
        let (log, make) = recorder();
        let id = router.register(EventType::MessageCreated, make("a"));
        router.register(EventType::ThreadArchived, make("b"));

        assert!(router.deregister(id));
        assert!(!router.deregister(id));
        assert_eq!(router.handler_count(EventType::MessageCreated), 0);

        router.clear();
        assert_eq!(router.handler_count(EventType::ThreadArchived), 0);
        assert_eq!(router.route_text(r#"{"event":"ThreadArchived"}"#), 0);
        assert!(log.lock().unwrap().is_empty());
    }
}
