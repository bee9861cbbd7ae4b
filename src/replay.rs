// ABOUTME: Replays a recorded transcript of inbound frames through the event router
// ABOUTME: Rebuilds thread state offline so protocol captures can be inspected and diffed

use anyhow::{Context, Result};
use chatwire_core::events::{ThreadEvent, ThreadList, THREAD_EVENT_TYPES};
use chatwire_core::{ChatThread, EventBlueprint, EventRouter, EventType, ThreadState, ThreadStateMachine};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Outcome of one replay
#[derive(Debug, Serialize)]
pub struct ReplayReport {
    /// Non-blank, non-comment lines read
    pub frames: usize,
    /// Frames that reached at least one handler
    pub dispatched: usize,
    /// Frames with a type no handler is registered for
    pub ignored: usize,
    /// Lines that were not a valid envelope
    pub malformed: usize,
    /// Events whose handler rejected them (e.g. a closed thread)
    pub rejected: usize,
    pub threads: Vec<ChatThread>,
}

type Threads = Arc<Mutex<HashMap<Uuid, ThreadStateMachine>>>;

/// Router wired to an in-memory thread registry
pub struct Replayer {
    router: EventRouter,
    threads: Threads,
    rejected: Arc<AtomicUsize>,
}

impl Replayer {
    pub fn new() -> Self {
        let router = EventRouter::new();
        let threads: Threads = Arc::default();
        let rejected = Arc::new(AtomicUsize::new(0));

        for event_type in THREAD_EVENT_TYPES {
            let threads = Arc::clone(&threads);
            let rejected = Arc::clone(&rejected);
            router.register(event_type, move |payload: &Value| -> anyhow::Result<()> {
                let result = apply_event(&threads, event_type, payload);
                if result.is_err() {
                    rejected.fetch_add(1, Ordering::Relaxed);
                }
                result
            });
        }

        let list_threads = Arc::clone(&threads);
        router.register(EventType::ThreadListFetched, move |payload: &Value| -> anyhow::Result<()> {
            let list: ThreadList = serde_json::from_value(payload.clone())?;
            let mut registry = list_threads.lock().unwrap_or_else(|e| e.into_inner());
            for summary in list.threads {
                registry.entry(summary.id).or_insert_with(|| {
                    let mut thread = ChatThread::new(summary.id, ThreadState::Received);
                    thread.name = summary.name;
                    ThreadStateMachine::from_server(thread)
                });
            }
            Ok(())
        });

        Self {
            router,
            threads,
            rejected,
        }
    }

    /// Replay every line of `reader`. Blank lines and `#` comments are skipped.
    pub fn replay<R: BufRead>(self, reader: R) -> Result<ReplayReport> {
        let mut report = ReplayReport {
            frames: 0,
            dispatched: 0,
            ignored: 0,
            malformed: 0,
            rejected: 0,
            threads: Vec::new(),
        };

        for (index, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read transcript line {}", index + 1))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            report.frames += 1;

            match EventBlueprint::parse(line) {
                Ok(envelope) => {
                    if self.router.dispatch(&envelope) > 0 {
                        report.dispatched += 1;
                    } else {
                        report.ignored += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(line = index + 1, error = %e, "Skipping malformed transcript line");
                    report.malformed += 1;
                }
            }
        }

        report.rejected = self.rejected.load(Ordering::Relaxed);
        let mut threads: Vec<ChatThread> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(ThreadStateMachine::snapshot)
            .collect();
        threads.sort_by_key(|t| t.id);
        report.threads = threads;
        Ok(report)
    }
}

impl Default for Replayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Replay a JSON-lines transcript file
pub fn replay_file(path: &Path) -> Result<ReplayReport> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    tracing::info!(path = %path.display(), "Replaying transcript");
    Replayer::new().replay(std::io::BufReader::new(file))
}

fn apply_event(threads: &Threads, event_type: EventType, payload: &Value) -> anyhow::Result<()> {
    let Some(event) = ThreadEvent::decode(event_type, payload)? else {
        return Ok(());
    };
    let thread_id = event.thread_id();

    let machine = {
        let mut registry = threads.lock().unwrap_or_else(|e| e.into_inner());
        match registry.get(&thread_id) {
            Some(machine) => machine.clone(),
            None if matches!(event, ThreadEvent::Recovered { .. } | ThreadEvent::MessageCreated { .. }) => {
                let machine = ThreadStateMachine::from_server(ChatThread::new(thread_id, ThreadState::Received));
                registry.insert(thread_id, machine.clone());
                machine
            }
            None => {
                tracing::debug!(thread_id = %thread_id, event_type = ?event_type, "Event for unknown thread");
                return Ok(());
            }
        }
    };

    machine.apply(event)?;
    Ok(())
}
