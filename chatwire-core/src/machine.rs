// ABOUTME: ThreadStateMachine is the single writer of one chat thread.
// ABOUTME: Every mutation copies the snapshot, stores it and notifies subscribers synchronously.

use crate::error::{ChatError, Result};
use crate::events::ThreadEvent;
use crate::thread::{Agent, ChatThread, CustomField, Message, ThreadState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

type Listener = Arc<dyn Fn(&ChatThread) + Send + Sync>;

struct Inner {
    thread: Mutex<ChatThread>,
    /// Bumped under the `thread` lock on every stored snapshot
    revision: AtomicU64,
    /// Last revision handed to listeners; held for the whole delivery
    delivered: Mutex<u64>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

impl Inner {
    fn remove_listener(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(listener_id, _)| *listener_id != id);
    }
}

/// Cloneable handle; clones share the same thread
#[derive(Clone)]
pub struct ThreadStateMachine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ThreadStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let thread = self.snapshot();
        f.debug_struct("ThreadStateMachine")
            .field("id", &thread.id)
            .field("state", &thread.state)
            .finish()
    }
}

impl ThreadStateMachine {
    fn with_state(mut thread: ChatThread, state: ThreadState) -> Self {
        thread.state = state;
        Self {
            inner: Arc::new(Inner {
                thread: Mutex::new(thread),
                revision: AtomicU64::new(0),
                delivered: Mutex::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// A thread created on this device, starting in `Pending`
    pub fn new_local(thread: ChatThread) -> Self {
        Self::with_state(thread, ThreadState::Pending)
    }

    /// A thread the server told us about, starting in `Received`
    pub fn from_server(thread: ChatThread) -> Self {
        Self::with_state(thread, ThreadState::Received)
    }

    pub fn id(&self) -> Uuid {
        self.lock().id
    }

    pub fn state(&self) -> ThreadState {
        self.lock().state
    }

    pub fn snapshot(&self) -> ChatThread {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChatThread> {
        self.inner.thread.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver every future snapshot to `listener` until the subscription is dropped
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChatThread) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            machine: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Store `next` as the current snapshot. Call with the thread lock held.
    fn store(&self, current: &mut ChatThread, next: &ChatThread) -> u64 {
        *current = next.clone();
        self.inner.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Deliver `thread` unless a newer snapshot already went out.
    ///
    /// Deliveries are serialised, so listeners see snapshots in store order
    /// and the last one they see is the current one. A listener must not
    /// mutate the machine that is notifying it.
    fn notify(&self, revision: u64, thread: &ChatThread) {
        let mut delivered = self.inner.delivered.lock().unwrap_or_else(|e| e.into_inner());
        if revision <= *delivered {
            return;
        }
        *delivered = revision;

        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(thread);
        }
    }

    /// Apply `change` to a copy of the current snapshot and publish it
    fn mutate<F>(&self, change: F) -> Result<ChatThread>
    where
        F: FnOnce(&mut ChatThread) -> Result<()>,
    {
        let (revision, next) = {
            let mut current = self.lock();
            if current.state.is_closed() {
                return Err(ChatError::ThreadClosed(current.id));
            }
            let mut next = current.clone();
            change(&mut next)?;
            let revision = self.store(&mut current, &next);
            (revision, next)
        };
        self.notify(revision, &next);
        Ok(next)
    }

    /// Move to `to`. Repeating the current state is a no-op.
    pub fn transition(&self, to: ThreadState) -> Result<()> {
        let (revision, next) = {
            let mut current = self.lock();
            if current.state == to {
                return Ok(());
            }
            if !current.state.can_transition_to(to) {
                return Err(ChatError::InvalidTransition {
                    from: current.state,
                    to,
                });
            }
            tracing::debug!(thread_id = %current.id, from = ?current.state, to = ?to, "Thread transition");
            let mut next = current.clone();
            next.state = to;
            let revision = self.store(&mut current, &next);
            (revision, next)
        };
        self.notify(revision, &next);
        Ok(())
    }

    /// Walk whatever edges remain to `Ready`
    pub fn advance_to_ready(&self) -> Result<()> {
        match self.state() {
            ThreadState::Pending | ThreadState::Loaded => self.transition(ThreadState::Ready),
            ThreadState::Received => {
                self.transition(ThreadState::Loaded)?;
                self.transition(ThreadState::Ready)
            }
            ThreadState::Ready => Ok(()),
            ThreadState::Closed => Err(ChatError::ThreadClosed(self.id())),
        }
    }

    /// Append messages in arrival order; a known id is replaced in place
    pub fn add_messages(&self, messages: Vec<Message>) -> Result<ChatThread> {
        self.mutate(|thread| {
            for message in messages {
                merge_message(&mut thread.messages, message);
            }
            Ok(())
        })
    }

    /// Insert an older page before the current messages
    pub fn prepend_messages(&self, older: Vec<Message>, scroll_token: String) -> Result<ChatThread> {
        self.mutate(|thread| {
            let mut page: Vec<Message> = Vec::with_capacity(older.len());
            for message in older {
                if let Some(existing) = thread.messages.iter_mut().find(|m| m.id == message.id) {
                    *existing = message;
                } else {
                    merge_message(&mut page, message);
                }
            }
            page.append(&mut thread.messages);
            thread.messages = page;
            thread.scroll_token = scroll_token;
            Ok(())
        })
    }

    pub fn archive(&self) -> Result<ChatThread> {
        self.mutate(|thread| {
            thread.can_add_more_messages = false;
            Ok(())
        })
    }

    pub fn update_scroll_token(&self, scroll_token: String) -> Result<ChatThread> {
        self.mutate(|thread| {
            thread.scroll_token = scroll_token;
            Ok(())
        })
    }

    pub fn assign_agent(&self, agent: Option<Agent>) -> Result<ChatThread> {
        self.mutate(|thread| {
            thread.assigned_agent = agent;
            Ok(())
        })
    }

    pub fn set_agent_typing(&self, typing: bool) -> Result<ChatThread> {
        self.mutate(|thread| {
            thread.agent_typing = typing;
            if let Some(agent) = thread.assigned_agent.as_mut() {
                agent.is_typing = typing;
            }
            Ok(())
        })
    }

    pub fn set_position_in_queue(&self, position: Option<u32>) -> Result<ChatThread> {
        self.mutate(|thread| {
            thread.position_in_queue = position;
            Ok(())
        })
    }

    pub fn set_agent_available(&self, available: Option<bool>) -> Result<ChatThread> {
        self.mutate(|thread| {
            thread.agent_available = available;
            Ok(())
        })
    }

    pub fn update_fields(&self, fields: Vec<CustomField>) -> Result<ChatThread> {
        self.mutate(|thread| {
            for field in fields {
                thread.fields.upsert(field);
            }
            Ok(())
        })
    }

    pub fn set_name(&self, name: Option<String>) -> Result<ChatThread> {
        self.mutate(|thread| {
            thread.name = name;
            Ok(())
        })
    }

    /// Mark every inbound message as seen
    pub fn mark_read(&self) -> Result<ChatThread> {
        self.mutate(|thread| {
            for message in &mut thread.messages {
                message.seen_by_customer = true;
            }
            Ok(())
        })
    }

    /// Terminal. Closing a closed thread is a no-op.
    pub fn close(&self) -> Result<()> {
        self.transition(ThreadState::Closed)
    }

    /// Reduce a decoded server event into mutations
    pub fn apply(&self, event: ThreadEvent) -> Result<()> {
        match event {
            ThreadEvent::MessageCreated { message, .. } => {
                self.add_messages(vec![message])?;
            }
            ThreadEvent::Recovered {
                name,
                messages,
                agent,
                scroll_token,
                fields,
                ..
            } => {
                self.mutate(|thread| {
                    if name.is_some() {
                        thread.name = name;
                    }
                    for message in messages {
                        merge_message(&mut thread.messages, message);
                    }
                    thread.assigned_agent = agent;
                    thread.scroll_token = scroll_token;
                    for field in fields {
                        thread.fields.upsert(field);
                    }
                    Ok(())
                })?;
                self.advance_to_ready()?;
            }
            ThreadEvent::MoreMessagesLoaded {
                messages,
                scroll_token,
                ..
            } => {
                self.prepend_messages(messages, scroll_token)?;
            }
            ThreadEvent::MetadataLoaded { name, .. } => {
                if name.is_some() {
                    self.set_name(name)?;
                }
                if self.state() == ThreadState::Received {
                    self.transition(ThreadState::Loaded)?;
                }
            }
            ThreadEvent::Archived { .. } => {
                self.archive()?;
            }
            ThreadEvent::Updated { name, .. } => {
                if name.is_some() {
                    self.set_name(name)?;
                }
            }
            ThreadEvent::AgentChanged { agent, .. } => {
                self.assign_agent(agent)?;
            }
            ThreadEvent::AgentTyping { typing, .. } => {
                self.set_agent_typing(typing)?;
            }
            ThreadEvent::PositionInQueue {
                position,
                agent_available,
                ..
            } => {
                self.mutate(|thread| {
                    thread.position_in_queue = Some(position);
                    if agent_available.is_some() {
                        thread.agent_available = agent_available;
                    }
                    Ok(())
                })?;
            }
            ThreadEvent::ContactClosed { .. } => {
                self.close()?;
            }
        }
        Ok(())
    }
}

fn merge_message(messages: &mut Vec<Message>, message: Message) {
    match messages.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

/// Live registration of a snapshot listener. Dropping it unregisters.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    machine: Weak<Inner>,
    id: u64,
}

impl Subscription {
    /// Stop further deliveries. A delivery already in progress may still complete.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.machine.upgrade() {
            inner.remove_listener(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ChatThread;

    fn ready_machine() -> ThreadStateMachine {
        let machine = ThreadStateMachine::new_local(ChatThread::new(Uuid::new_v4(), ThreadState::Pending));
        machine.transition(ThreadState::Ready).unwrap();
        machine
    }

    #[test]
    fn test_local_thread_goes_straight_to_ready() {
        let machine = ready_machine();
        assert_eq!(machine.state(), ThreadState::Ready);
    }

    #[test]
    fn test_server_thread_walks_through_loaded() {
        let machine = ThreadStateMachine::from_server(ChatThread::new(Uuid::new_v4(), ThreadState::Pending));
        assert_eq!(machine.state(), ThreadState::Received);
        assert!(matches!(
            machine.transition(ThreadState::Ready),
            Err(ChatError::InvalidTransition { from: ThreadState::Received, to: ThreadState::Ready })
        ));
        machine.advance_to_ready().unwrap();
        assert_eq!(machine.state(), ThreadState::Ready);
    }

    #[test]
    fn test_closed_rejects_mutations() {
        let machine = ready_machine();
        machine.close().unwrap();
        machine.close().unwrap();
        let id = machine.id();
        assert_eq!(machine.archive().unwrap_err(), ChatError::ThreadClosed(id));
        assert!(matches!(
            machine.transition(ThreadState::Ready),
            Err(ChatError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_add_messages_replaces_known_ids() {
        let machine = ready_machine();
        let id = machine.id();
        let first = Message::outbound_text(id, "one");
        let second = Message::outbound_text(id, "two");
        machine.add_messages(vec![first.clone(), second.clone()]).unwrap();

        let mut echoed = first.clone();
        echoed.seen_by_customer = false;
        let thread = machine.add_messages(vec![echoed.clone()]).unwrap();
        assert_eq!(thread.messages, vec![echoed, second]);
    }

    #[test]
    fn test_prepend_keeps_older_page_first() {
        let machine = ready_machine();
        let id = machine.id();
        let newest = Message::inbound_text(id, "newest");
        machine.add_messages(vec![newest.clone()]).unwrap();

        let old_a = Message::inbound_text(id, "a");
        let old_b = Message::inbound_text(id, "b");
        let thread = machine
            .prepend_messages(vec![old_a.clone(), old_b.clone()], String::new())
            .unwrap();
        assert_eq!(thread.messages, vec![old_a, old_b, newest]);
        assert!(!thread.has_more_messages_to_load());
    }

    #[test]
    fn test_subscription_receives_until_cancelled() {
        let machine = ready_machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            machine.subscribe(move |t| seen.lock().unwrap().push(t.scroll_token.clone()))
        };

        machine.update_scroll_token("p1".into()).unwrap();
        machine.update_scroll_token("p2".into()).unwrap();
        sub.cancel();
        machine.update_scroll_token("p3".into()).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["p1", "p2"]);
    }

    #[test]
    fn test_concurrent_writers_deliver_latest_snapshot_last() {
        use std::sync::mpsc;
        use std::time::Duration;

        let machine = ready_machine();
        let delivered = Arc::new(Mutex::new(Vec::<String>::new()));
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);

        let _sub = {
            let delivered = Arc::clone(&delivered);
            machine.subscribe(move |t| {
                if t.scroll_token == "A" {
                    entered_tx.lock().unwrap().send(()).unwrap();
                    release_rx.lock().unwrap().recv().unwrap();
                }
                delivered.lock().unwrap().push(t.scroll_token.clone());
            })
        };

        let first = {
            let machine = machine.clone();
            std::thread::spawn(move || machine.update_scroll_token("A".into()).unwrap())
        };
        entered_rx.recv().unwrap();

        // "A" is stuck in its listener while "B" is stored
        let second = {
            let machine = machine.clone();
            std::thread::spawn(move || machine.update_scroll_token("B".into()).unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();
        first.join().unwrap();
        second.join().unwrap();

        assert_eq!(machine.snapshot().scroll_token, "B");
        assert_eq!(delivered.lock().unwrap().last().map(String::as_str), Some("B"));
        assert_eq!(*delivered.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_stale_revision_is_not_delivered() {
        let machine = ready_machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            machine.subscribe(move |t| seen.lock().unwrap().push(t.state))
        };

        machine.close().unwrap();
        let stale = ChatThread::new(machine.id(), ThreadState::Ready);
        machine.notify(1, &stale);

        assert_eq!(*seen.lock().unwrap(), vec![ThreadState::Closed]);
    }

    #[test]
    fn test_queue_updates_leave_messages_alone() {
        let machine = ready_machine();
        machine
            .add_messages(vec![Message::inbound_text(machine.id(), "hi")])
            .unwrap();
        let before = machine.snapshot().messages;
        machine.set_position_in_queue(Some(3)).unwrap();
        let thread = machine.set_agent_available(Some(false)).unwrap();
        assert_eq!(thread.messages, before);
        assert_eq!(thread.position_in_queue, Some(3));
        assert_eq!(thread.agent_available, Some(false));
    }
}
