//! Session registry
//!
//! Per-thread ownership state shared by the relay, the lifecycle controller
//! and the session loops. All state lives behind one mutex so every
//! transition (browsing → spawning → active → recently closed) is a single
//! atomic step, and TTL-bearing entries expire lazily on read. No I/O ever
//! happens while the lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::browse::BrowsingSession;
use crate::config::RegistryTtls;
use crate::error::BridgeError;
use crate::lifecycle::{PendingQuestion, SessionCommand};
use crate::types::{ChatKey, OutputMode, ThreadState};

// ============ Clock ============

/// Time source for TTL checks
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Tokio's clock; follows `tokio::time::pause` in tests
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-driven clock for deterministic TTL tests
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============ Entries ============

/// Registry view of a running session. The process handle itself stays
/// inside the session task; the registry only holds its command channel.
#[derive(Debug, Clone)]
pub struct ActiveEntry {
    pub session_id: String,
    pub chat_id: String,
    pub machine: String,
    pub path: String,
    pub engine: String,
    pub output_mode: OutputMode,
    /// Unix millis
    pub started_at: i64,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
}

#[derive(Debug)]
struct Touched<T> {
    value: T,
    at: Instant,
}

#[derive(Debug, Default)]
struct State {
    browsing: HashMap<String, Touched<BrowsingSession>>,
    spawning: HashMap<String, Instant>,
    active: HashMap<String, ActiveEntry>,
    recently_closed: HashMap<String, Instant>,
    suppress_next: HashMap<ChatKey, Instant>,
    pending_questions: HashMap<String, PendingQuestion>,
}

// ============ Registry ============

pub struct SessionRegistry {
    state: Mutex<State>,
    ttls: RegistryTtls,
    clock: Arc<dyn Clock>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistryTtls::default())
    }
}

impl SessionRegistry {
    pub fn new(ttls: RegistryTtls) -> Self {
        Self::with_clock(ttls, Arc::new(TokioClock))
    }

    pub fn with_clock(ttls: RegistryTtls, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ttls,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop this thread's expired entries
    fn expire(&self, state: &mut State, thread_id: &str, now: Instant) {
        if let Some(entry) = state.browsing.get(thread_id) {
            if now.duration_since(entry.at) >= self.ttls.browsing {
                debug!(thread = %thread_id, "Browsing session expired");
                state.browsing.remove(thread_id);
            }
        }
        if let Some(at) = state.spawning.get(thread_id) {
            if now.duration_since(*at) >= self.ttls.spawning {
                debug!(thread = %thread_id, "Spawning marker expired");
                state.spawning.remove(thread_id);
            }
        }
        if let Some(at) = state.recently_closed.get(thread_id) {
            if now.duration_since(*at) >= self.ttls.recently_closed {
                state.recently_closed.remove(thread_id);
            }
        }
    }

    fn classify_locked(&self, state: &mut State, thread_id: &str) -> ThreadState {
        let now = self.clock.now();
        self.expire(state, thread_id, now);
        if state.active.contains_key(thread_id) {
            ThreadState::Active
        } else if state.spawning.contains_key(thread_id) {
            ThreadState::Spawning
        } else if state.browsing.contains_key(thread_id) {
            ThreadState::Browsing
        } else if state.recently_closed.contains_key(thread_id) {
            ThreadState::RecentlyClosed
        } else {
            ThreadState::None
        }
    }

    /// Current owner state of a thread; exactly one value at any instant
    pub fn classify(&self, thread_id: &str) -> ThreadState {
        let mut state = self.lock();
        self.classify_locked(&mut state, thread_id)
    }

    // ---------- browsing ----------

    /// Install a browsing session, replacing any previous one for the thread.
    /// Fails while a session is spawning or running.
    pub fn start_browsing(&self, session: BrowsingSession) -> Result<Option<BrowsingSession>, BridgeError> {
        let mut state = self.lock();
        let thread_id = session.thread_id.clone();
        match self.classify_locked(&mut state, &thread_id) {
            ThreadState::Active | ThreadState::Spawning => {
                return Err(BridgeError::SessionExists(thread_id));
            }
            _ => {}
        }
        state.recently_closed.remove(&thread_id);
        let now = self.clock.now();
        let previous = state
            .browsing
            .insert(thread_id, Touched { value: session, at: now })
            .map(|t| t.value);
        Ok(previous)
    }

    pub fn browsing(&self, thread_id: &str) -> Option<BrowsingSession> {
        let mut state = self.lock();
        let now = self.clock.now();
        self.expire(&mut state, thread_id, now);
        state.browsing.get(thread_id).map(|t| t.value.clone())
    }

    /// Replace the stored browsing session and refresh its TTL. Returns false
    /// when the session expired or was cancelled meanwhile.
    pub fn update_browsing(&self, session: BrowsingSession) -> bool {
        let mut state = self.lock();
        let now = self.clock.now();
        self.expire(&mut state, &session.thread_id, now);
        match state.browsing.get_mut(&session.thread_id) {
            Some(entry) => {
                entry.value = session;
                entry.at = now;
                true
            }
            None => false,
        }
    }

    pub fn cancel_browsing(&self, thread_id: &str) -> Option<BrowsingSession> {
        let mut state = self.lock();
        let now = self.clock.now();
        self.expire(&mut state, thread_id, now);
        state.browsing.remove(thread_id).map(|t| t.value)
    }

    // ---------- spawning ----------

    /// Move a thread from browsing to spawning in one step. Returns the
    /// browsing session that was consumed, or `None` if there was none.
    pub fn enter_spawning(&self, thread_id: &str) -> Result<Option<BrowsingSession>, BridgeError> {
        let mut state = self.lock();
        match self.classify_locked(&mut state, thread_id) {
            ThreadState::Active | ThreadState::Spawning => {
                return Err(BridgeError::SessionExists(thread_id.to_string()));
            }
            _ => {}
        }
        let browsing = state.browsing.remove(thread_id).map(|t| t.value);
        if browsing.is_some() {
            let now = self.clock.now();
            state.spawning.insert(thread_id.to_string(), now);
        }
        Ok(browsing)
    }

    pub fn exit_spawning(&self, thread_id: &str) -> bool {
        self.lock().spawning.remove(thread_id).is_some()
    }

    // ---------- active ----------

    /// Install the active session and clear spawning in the same step
    pub fn set_active(&self, thread_id: &str, entry: ActiveEntry) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if state.active.contains_key(thread_id) {
            return Err(BridgeError::SessionExists(thread_id.to_string()));
        }
        state.spawning.remove(thread_id);
        state.browsing.remove(thread_id);
        state.recently_closed.remove(thread_id);
        state.pending_questions.remove(thread_id);
        state.active.insert(thread_id.to_string(), entry);
        Ok(())
    }

    pub fn active(&self, thread_id: &str) -> Option<ActiveEntry> {
        self.lock().active.get(thread_id).cloned()
    }

    pub fn is_current(&self, thread_id: &str, session_id: &str) -> bool {
        self.lock()
            .active
            .get(thread_id)
            .is_some_and(|e| e.session_id == session_id)
    }

    /// Remove the active entry if it still belongs to `session_id`
    pub fn clear_active(&self, thread_id: &str, session_id: &str) -> Option<ActiveEntry> {
        let mut state = self.lock();
        if !state
            .active
            .get(thread_id)
            .is_some_and(|e| e.session_id == session_id)
        {
            return None;
        }
        state.pending_questions.remove(thread_id);
        state.active.remove(thread_id)
    }

    pub fn mark_closed(&self, thread_id: &str) {
        let now = self.clock.now();
        self.lock().recently_closed.insert(thread_id.to_string(), now);
    }

    /// Mark recently closed and clear active as one step, so the thread is
    /// never observed as unowned while stray output may still arrive
    pub fn close_active(&self, thread_id: &str, session_id: &str) -> Option<ActiveEntry> {
        let mut state = self.lock();
        if !state
            .active
            .get(thread_id)
            .is_some_and(|e| e.session_id == session_id)
        {
            return None;
        }
        let now = self.clock.now();
        state.recently_closed.insert(thread_id.to_string(), now);
        state.pending_questions.remove(thread_id);
        state.active.remove(thread_id)
    }

    /// Snapshot of every running session
    pub fn active_sessions(&self) -> Vec<(String, ActiveEntry)> {
        self.lock()
            .active
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ---------- suppression ----------

    /// Ask the conversational layer to skip its next reply in this thread
    pub fn request_suppress(&self, key: ChatKey) {
        let now = self.clock.now();
        self.lock().suppress_next.insert(key, now);
    }

    /// Consume a pending suppression; true at most once per request
    pub fn take_suppress(&self, key: &ChatKey) -> bool {
        let now = self.clock.now();
        match self.lock().suppress_next.remove(key) {
            Some(at) => now.duration_since(at) < self.ttls.suppress,
            None => false,
        }
    }

    // ---------- pending questions ----------

    pub fn set_pending_question(&self, thread_id: &str, question: PendingQuestion) {
        self.lock()
            .pending_questions
            .insert(thread_id.to_string(), question);
    }

    pub fn pending_question(&self, thread_id: &str) -> Option<PendingQuestion> {
        self.lock().pending_questions.get(thread_id).cloned()
    }

    pub fn take_pending_question(&self, thread_id: &str) -> Option<PendingQuestion> {
        self.lock().pending_questions.remove(thread_id)
    }

    /// Drop every expired entry. Correctness never depends on this; it only
    /// bounds memory for threads that are never looked at again.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let before = state.browsing.len()
            + state.spawning.len()
            + state.recently_closed.len()
            + state.suppress_next.len();

        let ttls = self.ttls;
        state.browsing.retain(|_, t| now.duration_since(t.at) < ttls.browsing);
        state.spawning.retain(|_, at| now.duration_since(*at) < ttls.spawning);
        state
            .recently_closed
            .retain(|_, at| now.duration_since(*at) < ttls.recently_closed);
        state
            .suppress_next
            .retain(|_, at| now.duration_since(*at) < ttls.suppress);

        let after = state.browsing.len()
            + state.spawning.len()
            + state.recently_closed.len()
            + state.suppress_next.len();
        before - after
    }
}
