//! Generation sessions and their cancellation.
//!
//! Each accepted request gets a [`Session`]: an id and a cancellation token.
//! The dispatcher keeps every spawned session task in a [`SessionRegistry`]
//! until the task reports back, so superseding and shutdown are explicit.

use std::collections::HashMap;

use tokio::task::JoinHandle;
pub use tokio_util::sync::CancellationToken;

/// Unique identifier for a generation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    cancel_token: CancellationToken,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// A session cancelled together with `parent` (e.g. worker shutdown).
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            id: SessionId::new(),
            cancel_token: parent.child_token(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { words: usize },
    Cancelled,
    Failed(String),
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Sent by a session task when it finishes.
#[derive(Debug)]
pub struct SessionCompletion {
    pub id: SessionId,
    pub outcome: SessionOutcome,
}

struct ActiveSession {
    session: Session,
    task: JoinHandle<()>,
}

/// Session tasks that have been spawned and have not reported completion.
#[derive(Default)]
pub struct SessionRegistry {
    active: HashMap<SessionId, ActiveSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session, task: JoinHandle<()>) {
        self.active.insert(session.id(), ActiveSession { session, task });
    }

    /// Cancel every tracked session. Entries stay until their tasks report back.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for entry in self.active.values() {
            if !entry.session.is_cancelled() {
                entry.session.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Forget a session whose task has finished.
    pub fn complete(&mut self, id: SessionId) -> bool {
        self.active.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.active.contains_key(&id)
    }

    /// Cancel everything and wait for the tasks to unwind.
    pub async fn shutdown(&mut self) {
        self.cancel_all();
        for (id, entry) in self.active.drain() {
            if let Err(e) = entry.task.await {
                tracing::warn!(session = %id, error = %e, "Session task did not exit cleanly");
            }
        }
    }
}
