use std::sync::{Arc, RwLock};

use castgate_protocol::SessionInfo;
use dashmap::DashMap;
use rand::Rng;
use uuid::Uuid;

/// Shared, individually locked view of one caster's session.
///
/// Viewers hold clones of the handle rather than copies of the data, so
/// updates made by the caster side are visible to every paired viewer.
#[derive(Debug, Clone)]
pub struct SessionHandle(Arc<RwLock<SessionInfo>>);

impl SessionHandle {
    pub fn new(info: SessionInfo) -> Self {
        Self(Arc::new(RwLock::new(info)))
    }

    /// Run `f` against the current state under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&SessionInfo) -> R) -> R {
        let guard = self.0.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Run `f` against the current state under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionInfo) -> R) -> R {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn snapshot(&self) -> SessionInfo {
        self.read(SessionInfo::clone)
    }

    #[cfg(test)]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Registry of live caster sessions keyed by caster connection id.
#[derive(Default)]
pub struct SessionDirectory {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: SessionInfo) -> SessionHandle {
        let handle = SessionHandle::new(info);
        let caster_id = handle.read(|s| s.caster_id);
        self.sessions.insert(caster_id, handle.clone());
        tracing::debug!(%caster_id, "Session registered in directory");
        handle
    }

    pub fn remove(&self, caster_id: Uuid) -> Option<SessionHandle> {
        self.sessions.remove(&caster_id).map(|(_, handle)| handle)
    }

    pub fn lookup(&self, caster_id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&caster_id).map(|e| e.value().clone())
    }

    /// Find the session whose attended code matches. Whitespace is ignored
    /// on both sides since codes are often displayed as "123 456".
    pub fn find_by_attended_code(&self, code: &str) -> Option<SessionHandle> {
        let wanted = strip_whitespace(code);
        if wanted.is_empty() {
            return None;
        }
        self.sessions
            .iter()
            .find(|e| e.value().read(|s| strip_whitespace(&s.attended_session_id) == wanted))
            .map(|e| e.value().clone())
    }

    /// Clone every handle out of the map. Callers inspect them without
    /// holding any shard lock.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.handles().iter().map(SessionHandle::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Generate a 6-digit attended code not currently in use.
    pub fn generate_attended_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code = format!("{:06}", rng.gen_range(0..1_000_000u32));
            if self.find_by_attended_code(&code).is_none() {
                return code;
            }
        }
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}
