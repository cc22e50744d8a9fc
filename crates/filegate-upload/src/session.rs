//! Upload session state and the registry that owns it.
//!
//! The registry lock is a synchronous `RwLock` held only for map access,
//! never across I/O. Each session carries its own async `Mutex`; chunk
//! handlers lock that one for as long as their write discipline requires.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Receiving,
    Completed,
    Aborted,
}

#[derive(Debug)]
pub struct UploadSession {
    pub(crate) target_key: String,
    pub(crate) upload_id: String,
    pub(crate) total_parts: i32,
    /// Part number to etag, for the parts persisted so far.
    pub(crate) parts: BTreeMap<i32, String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) state: SessionState,
}

impl UploadSession {
    pub fn new(target_key: String, upload_id: String, total_parts: i32) -> Self {
        Self {
            target_key,
            upload_id,
            total_parts,
            parts: BTreeMap::new(),
            created_at: Utc::now(),
            state: SessionState::Receiving,
        }
    }

    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub fn total_parts(&self) -> i32 {
        self.total_parts
    }

    pub fn received_count(&self) -> i32 {
        self.parts.len() as i32
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Part numbers in `1..=total_parts` that have not been recorded.
    pub fn missing_parts(&self) -> Vec<i32> {
        (1..=self.total_parts)
            .filter(|n| !self.parts.contains_key(n))
            .collect()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: String, session: UploadSession) {
        self.sessions
            .write()
            .expect("session registry lock poisoned")
            .insert(session_id, Arc::new(Mutex::new(session)));
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Mutex<UploadSession>>> {
        self.sessions
            .read()
            .expect("session registry lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Removes and returns the session. Handlers holding an `Arc` from an
    /// earlier `get` can still observe the terminal state through it.
    pub fn remove(&self, session_id: &str) -> Option<Arc<Mutex<UploadSession>>> {
        self.sessions
            .write()
            .expect("session registry lock poisoned")
            .remove(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(String, Arc<Mutex<UploadSession>>)> {
        self.sessions
            .read()
            .expect("session registry lock poisoned")
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect()
    }
}
