// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::session_store::ClientSession;

const SUBSCRIPTION_COUNTS_FILE: &str = "subscription_counts.json";

/// Everything a backend hands back on startup
#[derive(Debug, Default)]
pub struct StoredState {
    pub sessions: Vec<ClientSession>,
    pub subscription_counts: BTreeMap<String, u32>,
}

/// Durable storage behind the session store.
///
/// Calls are synchronous: the store writes through on every successful
/// commit and the engine never waits on anything else.
pub trait StorageBackend {
    fn load(&mut self) -> Result<StoredState>;

    fn store_session(&mut self, session: &ClientSession) -> Result<()>;

    fn remove_session(&mut self, client_id: &str) -> Result<()>;

    fn store_subscription_counts(&mut self, counts: &BTreeMap<String, u32>) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<String, ClientSession>,
    subscription_counts: BTreeMap<String, u32>,
}

/// Volatile backend. Clones share the same state, so a test can keep a
/// handle and inspect what the store wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_session(&self, client_id: &str) -> Option<ClientSession> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.sessions.get(client_id).cloned())
    }

    pub fn stored_subscription_count(&self, topic_name: &str) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.subscription_counts.get(topic_name).copied())
            .unwrap_or(0)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory backend lock poisoned"))?;
        Ok(f(&mut state))
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&mut self) -> Result<StoredState> {
        self.with_state(|state| {
            let mut sessions: Vec<ClientSession> = state.sessions.values().cloned().collect();
            sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));
            StoredState {
                sessions,
                subscription_counts: state.subscription_counts.clone(),
            }
        })
    }

    fn store_session(&mut self, session: &ClientSession) -> Result<()> {
        self.with_state(|state| {
            state
                .sessions
                .insert(session.client_id.clone(), session.clone());
        })
    }

    fn remove_session(&mut self, client_id: &str) -> Result<()> {
        self.with_state(|state| {
            state.sessions.remove(client_id);
        })
    }

    fn store_subscription_counts(&mut self, counts: &BTreeMap<String, u32>) -> Result<()> {
        self.with_state(|state| state.subscription_counts = counts.clone())
    }
}

/// JSON files under a base directory: `sessions/<client id>.json` and a
/// single subscription count file.
#[derive(Debug)]
pub struct FileBackend {
    base_dir: PathBuf,
    sessions_dir: PathBuf,
}

impl FileBackend {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let sessions_dir = base_dir.join("sessions");
        fs::create_dir_all(&sessions_dir)
            .with_context(|| format!("Failed to create dir {}", sessions_dir.display()))?;
        info!(
            "Initialized file storage backend at: {}",
            base_dir.display()
        );
        Ok(Self {
            base_dir,
            sessions_dir,
        })
    }

    /// Client ids may contain any byte; keep `[A-Za-z0-9-_]` and hex-escape the rest
    fn file_name(client_id: &str) -> String {
        let mut name = String::with_capacity(client_id.len() + 5);
        for b in client_id.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                name.push(b as char);
            } else {
                name.push_str(&format!("%{b:02X}"));
            }
        }
        name.push_str(".json");
        name
    }

    fn write_file_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to rename {}", tmp.display()))?;
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn load(&mut self) -> Result<StoredState> {
        let mut state = StoredState::default();

        for entry in fs::read_dir(&self.sessions_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path)?;
            match serde_json::from_slice::<ClientSession>(&content) {
                Ok(session) => state.sessions.push(session),
                Err(e) => warn!("Skipping unreadable session file {}: {e}", path.display()),
            }
        }
        state.sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let counts_path = self.base_dir.join(SUBSCRIPTION_COUNTS_FILE);
        if counts_path.exists() {
            let content = fs::read(&counts_path)?;
            state.subscription_counts = serde_json::from_slice(&content)
                .with_context(|| format!("Failed to parse {}", counts_path.display()))?;
        }

        debug!(
            "Loaded {} session file(s) from {}",
            state.sessions.len(),
            self.sessions_dir.display()
        );
        Ok(state)
    }

    fn store_session(&mut self, session: &ClientSession) -> Result<()> {
        let path = self.sessions_dir.join(Self::file_name(&session.client_id));
        Self::write_file_atomic(&path, session)
    }

    fn remove_session(&mut self, client_id: &str) -> Result<()> {
        let path = self.sessions_dir.join(Self::file_name(client_id));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    fn store_subscription_counts(&mut self, counts: &BTreeMap<String, u32>) -> Result<()> {
        Self::write_file_atomic(&self.base_dir.join(SUBSCRIPTION_COUNTS_FILE), counts)
    }
}
