//! Active and finished profiling sessions
//!
//! The active list is read by the sampling side on every tick and changed
//! by the consumer on start/stop. One lock guards it; the fan-out of a path
//! holds that lock, so once `stop_profiling` returns the stopped profile
//! receives no further paths. Profiles are `Arc`s, so a profile handed to
//! the consumer stays valid however the lists change afterwards.

use aperture_shared::types::events::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::CpuProfile;
use crate::collector::code_entry::{CodeEntries, CodeEntry};

/// Outcome of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartProfilingStatus {
    Started,
    /// A session with this title is already running; nothing was created.
    AlreadyStarted,
    /// The simultaneous-session limit was reached; nothing was created.
    TooManyProfiles,
}

impl StartProfilingStatus {
    /// Whether the caller should go on sampling as if the start succeeded.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::TooManyProfiles)
    }
}

#[derive(Debug)]
pub struct CpuProfilesCollection {
    max_simultaneous_profiles: usize,
    current_profiles: Mutex<Vec<Arc<CpuProfile>>>,
    finished_profiles: Mutex<Vec<Arc<CpuProfile>>>,
    code_entries: CodeEntries,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CpuProfilesCollection {
    pub fn new(max_simultaneous_profiles: usize) -> Self {
        Self {
            max_simultaneous_profiles,
            current_profiles: Mutex::new(Vec::new()),
            finished_profiles: Mutex::new(Vec::new()),
            code_entries: CodeEntries::new(),
        }
    }

    pub fn max_simultaneous_profiles(&self) -> usize {
        self.max_simultaneous_profiles
    }

    pub fn start_profiling(&self, title: &str, record_samples: bool) -> StartProfilingStatus {
        let mut current = lock(&self.current_profiles);
        if current.len() >= self.max_simultaneous_profiles {
            warn!(
                "Refusing to start profile '{}': {} profiles already running",
                title,
                current.len()
            );
            return StartProfilingStatus::TooManyProfiles;
        }
        if current.iter().any(|p| p.title() == title) {
            debug!("Profile '{}' already running", title);
            return StartProfilingStatus::AlreadyStarted;
        }
        current.push(Arc::new(CpuProfile::new(title, record_samples)));
        info!("Started profile '{}' (record_samples={})", title, record_samples);
        StartProfilingStatus::Started
    }

    /// Stop the most recently started session titled `title`, or the most
    /// recently started session of all when `title` is empty.
    pub fn stop_profiling(&self, title: &str) -> Option<Arc<CpuProfile>> {
        let profile = {
            let mut current = lock(&self.current_profiles);
            let index = current
                .iter()
                .rposition(|p| title.is_empty() || p.title() == title)?;
            current.remove(index)
        };

        profile.finish();
        lock(&self.finished_profiles).push(profile.clone());
        info!("Stopped profile '{}'", profile.title());
        Some(profile)
    }

    /// True when exactly one session is running and `title` names it (or
    /// is empty).
    pub fn is_last_profile(&self, title: &str) -> bool {
        let current = lock(&self.current_profiles);
        match current.as_slice() {
            [only] => title.is_empty() || only.title() == title,
            _ => false,
        }
    }

    /// Remove a finished profile.
    ///
    /// # Panics
    ///
    /// Panics if `profile` is not in the finished set; callers own the
    /// bookkeeping of what they stopped.
    pub fn remove_profile(&self, profile: &Arc<CpuProfile>) {
        let mut finished = lock(&self.finished_profiles);
        let index = finished
            .iter()
            .position(|p| Arc::ptr_eq(p, profile))
            .unwrap_or_else(|| {
                panic!("profile '{}' is not a finished profile", profile.title())
            });
        finished.remove(index);
    }

    /// Drop every active and finished session.
    pub fn clear(&self) {
        lock(&self.current_profiles).clear();
        lock(&self.finished_profiles).clear();
    }

    pub fn finished_profiles(&self) -> Vec<Arc<CpuProfile>> {
        lock(&self.finished_profiles).clone()
    }

    pub fn finished_count(&self) -> usize {
        lock(&self.finished_profiles).len()
    }

    pub fn current_count(&self) -> usize {
        lock(&self.current_profiles).len()
    }

    /// Feed a resolved path to every active session.
    pub fn add_path_to_current_profiles(
        &self,
        timestamp: Timestamp,
        path: &[Option<Arc<CodeEntry>>],
        src_line: Option<u32>,
        update_stats: bool,
    ) {
        // Start/stop are rare next to sampling, so the list lock is held
        // for the whole fan-out.
        let current = lock(&self.current_profiles);
        for profile in current.iter() {
            profile.add_path(timestamp, path, src_line, update_stats);
        }
    }

    /// Register a code entry for the lifetime of the collection.
    pub fn new_code_entry(&self, entry: CodeEntry) -> Arc<CodeEntry> {
        self.code_entries.add(entry)
    }

    pub fn code_entries(&self) -> &CodeEntries {
        &self.code_entries
    }
}
