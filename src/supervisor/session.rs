// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! ServiceSession persistence. Whole-file atomic replace on every save.

use std::path::{Path, PathBuf};

use chrono::Utc;

use super::types::{ServiceSession, SupervisorError};
use crate::fsutil::{atomic_write_json, read_json_or_default};

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the session; a missing or corrupt file yields a fresh one.
    pub fn load(&self) -> ServiceSession {
        read_json_or_default(&self.path)
    }

    /// Stamp `updated_at` and write.
    pub fn save(&self, session: &mut ServiceSession) -> Result<(), SupervisorError> {
        session.updated_at = Utc::now();
        atomic_write_json(&self.path, session).map_err(|source| SupervisorError::Session {
            path: self.path.display().to_string(),
            source,
        })
    }
}
