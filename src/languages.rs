//! Language profiles: the source file name an image expects, the image
//! itself and its memory ceiling.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::Deserialize;

use crate::error::WorkspaceError;

/// Execution profile of one language.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LanguageProfile {
    /// Name the source is written under inside the workspace.
    pub file_name: String,
    /// Container image reference, e.g. "esolang/python3".
    pub image: String,
    /// Memory ceiling in megabytes (10^6 bytes).
    pub memory_limit_mb: u64,
}

impl LanguageProfile {
    /// Memory ceiling in bytes, as the runtime expects it.
    /// `None` if it does not fit an `i64`.
    pub fn memory_limit_bytes(&self) -> Option<i64> {
        self.memory_limit_mb
            .checked_mul(1_000_000)
            .and_then(|bytes| i64::try_from(bytes).ok())
    }

    /// Checks that `file_name` is a single plain path component, so the
    /// source can never land outside its workspace.
    pub fn validate_file_name(&self) -> Result<(), WorkspaceError> {
        let mut components = Path::new(&self.file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !self.file_name.contains('/') => Ok(()),
            _ => Err(WorkspaceError::InvalidFileName(self.file_name.clone())),
        }
    }
}

/// Read-only lookup table of language key → profile.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    profiles: BTreeMap<String, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn new(profiles: BTreeMap<String, LanguageProfile>) -> Self {
        Self { profiles }
    }

    /// Looks up a profile. Unknown keys are rejected here, before any
    /// workspace or container exists.
    pub fn lookup(&self, key: &str) -> Result<&LanguageProfile, WorkspaceError> {
        self.profiles
            .get(key)
            .ok_or_else(|| WorkspaceError::UnknownLanguage(key.to_string()))
    }

    /// Language keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LanguageProfile)> {
        self.profiles.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
