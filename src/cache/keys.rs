//! Cache key naming and the persisted document layout.
//!
//! Entries are namespaced by class under `entries/`; the tag index, the tag
//! expiration table and the generation marker live under `meta/` so that bulk
//! entry clears never touch them.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ENTRIES_PREFIX: &str = "entries/";
pub const TAGS_DOCUMENT: &str = "meta/tags.json";
pub const TAG_EXPIRATIONS_DOCUMENT: &str = "meta/tag-expirations.json";
pub const GENERATION_MARKER: &str = "meta/generation.json";

const ENTRY_SUFFIX: &str = ".json";
const MAX_NAME_LEN: usize = 120;
const HASH_SUFFIX_BYTES: usize = 8;

/// Lifetime class of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryClass {
    /// Expires by age or tag invalidation only.
    Ephemeral,
    /// Previously rendered output; additionally wiped when the deployment generation changes.
    Durable,
}

impl EntryClass {
    pub const ALL: [EntryClass; 2] = [EntryClass::Ephemeral, EntryClass::Durable];

    pub fn other(self) -> Self {
        match self {
            Self::Ephemeral => Self::Durable,
            Self::Durable => Self::Ephemeral,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Durable => "durable",
        }
    }

    /// Storage prefix holding every entry of this class.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Ephemeral => "entries/ephemeral/",
            Self::Durable => "entries/durable/",
        }
    }
}

impl fmt::Display for EntryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an arbitrary cache key onto a storage-safe name.
///
/// Characters outside `[A-Za-z0-9-]` become `_`. Whenever the name had to be
/// altered (or is too long) it is suffixed with `_` and a digest of the raw
/// key, so distinct keys never share a name. Unaltered names contain no `_`.
pub fn sanitize_key(key: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || c == '-';
    let mut name: String = key
        .chars()
        .map(|c| if safe(c) { c } else { '_' })
        .collect();

    if !key.is_empty() && key.len() <= MAX_NAME_LEN && key.chars().all(safe) {
        return name;
    }

    let digest = Sha256::digest(key.as_bytes());
    let suffix = hex::encode(&digest[..HASH_SUFFIX_BYTES]);
    name.truncate(MAX_NAME_LEN - suffix.len() - 1);
    name.push('_');
    name.push_str(&suffix);
    name
}

/// Storage path of the entry document for `key`.
pub fn entry_path(class: EntryClass, key: &str) -> String {
    format!("{}{}{ENTRY_SUFFIX}", class.prefix(), sanitize_key(key))
}

/// Storage path for an already-sanitized entry name.
pub fn entry_path_for_name(class: EntryClass, name: &str) -> String {
    format!("{}{name}{ENTRY_SUFFIX}", class.prefix())
}

/// Recover the sanitized entry name from a listed storage path.
pub fn entry_name(class: EntryClass, path: &str) -> Option<&str> {
    path.strip_prefix(class.prefix())?
        .strip_suffix(ENTRY_SUFFIX)
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Route path a key stands for, if it is one (`/blog/post`).
pub fn route_path(key: &str) -> Option<&str> {
    key.starts_with('/').then_some(key)
}
