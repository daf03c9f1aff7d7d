//! Source identities.
//!
//! An identity is the logical key of an acquisition target: a remote
//! locator or a local path, optionally refined by a stable content id
//! (e.g. the platform's video id) so that differently-spelled URLs for
//! the same content share a cache slot.

use serde::{Deserialize, Serialize};

/// Whether the source is fetched from a remote service or read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Remote,
    Local,
}

/// The logical key of an acquisition target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceIdentity {
    /// Remote URL or local filesystem path.
    pub locator: String,
    /// Stable content id when the platform provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub kind: SourceKind,
}

impl SourceIdentity {
    /// Identity for a remote locator (URL).
    pub fn remote(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            content_id: None,
            kind: SourceKind::Remote,
        }
    }

    /// Identity for a local file path.
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            locator: path.into(),
            content_id: None,
            kind: SourceKind::Local,
        }
    }

    /// Refine with a stable content id.
    pub fn with_content_id(mut self, id: impl Into<String>) -> Self {
        self.content_id = Some(id.into());
        self
    }

    pub fn is_local(&self) -> bool {
        self.kind == SourceKind::Local
    }

    /// Stable cache/dedup key. The content id wins over the raw locator
    /// so that URL variants of the same content collapse to one slot.
    pub fn cache_key(&self) -> String {
        match (&self.content_id, self.kind) {
            (Some(id), SourceKind::Remote) => format!("remote:{id}"),
            (Some(id), SourceKind::Local) => format!("local:{id}"),
            (None, SourceKind::Remote) => format!("remote:{}", self.locator),
            (None, SourceKind::Local) => format!("local:{}", self.locator),
        }
    }
}

impl std::fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.locator)
    }
}
