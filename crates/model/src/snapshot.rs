use crate::error::{ErrorKind, Result};
use crate::hash::ContentHash;
use crate::kind::{Capability, ObjectKind};
use crate::replacement::{ContentCategory, FileReplacement};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Appearance state of a single [`ObjectKind`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryData {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub files: BTreeSet<FileReplacement>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blobs: BTreeMap<Capability, String>,
}

impl CategoryData {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.blobs.is_empty()
    }

    pub fn blob(&self, capability: Capability) -> Option<&str> {
        self.blobs.get(&capability).map(String::as_str)
    }

    /// Capabilities this category carries data for, with a redraw added
    /// whenever something that needs one is present.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        let mut capabilities: BTreeSet<_> = self.blobs.keys().copied().collect();
        if !self.files.is_empty() {
            capabilities.insert(Capability::ModFiles);
        }
        if capabilities.iter().any(|c| c.requires_redraw()) {
            capabilities.insert(Capability::ForcedRedraw);
        }
        capabilities
    }
}

/// Serialized shape of a snapshot. Everything is kept in ordered maps so
/// that serialization, and therefore the content hash, is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotData {
    #[serde(default)]
    categories: BTreeMap<ObjectKind, CategoryData>,
}

/// Accumulates appearance state until [`finalize`](Self::finalize) turns it
/// into an immutable [`Snapshot`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuilder {
    data: SnapshotData,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, kind: ObjectKind, replacement: FileReplacement) -> Self {
        self.data.categories.entry(kind).or_default().files.insert(replacement);
        self
    }

    pub fn files(mut self, kind: ObjectKind, replacements: impl IntoIterator<Item = FileReplacement>) -> Self {
        self.data.categories.entry(kind).or_default().files.extend(replacements);
        self
    }

    pub fn blob(mut self, kind: ObjectKind, capability: Capability, data: impl Into<String>) -> Self {
        self.data.categories.entry(kind).or_default().blobs.insert(capability, data.into());
        self
    }

    /// Removes every game path belonging to a denied content category,
    /// dropping replacements that end up empty.
    pub fn strip_categories(mut self, denied: &BTreeSet<ContentCategory>) -> Self {
        if denied.is_empty() {
            return self;
        }
        for category in self.data.categories.values_mut() {
            category.files = category.files.iter().filter_map(|f| f.without_categories(denied)).collect();
        }
        self
    }

    /// Validates the accumulated state and computes the content hash once.
    ///
    /// Empty blobs count as absent and empty categories are dropped, so two
    /// snapshots describing the same appearance always hash the same.
    pub fn finalize(mut self) -> Result<Snapshot> {
        for category in self.data.categories.values_mut() {
            category.blobs.retain(|_, data| !data.is_empty());
            if let Some(capability) = category.blobs.keys().find(|c| !c.carries_blob()) {
                exn::bail!(ErrorKind::InvalidBlob(*capability));
            }
        }
        self.data.categories.retain(|_, category| !category.is_empty());
        let canonical = serde_json::to_vec(&self.data).or_raise(|| ErrorKind::Serialization)?;
        Ok(Snapshot { content_hash: ContentHash::of(canonical), data: self.data })
    }
}

/// Full appearance state of one participant at one instant.
///
/// Immutable: the content hash is computed by [`SnapshotBuilder::finalize`]
/// and two snapshots with equal hashes describe the same appearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SnapshotData", into = "SnapshotData")]
pub struct Snapshot {
    data: SnapshotData,
    content_hash: ContentHash,
}

impl Snapshot {
    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn category(&self, kind: ObjectKind) -> Option<&CategoryData> {
        self.data.categories.get(&kind)
    }

    pub fn categories(&self) -> impl Iterator<Item = (ObjectKind, &CategoryData)> {
        self.data.categories.iter().map(|(kind, data)| (*kind, data))
    }

    /// Every file replacement across all categories.
    pub fn files(&self) -> impl Iterator<Item = (ObjectKind, &FileReplacement)> {
        self.categories().flat_map(|(kind, data)| data.files.iter().map(move |f| (kind, f)))
    }

    pub fn is_empty(&self) -> bool {
        self.data.categories.is_empty()
    }

    /// Starts a new builder from this snapshot's state.
    pub fn to_builder(&self) -> SnapshotBuilder {
        SnapshotBuilder { data: self.data.clone() }
    }
}

impl TryFrom<SnapshotData> for Snapshot {
    type Error = ErrorKind;
    fn try_from(data: SnapshotData) -> std::result::Result<Self, Self::Error> {
        SnapshotBuilder { data }.finalize().map_err(|e| match &*e {
            ErrorKind::InvalidBlob(capability) => ErrorKind::InvalidBlob(*capability),
            _ => ErrorKind::Serialization,
        })
    }
}
impl From<Snapshot> for SnapshotData {
    fn from(snapshot: Snapshot) -> Self {
        snapshot.data
    }
}
