use derive_more::{Display, From};
use mirage_model::ContentCategory;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Display, From, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl From<&str> for GroupId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// What one pairing allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub paused: bool,
    pub disable_animations: bool,
    pub disable_sounds: bool,
    pub disable_vfx: bool,
}

impl PermissionSet {
    pub fn denied_categories(&self) -> BTreeSet<ContentCategory> {
        [
            (self.disable_animations, ContentCategory::Animation),
            (self.disable_sounds, ContentCategory::Sound),
            (self.disable_vfx, ContentCategory::Vfx),
        ]
        .into_iter()
        .filter_map(|(disabled, category)| disabled.then_some(category))
        .collect()
    }
}

/// How a peer is paired with us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PairingSource {
    Direct,
    Group(GroupId),
}

/// Every pairing between us and one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pairing {
    pub direct: Option<PermissionSet>,
    pub groups: BTreeMap<GroupId, PermissionSet>,
}

impl Pairing {
    pub fn set(&mut self, source: PairingSource, permissions: PermissionSet) {
        match source {
            PairingSource::Direct => self.direct = Some(permissions),
            PairingSource::Group(group) => {
                self.groups.insert(group, permissions);
            },
        }
    }

    /// Returns `true` if a pairing was removed.
    pub fn remove(&mut self, source: &PairingSource) -> bool {
        match source {
            PairingSource::Direct => self.direct.take().is_some(),
            PairingSource::Group(group) => self.groups.remove(group).is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.direct.is_none() && self.groups.is_empty()
    }

    /// Permissions that actually apply.
    ///
    /// Paused pairings don't count. A restriction is in effect only if every
    /// remaining pairing agrees on it; with no unpaused pairing left the peer
    /// is paused.
    pub fn effective(&self) -> PermissionSet {
        let mut active = self.direct.iter().chain(self.groups.values()).filter(|p| !p.paused).peekable();
        if active.peek().is_none() {
            return PermissionSet { paused: true, ..PermissionSet::default() };
        }
        active.fold(
            PermissionSet { paused: false, disable_animations: true, disable_sounds: true, disable_vfx: true },
            |acc, p| PermissionSet {
                paused: false,
                disable_animations: acc.disable_animations && p.disable_animations,
                disable_sounds: acc.disable_sounds && p.disable_sounds,
                disable_vfx: acc.disable_vfx && p.disable_vfx,
            },
        )
    }
}
