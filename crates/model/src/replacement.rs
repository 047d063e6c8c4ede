use crate::error::{ErrorKind, Result};
use crate::hash::ContentHash;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An in-game asset path.
///
/// Game paths are case-insensitive and always use forward slashes, so both
/// are normalized on construction.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GamePath(String);

impl GamePath {
    pub fn new(path: impl AsRef<str>) -> Result<Self> {
        Ok(Self::try_from(path.as_ref().to_string())?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase extension without the leading dot.
    pub fn extension(&self) -> Option<&str> {
        let name = self.0.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        (!stem.is_empty() && !ext.is_empty()).then_some(ext)
    }

    pub fn category(&self) -> Option<ContentCategory> {
        ContentCategory::of_extension(self.extension()?)
    }
}
impl TryFrom<String> for GamePath {
    type Error = ErrorKind;
    fn try_from(path: String) -> std::result::Result<Self, Self::Error> {
        let normalized = path.trim().replace('\\', "/").to_lowercase();
        if normalized.is_empty() || normalized.contains('\0') {
            return Err(ErrorKind::InvalidGamePath(path));
        }
        Ok(Self(normalized))
    }
}
impl From<GamePath> for String {
    fn from(path: GamePath) -> Self {
        path.0
    }
}

/// Classes of content that a pairing may refuse to receive.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentCategory {
    #[display("animation")]
    Animation,
    #[display("sound")]
    Sound,
    #[display("vfx")]
    Vfx,
}

impl ContentCategory {
    pub fn of_extension(ext: &str) -> Option<Self> {
        match ext {
            "tmb" | "pap" => Some(Self::Animation),
            "scd" => Some(Self::Sound),
            "avfx" | "atex" => Some(Self::Vfx),
            _ => None,
        }
    }
}

/// Detects paths that point at the local filesystem rather than into the
/// game's virtual file system: drive-letter paths, UNC paths and rooted
/// Unix paths.
pub fn is_local_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    drive || path.starts_with("\\\\") || path.starts_with('/')
}

/// Where the replacement content of a [`FileReplacement`] comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Content addressed by hash, resolved through the local content store.
    Hash(ContentHash),
    /// A literal alternate path the game paths are redirected to.
    Target(String),
}

/// Maps one or more game paths to replacement content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileReplacement {
    game_paths: BTreeSet<GamePath>,
    resolution: Resolution,
}

impl FileReplacement {
    pub fn new(game_paths: impl IntoIterator<Item = GamePath>, resolution: Resolution) -> Result<Self> {
        let game_paths: BTreeSet<_> = game_paths.into_iter().collect();
        if game_paths.is_empty() {
            exn::bail!(ErrorKind::EmptyReplacement);
        }
        Ok(Self { game_paths, resolution })
    }

    /// Shorthand for a hash-backed replacement from raw strings.
    pub fn with_hash<I, S>(game_paths: I, hash: ContentHash) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = game_paths.into_iter().map(GamePath::new).collect::<Result<Vec<_>>>()?;
        Self::new(paths, Resolution::Hash(hash))
    }

    /// Shorthand for a path-redirecting replacement from raw strings.
    pub fn with_swap<I, S>(game_paths: I, target: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = game_paths.into_iter().map(GamePath::new).collect::<Result<Vec<_>>>()?;
        Self::new(paths, Resolution::Target(target.into()))
    }

    pub fn game_paths(&self) -> &BTreeSet<GamePath> {
        &self.game_paths
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn hash(&self) -> Option<&ContentHash> {
        match &self.resolution {
            Resolution::Hash(hash) => Some(hash),
            Resolution::Target(_) => None,
        }
    }

    /// A swap redirects game paths to another in-game path and never touches
    /// the content store. That holds when none of the involved paths,
    /// including the target, is a local filesystem path.
    pub fn is_swap(&self) -> bool {
        match &self.resolution {
            Resolution::Hash(_) => false,
            Resolution::Target(target) => {
                !is_local_path(target) && self.game_paths.iter().all(|p| !is_local_path(p.as_str()))
            },
        }
    }

    /// Extension the cached content should carry, taken from the first game
    /// path that has one.
    pub fn extension(&self) -> Option<&str> {
        self.game_paths.iter().find_map(GamePath::extension)
    }

    /// Drops the game paths belonging to any of the `denied` categories.
    /// Returns `None` when nothing is left to replace.
    pub fn without_categories(&self, denied: &BTreeSet<ContentCategory>) -> Option<Self> {
        if denied.is_empty() {
            return Some(self.clone());
        }
        let game_paths: BTreeSet<_> =
            self.game_paths.iter().filter(|p| p.category().is_none_or(|c| !denied.contains(&c))).cloned().collect();
        (!game_paths.is_empty()).then(|| Self { game_paths, resolution: self.resolution.clone() })
    }
}
