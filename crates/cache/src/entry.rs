use crate::error::{Error, ErrorKind};
use exn::{OptionExt, ResultExt};
use mirage_model::ContentHash;
use std::path::{Path, PathBuf};
use time::UtcDateTime;

/// Which of the store's locations a lookup resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Primary,
    Substitute,
}

/// One cached content file.
///
/// Paths are relative to the storage backend root and always derived from
/// the hash: `<shard>/<hash>.<extension>`, or `<shard>/<hash>` for legacy
/// entries written before the extension was known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub hash: ContentHash,
    pub path: PathBuf,
    pub extension: Option<String>,
    pub size: u64,
    pub registered_at: UtcDateTime,
    /// A copy also exists in the substitute location.
    pub substitute: bool,
}

impl CacheEntry {
    pub(crate) fn new(hash: ContentHash, extension: Option<String>, size: u64) -> Self {
        let path = entry_path(&hash, extension.as_deref());
        Self { hash, path, extension, size, registered_at: UtcDateTime::now(), substitute: false }
    }

    /// Entry written without an extension; needs [`migrate_extension`](crate::ContentStore::migrate_extension).
    pub fn is_legacy(&self) -> bool {
        self.extension.is_none()
    }
}

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContent {
    pub entry: CacheEntry,
    pub location: Location,
}

pub(crate) fn entry_path(hash: &ContentHash, extension: Option<&str>) -> PathBuf {
    let name = match extension {
        Some(ext) => format!("{hash}.{ext}"),
        None => hash.to_string(),
    };
    Path::new(hash.shard()).join(name)
}

/// Lowercase, without the leading dot. Empty extensions count as none.
pub(crate) fn normalize_extension(extension: &str) -> Option<String> {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    (!ext.is_empty()).then_some(ext)
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub hash: String,
    pub path: String,
    pub extension: Option<String>,
    pub size: i64,
    pub registered_at: i64,
    pub substitute: bool,
}
impl TryFrom<&CacheEntry> for EntryRow {
    type Error = Error;
    fn try_from(entry: &CacheEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            hash: entry.hash.to_string(),
            path: entry.path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string(),
            extension: entry.extension.clone(),
            size: i64::try_from(entry.size).or_raise(|| ErrorKind::InvalidData("size"))?,
            registered_at: entry.registered_at.unix_timestamp(),
            substitute: entry.substitute,
        })
    }
}
impl TryFrom<EntryRow> for CacheEntry {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            hash: row.hash.parse::<ContentHash>().or_raise(|| ErrorKind::InvalidData("content hash"))?,
            path: PathBuf::from(row.path),
            extension: row.extension,
            size: u64::try_from(row.size).or_raise(|| ErrorKind::InvalidData("size"))?,
            registered_at: UtcDateTime::from_unix_timestamp(row.registered_at)
                .or_raise(|| ErrorKind::InvalidData("registration date"))?,
            substitute: row.substitute,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("mdl", Some("mdl"))]
    #[case(".MTRL", Some("mtrl"))]
    #[case("  tex ", Some("tex"))]
    #[case("", None)]
    #[case(".", None)]
    fn test_normalize_extension(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_extension(input).as_deref(), expected);
    }

    #[test]
    fn test_entry_path_is_sharded() {
        let hash = ContentHash::of(b"model");
        let with_ext = entry_path(&hash, Some("mdl"));
        assert_eq!(with_ext, Path::new(hash.shard()).join(format!("{hash}.mdl")));
        let legacy = entry_path(&hash, None);
        assert_eq!(legacy.file_name().unwrap().to_str().unwrap(), hash.as_str());
    }

    #[test]
    fn test_row_round_trip_strips_nanoseconds() {
        let entry = CacheEntry::new(ContentHash::of(b"model"), Some("mdl".to_string()), 5);
        let row = EntryRow::try_from(&entry).unwrap();
        assert_eq!(row.size, 5);
        let back = CacheEntry::try_from(row).unwrap();
        assert_eq!(back.hash, entry.hash);
        assert_eq!(back.registered_at, entry.registered_at.replace_nanosecond(0).unwrap());
    }

    #[test]
    fn test_row_with_bad_hash_is_invalid() {
        let row = EntryRow {
            hash: "not a hash".to_string(),
            path: "no/not a hash".to_string(),
            extension: None,
            size: 1,
            registered_at: 0,
            substitute: false,
        };
        let err = CacheEntry::try_from(row).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("content hash")));
    }
}
