//! Persisted content index.
//!
//! The index only exists so the store doesn't have to walk the cache root on
//! startup. Losing it loses nothing but the entries' registration dates.

use crate::Database;
use crate::entry::{CacheEntry, EntryRow};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use mirage_model::ContentHash;
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<CacheEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(include_str!("../queries/list_entries.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(CacheEntry::try_from).collect()
    }

    /// Insert or update a single entry.
    pub async fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        let row = EntryRow::try_from(entry)?;
        Self::bind_row(sqlx::query(include_str!("../queries/upsert_entry.sql")), row)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Returns `true` if an entry was removed.
    pub async fn delete(&self, hash: &ContentHash) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(hash.as_str())
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Rewrites the whole index in one transaction.
    pub async fn replace_all<'a>(&self, entries: impl IntoIterator<Item = &'a CacheEntry>) -> Result<u64> {
        let rows = entries.into_iter().map(EntryRow::try_from).collect::<Result<Vec<_>>>()?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/delete_all_entries.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let mut written = 0;
        for row in rows {
            Self::bind_row(sqlx::query(include_str!("../queries/upsert_entry.sql")), row)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            written += 1;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(written)
    }

    fn bind_row<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        row: EntryRow,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        query
            .bind(row.hash)
            .bind(row.path)
            .bind(row.extension)
            .bind(row.size)
            .bind(row.registered_at)
            .bind(row.substitute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> Repository {
        Repository::from(&Database::connect_in_memory().await.unwrap())
    }

    fn entry(content: &[u8], ext: Option<&str>) -> CacheEntry {
        CacheEntry::new(ContentHash::of(content), ext.map(str::to_string), content.len() as u64)
    }

    #[tokio::test]
    async fn test_upsert_and_list() {
        let repo = repo().await;
        let a = entry(b"a", Some("mdl"));
        repo.upsert(&a).await.unwrap();
        repo.upsert(&a).await.unwrap();
        let listed = repo.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, a.path);
        assert_eq!(listed[0].extension.as_deref(), Some("mdl"));
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = repo().await;
        let a = entry(b"a", None);
        repo.upsert(&a).await.unwrap();
        assert!(repo.delete(&a.hash).await.unwrap());
        assert!(!repo.delete(&a.hash).await.unwrap());
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_all_drops_unlisted_entries() {
        let repo = repo().await;
        let (a, b, c) = (entry(b"a", None), entry(b"b", Some("tex")), entry(b"c", Some("mtrl")));
        repo.upsert(&a).await.unwrap();
        repo.upsert(&b).await.unwrap();
        assert_eq!(repo.replace_all([&b, &c]).await.unwrap(), 2);
        let hashes: Vec<_> = repo.list().await.unwrap().into_iter().map(|e| e.hash).collect();
        assert!(!hashes.contains(&a.hash));
        assert!(hashes.contains(&b.hash));
        assert!(hashes.contains(&c.hash));
    }
}
