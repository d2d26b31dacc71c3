//! SQLite-backed contact store.
//!
//! `ContactDb` owns the connection and exposes the query layer
//! (`find_matches`, `expand_group`) plus the engine's three write
//! operations. `DbHandle` wraps it behind `Arc<Mutex>` and runs all
//! access on tokio's blocking thread pool, so one `identify` call holds
//! the store for its whole read-then-write sequence and concurrent
//! calls with overlapping identifiers serialize instead of racing.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};

use crate::models::{Contact, LinkPrecedence};

/// Async-safe handle to the contact database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ContactDb>>,
}

impl DbHandle {
    pub fn new(db: ContactDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with exclusive access to the database on a blocking
    /// thread. All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ContactDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct ContactDb {
    conn: Connection,
}

/// Current UTC time, RFC 3339 with millisecond precision. Lexicographic
/// order of these strings equals chronological order.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

const CONTACT_COLUMNS: &str =
    "id, email, phone, linked_id, link_precedence, created_at, updated_at, deleted_at";

impl ContactDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT,
                    phone TEXT,
                    linked_id INTEGER REFERENCES contacts(id),
                    link_precedence TEXT NOT NULL
                        CHECK(link_precedence IN ('primary', 'secondary')),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
                CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone);
                CREATE INDEX IF NOT EXISTS idx_contacts_linked ON contacts(linked_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<(Contact, String)> {
        let precedence_raw: String = row.get(4)?;
        Ok((
            Contact {
                id: row.get(0)?,
                email: row.get(1)?,
                phone: row.get(2)?,
                linked_id: row.get(3)?,
                // placeholder, fixed up by the caller once out of rusqlite's error type
                link_precedence: LinkPrecedence::Primary,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
                deleted_at: row.get(7)?,
            },
            precedence_raw,
        ))
    }

    fn finish_contact((mut contact, precedence_raw): (Contact, String)) -> Result<Contact> {
        contact.link_precedence = LinkPrecedence::from_str(&precedence_raw)
            .map_err(|e| anyhow::anyhow!("Corrupt link_precedence on contact {}: {}", contact.id, e))?;
        Ok(contact)
    }

    fn collect_contacts(
        rows: impl Iterator<Item = rusqlite::Result<(Contact, String)>>,
    ) -> Result<Vec<Contact>> {
        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(Self::finish_contact(row.context("Failed to read contact row")?)?);
        }
        Ok(contacts)
    }

    // ── Query layer ───────────────────────────────────────────────────

    /// All active contacts whose email OR phone equals the given values.
    /// An absent side matches nothing. Ascending (created_at, id).
    pub fn find_matches(&self, email: Option<&str>, phone: Option<&str>) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL
                   AND ((?1 IS NOT NULL AND email = ?1) OR (?2 IS NOT NULL AND phone = ?2))
                 ORDER BY created_at, id"
            ))
            .context("Failed to prepare find_matches")?;
        let rows = stmt
            .query_map(params![email, phone], Self::row_to_contact)
            .context("Failed to query matches")?;
        Self::collect_contacts(rows)
    }

    /// The contact with `id = root_id` together with every active contact
    /// linked to it. Ascending (created_at, id).
    pub fn expand_group(&self, root_id: i64) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND (id = ?1 OR linked_id = ?1)
                 ORDER BY created_at, id"
            ))
            .context("Failed to prepare expand_group")?;
        let rows = stmt
            .query_map(params![root_id], Self::row_to_contact)
            .context("Failed to query group")?;
        Self::collect_contacts(rows)
    }

    /// Fetch a single active contact.
    pub fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL AND id = ?1"
            ))
            .context("Failed to prepare get_contact")?;
        let mut rows = stmt
            .query_map(params![id], Self::row_to_contact)
            .context("Failed to query contact")?;
        match rows.next() {
            Some(row) => Ok(Some(Self::finish_contact(
                row.context("Failed to read contact row")?,
            )?)),
            None => Ok(None),
        }
    }

    /// All active contacts in creation order (diagnostic listing).
    pub fn list_all(&self) -> Result<Vec<Contact>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts
                 WHERE deleted_at IS NULL
                 ORDER BY created_at, id"
            ))
            .context("Failed to prepare list_all")?;
        let rows = stmt
            .query_map([], Self::row_to_contact)
            .context("Failed to query contacts")?;
        Self::collect_contacts(rows)
    }

    // ── Write operations (engine only) ────────────────────────────────

    pub fn create_contact(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
        linked_id: Option<i64>,
        precedence: LinkPrecedence,
    ) -> Result<Contact> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO contacts (email, phone, linked_id, link_precedence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![email, phone, linked_id, precedence.as_str(), now],
            )
            .context("Failed to insert contact")?;
        let id = self.conn.last_insert_rowid();
        self.get_contact(id)?
            .context("Contact not found after insert")
    }

    /// Demote a former primary into the surviving primary's group.
    /// `email`, `phone` and `created_at` are never touched.
    pub fn demote_to_secondary(&self, id: i64, primary_id: i64) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE contacts
                 SET linked_id = ?1, link_precedence = 'secondary', updated_at = ?2
                 WHERE id = ?3 AND deleted_at IS NULL",
                params![primary_id, now_rfc3339(), id],
            )
            .context("Failed to demote contact")?;
        anyhow::ensure!(changed == 1, "Demotion target {} not found", id);
        Ok(())
    }

    /// Re-point every secondary of a demoted primary at the survivor,
    /// keeping the link graph flat (depth 1).
    pub fn repoint_secondaries(&self, old_primary_id: i64, new_primary_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE contacts
                 SET linked_id = ?1, updated_at = ?2
                 WHERE linked_id = ?3 AND id != ?1 AND deleted_at IS NULL",
                params![new_primary_id, now_rfc3339(), old_primary_id],
            )
            .context("Failed to re-point secondaries")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> ContactDb {
        ContactDb::new_in_memory().unwrap()
    }

    #[test]
    fn create_and_get_round_trip() {
        let db = db();
        let c = db
            .create_contact(Some("a@x.com"), Some("111"), None, LinkPrecedence::Primary)
            .unwrap();
        assert_eq!(c.id, 1);
        assert_eq!(c.email.as_deref(), Some("a@x.com"));
        assert_eq!(c.link_precedence, LinkPrecedence::Primary);
        assert_eq!(c.created_at, c.updated_at);

        let fetched = db.get_contact(c.id).unwrap().unwrap();
        assert_eq!(fetched.phone.as_deref(), Some("111"));
        assert!(db.get_contact(99).unwrap().is_none());
    }

    #[test]
    fn find_matches_matches_either_side() {
        let db = db();
        db.create_contact(Some("a@x.com"), Some("111"), None, LinkPrecedence::Primary)
            .unwrap();
        db.create_contact(Some("b@y.com"), Some("222"), None, LinkPrecedence::Primary)
            .unwrap();

        let by_email = db.find_matches(Some("a@x.com"), None).unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].id, 1);

        let by_phone = db.find_matches(None, Some("222")).unwrap();
        assert_eq!(by_phone.len(), 1);
        assert_eq!(by_phone[0].id, 2);

        let both = db.find_matches(Some("a@x.com"), Some("222")).unwrap();
        assert_eq!(both.len(), 2);

        assert!(db.find_matches(Some("c@z.com"), Some("999")).unwrap().is_empty());
    }

    #[test]
    fn find_matches_ignores_null_columns() {
        // A NULL email column must never match an absent email parameter.
        let db = db();
        db.create_contact(None, Some("111"), None, LinkPrecedence::Primary)
            .unwrap();
        let matches = db.find_matches(Some("a@x.com"), None).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn expand_group_returns_root_and_members() {
        let db = db();
        let root = db
            .create_contact(Some("a@x.com"), Some("111"), None, LinkPrecedence::Primary)
            .unwrap();
        db.create_contact(Some("a@x.com"), Some("222"), Some(root.id), LinkPrecedence::Secondary)
            .unwrap();
        db.create_contact(Some("b@y.com"), Some("333"), None, LinkPrecedence::Primary)
            .unwrap();

        let group = db.expand_group(root.id).unwrap();
        assert_eq!(group.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn demote_rewrites_link_but_not_identity_fields() {
        let db = db();
        let a = db
            .create_contact(Some("a@x.com"), Some("111"), None, LinkPrecedence::Primary)
            .unwrap();
        let b = db
            .create_contact(Some("b@y.com"), Some("222"), None, LinkPrecedence::Primary)
            .unwrap();

        db.demote_to_secondary(b.id, a.id).unwrap();
        let demoted = db.get_contact(b.id).unwrap().unwrap();
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(a.id));
        assert_eq!(demoted.email.as_deref(), Some("b@y.com"));
        assert_eq!(demoted.created_at, b.created_at);
        assert!(demoted.updated_at >= b.updated_at);

        assert!(db.demote_to_secondary(99, a.id).is_err());
    }

    #[test]
    fn repoint_moves_all_secondaries_to_survivor() {
        let db = db();
        let survivor = db
            .create_contact(Some("a@x.com"), Some("111"), None, LinkPrecedence::Primary)
            .unwrap();
        let old = db
            .create_contact(Some("b@y.com"), Some("222"), None, LinkPrecedence::Primary)
            .unwrap();
        db.create_contact(Some("c@z.com"), Some("222"), Some(old.id), LinkPrecedence::Secondary)
            .unwrap();
        db.create_contact(Some("b@y.com"), Some("333"), Some(old.id), LinkPrecedence::Secondary)
            .unwrap();

        db.demote_to_secondary(old.id, survivor.id).unwrap();
        let moved = db.repoint_secondaries(old.id, survivor.id).unwrap();
        assert_eq!(moved, 2);

        let group = db.expand_group(survivor.id).unwrap();
        assert_eq!(group.len(), 4);
        for member in group.iter().filter(|c| c.id != survivor.id) {
            assert_eq!(member.linked_id, Some(survivor.id));
        }
    }

    #[test]
    fn list_all_orders_by_creation() {
        let db = db();
        for phone in ["111", "222", "333"] {
            db.create_contact(None, Some(phone), None, LinkPrecedence::Primary)
                .unwrap();
        }
        let all = db.list_all().unwrap();
        assert_eq!(all.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.db");
        {
            let db = ContactDb::new(&path).unwrap();
            db.create_contact(Some("a@x.com"), None, None, LinkPrecedence::Primary)
                .unwrap();
        }
        let db = ContactDb::new(&path).unwrap();
        assert_eq!(db.list_all().unwrap().len(), 1);
    }
}
