//! SQLite persistence layer.
//!
//! Holds the authoritative rows for subordinates, trust-mark types, and
//! trust marks; everything in the cache is a projection of these. Uses WAL
//! mode for concurrent reads during writes. JSON-shaped columns are stored
//! as serialized text.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};
use serde_json::Value;

use crate::util::{hours, unix_now};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Mutex<Connection>,
}

/// A trust-mark type row.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustMarkTypeRow {
    pub id: i64,
    pub tmtype: String,
    pub autorenew: bool,
    pub valid_for: i64,
    pub renewal_time: i64,
    pub active: bool,
}

/// A trust-mark row. `mark` is `None` once the mark has been revoked.
#[derive(Debug, Clone)]
pub struct TrustMarkRow {
    pub id: i64,
    pub tmt_id: i64,
    pub added: i64,
    pub domain: String,
    pub active: bool,
    pub autorenew: bool,
    pub valid_for: i64,
    pub renewal_time: i64,
    pub mark: Option<String>,
    pub expire_at: Option<i64>,
    pub additional_claims: Option<Value>,
}

/// A subordinate row.
#[derive(Debug, Clone)]
pub struct SubordinateRow {
    pub id: i64,
    pub added: i64,
    pub entityid: String,
    pub valid_for: i64,
    pub autorenew: bool,
    pub metadata: Value,
    pub forced_metadata: Value,
    pub jwks: Option<Value>,
    pub required_trustmarks: Option<String>,
    pub active: bool,
    pub statement: Option<String>,
    pub additional_claims: Option<Value>,
}

impl SubordinateRow {
    /// Derived expiry: `added + valid_for` (hours).
    pub fn expire_at(&self) -> i64 {
        self.added + hours(self.valid_for)
    }
}

/// Fields for a new subordinate row; `added` is stamped on insert.
#[derive(Debug, Clone)]
pub struct NewSubordinate {
    pub entityid: String,
    pub valid_for: i64,
    pub autorenew: bool,
    pub metadata: Value,
    pub forced_metadata: Value,
    pub jwks: Option<Value>,
    pub required_trustmarks: Option<String>,
    pub active: bool,
    pub statement: String,
    pub additional_claims: Option<Value>,
}

/// True when an insert hit a UNIQUE constraint.
pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open(path: &str) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Db { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Db { conn: Mutex::new(conn) };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS trust_mark_types (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                tmtype       TEXT NOT NULL UNIQUE,
                autorenew    INTEGER NOT NULL DEFAULT 0,
                valid_for    INTEGER NOT NULL DEFAULT 8760,
                renewal_time INTEGER NOT NULL DEFAULT 48,
                active       INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS trust_marks (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                tmt_id       INTEGER NOT NULL REFERENCES trust_mark_types(id) ON DELETE CASCADE,
                added        INTEGER NOT NULL,
                domain       TEXT NOT NULL,
                active       INTEGER NOT NULL,
                autorenew    INTEGER NOT NULL,
                valid_for    INTEGER NOT NULL,
                renewal_time INTEGER NOT NULL,
                mark         TEXT,
                expire_at    INTEGER,
                additional_claims TEXT,
                UNIQUE(tmt_id, domain)
            );

            CREATE INDEX IF NOT EXISTS idx_trust_marks_domain ON trust_marks(domain);
            CREATE INDEX IF NOT EXISTS idx_trust_marks_expire ON trust_marks(expire_at);

            CREATE TABLE IF NOT EXISTS subordinates (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                added        INTEGER NOT NULL,
                entityid     TEXT NOT NULL UNIQUE,
                valid_for    INTEGER NOT NULL DEFAULT 8760,
                autorenew    INTEGER NOT NULL DEFAULT 0,
                metadata     TEXT NOT NULL,
                forced_metadata TEXT NOT NULL,
                jwks         TEXT,
                required_trustmarks TEXT,
                active       INTEGER NOT NULL DEFAULT 1,
                statement    TEXT,
                additional_claims TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_subordinates_valid_for ON subordinates(valid_for);
            ",
        )?;
        Ok(())
    }

    // ── Trust-mark types ───────────────────────────────────────────────

    pub fn insert_trust_mark_type(
        &self,
        tmtype: &str,
        autorenew: bool,
        valid_for: i64,
        renewal_time: i64,
        active: bool,
    ) -> SqlResult<TrustMarkTypeRow> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trust_mark_types (tmtype, autorenew, valid_for, renewal_time, active)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tmtype, autorenew as i32, valid_for, renewal_time, active as i32],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_trust_mark_type(id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn get_trust_mark_type(&self, id: i64) -> SqlResult<Option<TrustMarkTypeRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tmtype, autorenew, valid_for, renewal_time, active
             FROM trust_mark_types WHERE id = ?1",
            params![id],
            map_tmt_row,
        )
        .optional()
    }

    pub fn get_trust_mark_type_by_type(&self, tmtype: &str) -> SqlResult<Option<TrustMarkTypeRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tmtype, autorenew, valid_for, renewal_time, active
             FROM trust_mark_types WHERE tmtype = ?1",
            params![tmtype],
            map_tmt_row,
        )
        .optional()
    }

    pub fn list_trust_mark_types(&self) -> SqlResult<Vec<TrustMarkTypeRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tmtype, autorenew, valid_for, renewal_time, active
             FROM trust_mark_types ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_tmt_row)?;
        rows.collect()
    }

    /// Partial update; `None` leaves a field unchanged.
    pub fn update_trust_mark_type(
        &self,
        id: i64,
        autorenew: Option<bool>,
        valid_for: Option<i64>,
        renewal_time: Option<i64>,
        active: Option<bool>,
    ) -> SqlResult<Option<TrustMarkTypeRow>> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE trust_mark_types SET
                    autorenew    = COALESCE(?2, autorenew),
                    valid_for    = COALESCE(?3, valid_for),
                    renewal_time = COALESCE(?4, renewal_time),
                    active       = COALESCE(?5, active)
                 WHERE id = ?1",
                params![id, autorenew.map(|b| b as i32), valid_for, renewal_time, active.map(|b| b as i32)],
            )?;
        }
        self.get_trust_mark_type(id)
    }

    // ── Trust marks ────────────────────────────────────────────────────

    pub fn insert_trust_mark(
        &self,
        tmt_id: i64,
        domain: &str,
        active: bool,
        autorenew: bool,
        valid_for: i64,
        renewal_time: i64,
        additional_claims: Option<&Value>,
    ) -> SqlResult<TrustMarkRow> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trust_marks
                (tmt_id, added, domain, active, autorenew, valid_for, renewal_time, additional_claims)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tmt_id,
                unix_now(),
                domain,
                active as i32,
                autorenew as i32,
                valid_for,
                renewal_time,
                additional_claims.map(|v| v.to_string()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_trust_mark(id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn get_trust_mark(&self, id: i64) -> SqlResult<Option<TrustMarkRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{TM_SELECT} WHERE id = ?1"),
            params![id],
            map_tm_row,
        )
        .optional()
    }

    pub fn get_trust_mark_by_subject(
        &self,
        tmt_id: i64,
        domain: &str,
    ) -> SqlResult<Option<TrustMarkRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{TM_SELECT} WHERE tmt_id = ?1 AND domain = ?2"),
            params![tmt_id, domain],
            map_tm_row,
        )
        .optional()
    }

    pub fn list_trust_marks(&self) -> SqlResult<Vec<TrustMarkRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{TM_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], map_tm_row)?;
        rows.collect()
    }

    pub fn list_trust_marks_for_domain(&self, domain: &str) -> SqlResult<Vec<TrustMarkRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{TM_SELECT} WHERE domain = ?1 ORDER BY id"))?;
        let rows = stmt.query_map(params![domain], map_tm_row)?;
        rows.collect()
    }

    /// Overwrite the mutable fields of a trust mark.
    pub fn update_trust_mark(&self, row: &TrustMarkRow) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trust_marks SET
                active = ?2, autorenew = ?3, mark = ?4, expire_at = ?5, additional_claims = ?6
             WHERE id = ?1",
            params![
                row.id,
                row.active as i32,
                row.autorenew as i32,
                row.mark,
                row.expire_at,
                row.additional_claims.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    // ── Subordinates ───────────────────────────────────────────────────

    pub fn insert_subordinate(&self, new: &NewSubordinate) -> SqlResult<SubordinateRow> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subordinates
                (added, entityid, valid_for, autorenew, metadata, forced_metadata,
                 jwks, required_trustmarks, active, statement, additional_claims)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                unix_now(),
                new.entityid,
                new.valid_for,
                new.autorenew as i32,
                new.metadata.to_string(),
                new.forced_metadata.to_string(),
                new.jwks.as_ref().map(|v| v.to_string()),
                new.required_trustmarks,
                new.active as i32,
                new.statement,
                new.additional_claims.as_ref().map(|v| v.to_string()),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_subordinate(id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn get_subordinate(&self, id: i64) -> SqlResult<Option<SubordinateRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{SUB_SELECT} WHERE id = ?1"),
            params![id],
            map_sub_row,
        )
        .optional()
    }

    pub fn get_subordinate_by_entityid(&self, entityid: &str) -> SqlResult<Option<SubordinateRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{SUB_SELECT} WHERE entityid = ?1"),
            params![entityid],
            map_sub_row,
        )
        .optional()
    }

    pub fn list_subordinates(&self) -> SqlResult<Vec<SubordinateRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SUB_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], map_sub_row)?;
        rows.collect()
    }

    pub fn list_active_subordinates(&self) -> SqlResult<Vec<SubordinateRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SUB_SELECT} WHERE active = 1 ORDER BY id"))?;
        let rows = stmt.query_map([], map_sub_row)?;
        rows.collect()
    }

    pub fn list_active_trust_marks(&self) -> SqlResult<Vec<TrustMarkRow>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{TM_SELECT} WHERE active = 1 AND mark IS NOT NULL ORDER BY id"))?;
        let rows = stmt.query_map([], map_tm_row)?;
        rows.collect()
    }

    /// Replace a subordinate's fields after a successful re-run of the
    /// admission pipeline. `added` is preserved.
    pub fn update_subordinate(&self, row: &SubordinateRow) -> SqlResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE subordinates SET
                valid_for = ?2, autorenew = ?3, metadata = ?4, forced_metadata = ?5,
                jwks = ?6, required_trustmarks = ?7, active = ?8, statement = ?9,
                additional_claims = ?10
             WHERE id = ?1",
            params![
                row.id,
                row.valid_for,
                row.autorenew as i32,
                row.metadata.to_string(),
                row.forced_metadata.to_string(),
                row.jwks.as_ref().map(|v| v.to_string()),
                row.required_trustmarks,
                row.active as i32,
                row.statement,
                row.additional_claims.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }
}

const TM_SELECT: &str = "SELECT id, tmt_id, added, domain, active, autorenew, valid_for, \
                         renewal_time, mark, expire_at, additional_claims FROM trust_marks";

const SUB_SELECT: &str = "SELECT id, added, entityid, valid_for, autorenew, metadata, \
                          forced_metadata, jwks, required_trustmarks, active, statement, \
                          additional_claims FROM subordinates";

fn map_tmt_row(row: &rusqlite::Row) -> SqlResult<TrustMarkTypeRow> {
    Ok(TrustMarkTypeRow {
        id: row.get(0)?,
        tmtype: row.get(1)?,
        autorenew: row.get::<_, i32>(2)? != 0,
        valid_for: row.get(3)?,
        renewal_time: row.get(4)?,
        active: row.get::<_, i32>(5)? != 0,
    })
}

fn map_tm_row(row: &rusqlite::Row) -> SqlResult<TrustMarkRow> {
    let additional: Option<String> = row.get(10)?;
    Ok(TrustMarkRow {
        id: row.get(0)?,
        tmt_id: row.get(1)?,
        added: row.get(2)?,
        domain: row.get(3)?,
        active: row.get::<_, i32>(4)? != 0,
        autorenew: row.get::<_, i32>(5)? != 0,
        valid_for: row.get(6)?,
        renewal_time: row.get(7)?,
        mark: row.get(8)?,
        expire_at: row.get(9)?,
        additional_claims: additional.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn map_sub_row(row: &rusqlite::Row) -> SqlResult<SubordinateRow> {
    let metadata: String = row.get(5)?;
    let forced: String = row.get(6)?;
    let jwks: Option<String> = row.get(7)?;
    let additional: Option<String> = row.get(11)?;
    Ok(SubordinateRow {
        id: row.get(0)?,
        added: row.get(1)?,
        entityid: row.get(2)?,
        valid_for: row.get(3)?,
        autorenew: row.get::<_, i32>(4)? != 0,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        forced_metadata: serde_json::from_str(&forced).unwrap_or_default(),
        jwks: jwks.and_then(|s| serde_json::from_str(&s).ok()),
        required_trustmarks: row.get(8)?,
        active: row.get::<_, i32>(9)? != 0,
        statement: row.get(10)?,
        additional_claims: additional.and_then(|s| serde_json::from_str(&s).ok()),
    })
}
