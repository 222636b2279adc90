//! Relational persistence for users, diagrams, and collaboration sessions.
//!
//! `rusqlite` is synchronous, so every call here is routed through
//! `spawn_blocking` by the caller; this module only holds the blocking
//! logic, behind a `parking_lot::Mutex<Connection>` the way `state.rs`
//! guards its other shared structures.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Bumped on schema migration; stored in sqlite's `user_version` pragma.
pub const SCHEMA_VERSION: i32 = 1;

/// Shared handle to the single sqlite connection, passed down from
/// `AppState` into per-diagram room actors so they can persist the live
/// roster without owning the database themselves.
pub type Db = Arc<Mutex<Connection>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagram {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    /// JSON snapshot of the diagram's elements — a single blob, matching
    /// the whole-aggregate-as-JSON approach used for bounded nested data
    /// rather than a normalized relational schema for the graph itself.
    pub bpmn_xml: String,
    pub owner: String,
    pub collaborators: Vec<String>,
    pub is_public: bool,
    pub version: i64,
    pub last_modified: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParticipant {
    pub user_id: String,
    pub socket_id: String,
    pub joined_at: DateTime<Utc>,
    pub cursor: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationSessionRow {
    pub id: String,
    pub diagram_id: String,
    pub participants: Vec<SessionParticipant>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = Connection::open(path)?;
    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            avatar TEXT,
            is_online INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS diagrams (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            bpmn_xml TEXT NOT NULL,
            owner TEXT NOT NULL REFERENCES users(id),
            is_public INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            last_modified TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS diagram_collaborators (
            diagram_id TEXT NOT NULL REFERENCES diagrams(id),
            user_id TEXT NOT NULL REFERENCES users(id),
            PRIMARY KEY (diagram_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS collaboration_sessions (
            id TEXT PRIMARY KEY,
            diagram_id TEXT NOT NULL REFERENCES diagrams(id),
            participants TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

pub fn health(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("SELECT 1", [], |_| Ok(()))
}

pub fn create_user(conn: &Connection, user: &User) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO users (id, username, email, avatar, is_online, last_seen, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user.id,
            user.username,
            user.email,
            user.avatar,
            user.is_online,
            user.last_seen.to_rfc3339(),
            user.created_at.to_rfc3339(),
            user.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_user(conn: &Connection, id: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        "SELECT id, username, email, avatar, is_online, last_seen, created_at, updated_at
         FROM users WHERE id = ?1",
        params![id],
        row_to_user,
    )
    .optional()
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        avatar: row.get(3)?,
        is_online: row.get(4)?,
        last_seen: parse_ts(row.get::<_, String>(5)?),
        created_at: parse_ts(row.get::<_, String>(6)?),
        updated_at: parse_ts(row.get::<_, String>(7)?),
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub fn set_user_online(conn: &Connection, id: &str, online: bool, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE users SET is_online = ?1, last_seen = ?2, updated_at = ?2 WHERE id = ?3",
        params![online, now.to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn create_diagram(conn: &Connection, diagram: &Diagram) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO diagrams (id, title, description, bpmn_xml, owner, is_public, version, last_modified, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            diagram.id,
            diagram.title,
            diagram.description,
            diagram.bpmn_xml,
            diagram.owner,
            diagram.is_public,
            diagram.version,
            diagram.last_modified.to_rfc3339(),
            diagram.created_at.to_rfc3339(),
            diagram.updated_at.to_rfc3339(),
        ],
    )?;
    for collaborator in &diagram.collaborators {
        add_collaborator(conn, &diagram.id, collaborator)?;
    }
    Ok(())
}

pub fn add_collaborator(conn: &Connection, diagram_id: &str, user_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO diagram_collaborators (diagram_id, user_id) VALUES (?1, ?2)",
        params![diagram_id, user_id],
    )?;
    Ok(())
}

pub fn remove_collaborator(conn: &Connection, diagram_id: &str, user_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM diagram_collaborators WHERE diagram_id = ?1 AND user_id = ?2",
        params![diagram_id, user_id],
    )?;
    Ok(())
}

pub fn get_diagram(conn: &Connection, id: &str) -> rusqlite::Result<Option<Diagram>> {
    let diagram = conn
        .query_row(
            "SELECT id, title, description, bpmn_xml, owner, is_public, version, last_modified, created_at, updated_at
             FROM diagrams WHERE id = ?1",
            params![id],
            row_to_diagram,
        )
        .optional()?;
    let Some(mut diagram) = diagram else {
        return Ok(None);
    };
    diagram.collaborators = list_collaborators(conn, id)?;
    Ok(Some(diagram))
}

fn row_to_diagram(row: &rusqlite::Row) -> rusqlite::Result<Diagram> {
    Ok(Diagram {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        bpmn_xml: row.get(3)?,
        owner: row.get(4)?,
        collaborators: Vec::new(),
        is_public: row.get(5)?,
        version: row.get(6)?,
        last_modified: parse_ts(row.get::<_, String>(7)?),
        created_at: parse_ts(row.get::<_, String>(8)?),
        updated_at: parse_ts(row.get::<_, String>(9)?),
    })
}

fn list_collaborators(conn: &Connection, diagram_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM diagram_collaborators WHERE diagram_id = ?1")?;
    let rows = stmt.query_map(params![diagram_id], |row| row.get(0))?;
    rows.collect()
}

/// Bumps `version` by one and rewrites the snapshot; returns the new version.
pub fn update_diagram_snapshot(
    conn: &Connection,
    id: &str,
    bpmn_xml: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "UPDATE diagrams SET bpmn_xml = ?1, version = version + 1, last_modified = ?2, updated_at = ?2 WHERE id = ?3",
        params![bpmn_xml, now.to_rfc3339(), id],
    )?;
    conn.query_row("SELECT version FROM diagrams WHERE id = ?1", params![id], |row| row.get(0))
}

pub fn upsert_session(conn: &Connection, session: &CollaborationSessionRow) -> rusqlite::Result<()> {
    let participants_json =
        serde_json::to_string(&session.participants).map_err(|e| {
            rusqlite::Error::ToSqlConversionFailure(Box::new(e))
        })?;
    conn.execute(
        "INSERT INTO collaboration_sessions (id, diagram_id, participants, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET participants = excluded.participants, is_active = excluded.is_active, updated_at = excluded.updated_at",
        params![
            session.id,
            session.diagram_id,
            participants_json,
            session.is_active,
            session.created_at.to_rfc3339(),
            session.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Deletes inactive sessions whose `updated_at` is older than `ttl`.
pub fn purge_inactive_sessions(conn: &Connection, now: DateTime<Utc>, ttl: chrono::Duration) -> rusqlite::Result<usize> {
    let cutoff = (now - ttl).to_rfc3339();
    conn.execute(
        "DELETE FROM collaboration_sessions WHERE is_active = 0 AND updated_at < ?1",
        params![cutoff],
    )
}
