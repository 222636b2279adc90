use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::persistence::{self, Db};
use crate::presence::Presence;
use crate::room::{spawn_room, RoomHandle};

/// Shared application state, wrapped in an Arc (via `Clone`-able internals)
/// for use as axum state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    db: Db,
    /// Per-diagram room actors, spawned lazily on first join/change.
    rooms: Arc<Mutex<HashMap<String, RoomHandle>>>,
    pub presence: Arc<Presence>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, String> {
        let db_path = config.db_path.clone();
        let conn = tokio::task::spawn_blocking(move || persistence::open(&db_path))
            .await
            .map_err(|e| format!("db open task panicked: {e}"))?
            .map_err(|e| format!("failed to open database: {e}"))?;

        let presence = Arc::new(Presence::new(config.presence_ttl, config.presence_offline_after));

        let state = Self {
            config,
            db: Arc::new(Mutex::new(conn)),
            rooms: Arc::new(Mutex::new(HashMap::new())),
            presence,
        };

        state.spawn_background_tasks();
        Ok(state)
    }

    /// Spawns the periodic presence-sweep / stale-session-purge task, the
    /// server-side analogue of the teacher's debounced `auto_save_task`.
    fn spawn_background_tasks(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                state.sweep_presence().await;
                state.purge_stale_sessions().await;
            }
        });
    }

    /// Flips idle users offline (`presence_offline_after`) and evicts users
    /// who've had no activity at all for `presence_ttl` from the cache,
    /// two separate thresholds per §6.
    async fn sweep_presence(&self) {
        let idle = self.presence.sweep_idle(std::time::Instant::now());
        for user_id in idle {
            self.presence.remove(&user_id);
            if let Err(err) = self.set_user_online(&user_id, false).await {
                warn!(%user_id, %err, "failed to persist presence offline transition");
            }
        }
        let expired = self.presence.sweep_expired(std::time::Instant::now());
        if !expired.is_empty() {
            debug!(count = expired.len(), "evicted expired presence cache entries");
        }
    }

    async fn purge_stale_sessions(&self) {
        let ttl = chrono::Duration::from_std(self.config.session_ttl).unwrap_or(chrono::Duration::hours(24));
        let result = self
            .with_db_blocking(move |conn| persistence::purge_inactive_sessions(conn, chrono::Utc::now(), ttl))
            .await;
        match result {
            Ok(count) if count > 0 => info!(count, "purged stale collaboration sessions"),
            Err(err) => warn!(%err, "failed to purge stale sessions"),
            _ => {}
        }
    }

    pub async fn set_user_online(&self, user_id: &str, online: bool) -> Result<(), rusqlite::Error> {
        let user_id = user_id.to_string();
        self.with_db_blocking(move |conn| {
            persistence::set_user_online(conn, &user_id, online, chrono::Utc::now())
        })
        .await
    }

    /// Returns the room for `diagram_id`, spawning its actor task on first
    /// use — rooms are never pre-declared, only lazily created.
    pub fn room(&self, diagram_id: &str) -> RoomHandle {
        let mut rooms = self.rooms.lock();
        rooms
            .entry(diagram_id.to_string())
            .or_insert_with(|| spawn_room(diagram_id.to_string(), self.db.clone()))
            .clone()
    }

    /// Runs a synchronous db closure inline, holding the lock for its
    /// duration. Use only for operations too small to justify a
    /// `spawn_blocking` hop.
    pub fn with_db<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T, rusqlite::Error> {
        let conn = self.db.lock();
        f(&conn)
    }

    /// Runs a synchronous db closure on the blocking pool, since `rusqlite`
    /// is not async.
    pub async fn with_db_blocking<T, F>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock();
            f(&conn)
        })
        .await
        .expect("db blocking task panicked")
    }
}
