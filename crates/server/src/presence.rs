//! Presence cache: which users are online, on which sockets, and how
//! recently active (§6 persisted state / presence cache). Modeled on the
//! same `parking_lot::Mutex`-guarded shared-state idiom as `state.rs`, with
//! a periodic sweep task grounded on the teacher's `auto_save_task` loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    socket_id: String,
    last_activity: Instant,
}

/// Bidirectional user<->socket index plus last-activity timestamps.
///
/// Two distinct thresholds apply to the same `last_activity` timestamp:
/// `offline_after` (short, flips a user's `isOnline` flag) and `ttl` (long,
/// evicts the cache entry outright once a user has been untouched for the
/// full presence-cache lifetime, per §6).
pub struct Presence {
    by_user: Mutex<HashMap<String, Entry>>,
    by_socket: Mutex<HashMap<String, String>>,
    ttl: Duration,
    offline_after: Duration,
}

impl Presence {
    pub fn new(ttl: Duration, offline_after: Duration) -> Self {
        Self {
            by_user: Mutex::new(HashMap::new()),
            by_socket: Mutex::new(HashMap::new()),
            ttl,
            offline_after,
        }
    }

    pub fn mark_online(&self, user_id: &str, socket_id: &str, now: Instant) {
        self.by_user.lock().insert(
            user_id.to_string(),
            Entry { socket_id: socket_id.to_string(), last_activity: now },
        );
        self.by_socket.lock().insert(socket_id.to_string(), user_id.to_string());
    }

    pub fn touch(&self, user_id: &str, now: Instant) {
        if let Some(entry) = self.by_user.lock().get_mut(user_id) {
            entry.last_activity = now;
        }
    }

    pub fn mark_offline_by_socket(&self, socket_id: &str) -> Option<String> {
        let user_id = self.by_socket.lock().remove(socket_id)?;
        self.by_user.lock().remove(&user_id);
        Some(user_id)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user.lock().contains_key(user_id)
    }

    pub fn online_user_ids(&self) -> Vec<String> {
        self.by_user.lock().keys().cloned().collect()
    }

    /// Flags (and returns) users idle past `offline_after`; caller is
    /// responsible for removing them and persisting the transition.
    pub fn sweep_idle(&self, now: Instant) -> Vec<String> {
        let by_user = self.by_user.lock();
        by_user
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > self.offline_after)
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub fn remove(&self, user_id: &str) {
        if let Some(entry) = self.by_user.lock().remove(user_id) {
            self.by_socket.lock().remove(&entry.socket_id);
        }
    }

    /// Evicts (and returns) users untouched for longer than `ttl`, dropping
    /// them from the cache entirely rather than just flagging them offline.
    pub fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = {
            let by_user = self.by_user.lock();
            by_user
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_activity) > self.ttl)
                .map(|(user_id, _)| user_id.clone())
                .collect()
        };
        for user_id in &expired {
            self.remove(user_id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_online_then_offline_round_trips() {
        let presence = Presence::new(Duration::from_secs(3600), Duration::from_secs(300));
        let now = Instant::now();
        presence.mark_online("u1", "s1", now);
        assert!(presence.is_online("u1"));

        let departed = presence.mark_offline_by_socket("s1");
        assert_eq!(departed.as_deref(), Some("u1"));
        assert!(!presence.is_online("u1"));
    }

    #[test]
    fn sweep_idle_flags_stale_users() {
        let presence = Presence::new(Duration::from_secs(3600), Duration::from_millis(1));
        let now = Instant::now();
        presence.mark_online("u1", "s1", now);

        let later = now + Duration::from_millis(50);
        let idle = presence.sweep_idle(later);
        assert_eq!(idle, vec!["u1".to_string()]);
    }

    #[test]
    fn sweep_expired_evicts_long_idle_users() {
        let presence = Presence::new(Duration::from_millis(1), Duration::from_secs(3600));
        let now = Instant::now();
        presence.mark_online("u1", "s1", now);

        let later = now + Duration::from_millis(50);
        let expired = presence.sweep_expired(later);
        assert_eq!(expired, vec!["u1".to_string()]);
        assert!(!presence.is_online("u1"));
    }
}
