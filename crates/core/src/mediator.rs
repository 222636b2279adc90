//! The reentrancy guard between locally- and remotely-originated
//! mutations (§4.5). Entirely clock-injected: every time-sensitive
//! operation takes `now: Instant` rather than reading the system clock, so
//! the quantified invariants in §8 run instantly under test.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::codec::{ChangeEvent, ChangeKind};
use crate::model::element::ElementId;
use crate::mutation::{OpOutcome, SilentMutationLayer};
use crate::render::LowLevelEditor;

pub const ECHO_SUPPRESSION_WINDOW: Duration = Duration::from_secs(5);
pub const CHANGE_TRACKER_TTL: Duration = Duration::from_secs(10);
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
pub const DUPLICATE_FILTER_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
struct EventSourceRecord {
    timestamp: Instant,
    origin: EventOrigin,
    processed: bool,
}

#[derive(Debug, Clone)]
struct ChangeTrackerEntry {
    last_kind: ChangeKind,
    change_count: u64,
    last_timestamp: Instant,
}

/// Subscribes (conceptually) to the editor's event bus and mediates
/// between the local and remote mutation paths. Owns no transport or
/// timer — the hosting actor polls `poll_debounce`/`sweep_expired` with an
/// externally-driven clock.
pub struct EventMediator {
    is_processing_remote_event: bool,
    remote_event_sources: HashMap<ElementId, Instant>,
    event_source_history: HashMap<ElementId, EventSourceRecord>,
    change_tracker: HashMap<ElementId, ChangeTrackerEntry>,
    change_buffer: HashMap<ElementId, ChangeEvent>,
    debounce_deadline: Option<Instant>,
    local_listeners: Vec<Box<dyn Fn(&[ChangeEvent]) + Send + Sync>>,
    remote_listeners: Vec<Box<dyn Fn(&ChangeEvent) + Send + Sync>>,
}

impl Default for EventMediator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMediator {
    pub fn new() -> Self {
        Self {
            is_processing_remote_event: false,
            remote_event_sources: HashMap::new(),
            event_source_history: HashMap::new(),
            change_tracker: HashMap::new(),
            change_buffer: HashMap::new(),
            debounce_deadline: None,
            local_listeners: Vec::new(),
            remote_listeners: Vec::new(),
        }
    }

    pub fn on_local_change(&mut self, listener: impl Fn(&[ChangeEvent]) + Send + Sync + 'static) {
        self.local_listeners.push(Box::new(listener));
    }

    pub fn on_remote_change(&mut self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        self.remote_listeners.push(Box::new(listener));
    }

    pub fn is_processing_remote_event(&self) -> bool {
        self.is_processing_remote_event
    }

    /// The inbound decision function. Mutates state: a hit against
    /// `remote_event_sources` consumes that entry (one-shot).
    pub fn should_ignore(&mut self, id: &ElementId, now: Instant) -> bool {
        if self.is_processing_remote_event {
            return true;
        }
        if self.remote_event_sources.remove(id).is_some() {
            return true;
        }
        if let Some(record) = self.event_source_history.get(id) {
            if record.origin == EventOrigin::Remote
                && now.saturating_duration_since(record.timestamp) < ECHO_SUPPRESSION_WINDOW
                && !record.processed
            {
                return true;
            }
        }
        false
    }

    /// Same-id/same-kind duplicate filter. Returns `true` (drop) if this
    /// event arrived within 50 ms of the previous same-kind event for the
    /// same id; otherwise records it in the tracker and returns `false`.
    fn record_local_change(&mut self, kind: ChangeKind, id: &ElementId, now: Instant) -> bool {
        if let Some(entry) = self.change_tracker.get(id) {
            if entry.last_kind as u8 == kind as u8
                && now.saturating_duration_since(entry.last_timestamp) < DUPLICATE_FILTER_WINDOW
            {
                return true;
            }
        }
        let entry = self
            .change_tracker
            .entry(id.clone())
            .or_insert(ChangeTrackerEntry {
                last_kind: kind,
                change_count: 0,
                last_timestamp: now,
            });
        entry.last_kind = kind;
        entry.change_count += 1;
        entry.last_timestamp = now;
        false
    }

    /// Route a debounced-kind local event (`element.changed`,
    /// `commandStack.changed` for property/move commands,
    /// `shape.moved`/`connection.moved`) through the duplicate filter and
    /// into the coalescing buffer. Returns `false` if dropped as a
    /// duplicate.
    pub fn handle_local_debounced(&mut self, event: ChangeEvent, now: Instant) -> bool {
        if self.record_local_change(event.kind, &event.element_id, now) {
            return false;
        }
        self.change_buffer.insert(event.element_id.clone(), event);
        self.debounce_deadline = Some(now + DEBOUNCE_WINDOW);
        true
    }

    /// If the debounce deadline has passed as of `now`, drain and return
    /// the coalesced buffer (one entry per id, the latest value), firing
    /// `onLocalChange` listeners. Returns `None` if the deadline hasn't
    /// arrived yet or there is nothing buffered.
    pub fn poll_debounce(&mut self, now: Instant) -> Option<Vec<ChangeEvent>> {
        let deadline = self.debounce_deadline?;
        if now < deadline {
            return None;
        }
        self.debounce_deadline = None;
        if self.change_buffer.is_empty() {
            return None;
        }
        let flushed: Vec<ChangeEvent> = self.change_buffer.drain().map(|(_, v)| v).collect();
        for listener in &self.local_listeners {
            listener(&flushed);
        }
        Some(flushed)
    }

    /// Route an immediate-kind local event (`shape.added`/`connection.added`,
    /// `shape.removed`/`connection.removed`) straight to `onLocalChange`,
    /// no debounce, no duplicate filter.
    pub fn handle_local_immediate(&mut self, event: ChangeEvent) -> ChangeEvent {
        let batch = std::slice::from_ref(&event);
        for listener in &self.local_listeners {
            listener(batch);
        }
        event
    }

    /// Apply a remote batch: suspend rendering, apply in the fixed
    /// create → property → position → remove order via the mutation
    /// layer's batch executor, resume, then mark every touched id as a
    /// recent remote source so the aftershock is dropped by
    /// `should_ignore`.
    pub fn apply_remote_changes<E: LowLevelEditor>(
        &mut self,
        layer: &mut SilentMutationLayer<E>,
        changes: Vec<ChangeEvent>,
        now: Instant,
    ) -> Vec<OpOutcome> {
        self.is_processing_remote_event = true;

        let ops = changes.iter().filter_map(ChangeEvent::to_mutation_op).collect();
        let outcomes = layer.batch_update_optimized(ops);

        for change in &changes {
            self.remote_event_sources.insert(change.element_id.clone(), now);
            self.event_source_history.insert(
                change.element_id.clone(),
                EventSourceRecord {
                    timestamp: now,
                    origin: EventOrigin::Remote,
                    processed: true,
                },
            );
            for listener in &self.remote_listeners {
                listener(change);
            }
        }

        self.is_processing_remote_event = false;
        outcomes
    }

    /// Drop history entries older than 5 s and tracker entries older than
    /// 10 s. Driven externally on a 5 s tick.
    pub fn sweep_expired(&mut self, now: Instant) {
        self.remote_event_sources
            .retain(|_, ts| now.saturating_duration_since(*ts) < ECHO_SUPPRESSION_WINDOW);
        self.event_source_history
            .retain(|_, r| now.saturating_duration_since(r.timestamp) < ECHO_SUPPRESSION_WINDOW);
        self.change_tracker
            .retain(|_, e| now.saturating_duration_since(e.last_timestamp) < CHANGE_TRACKER_TTL);
    }

    /// Hard teardown: clears all maps, the pending buffer, and listeners.
    pub fn cleanup(&mut self) {
        self.is_processing_remote_event = false;
        self.remote_event_sources.clear();
        self.event_source_history.clear();
        self.change_tracker.clear();
        self.change_buffer.clear();
        self.debounce_deadline = None;
        self.local_listeners.clear();
        self.remote_listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::NullEditor;

    fn position_event(id: &str, x: i64, y: i64, ts: i64) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Position,
            element_id: ElementId::new(id),
            element_type: None,
            properties: None,
            x: Some(x),
            y: Some(y),
            width: None,
            height: None,
            element_data: None,
            source_id: None,
            target_id: None,
            timestamp: ts,
            user_id: None,
            is_remote: None,
        }
    }

    #[test]
    fn should_ignore_drops_while_processing_remote_event() {
        let mut mediator = EventMediator::new();
        let now = Instant::now();
        mediator.is_processing_remote_event = true;
        assert!(mediator.should_ignore(&ElementId::new("s1"), now));
    }

    #[test]
    fn remote_event_source_drops_exactly_one_echo() {
        let mut mediator = EventMediator::new();
        let now = Instant::now();
        let mut layer = SilentMutationLayer::new(NullEditor);
        layer.add_element_silently(
            crate::mutation::NewElementData {
                id: Some(ElementId::new("s1")),
                element_type: "Task".into(),
                ..Default::default()
            },
            None,
        );

        mediator.apply_remote_changes(
            &mut layer,
            vec![position_event("s1", 200, 200, 0)],
            now,
        );

        assert!(mediator.should_ignore(&ElementId::new("s1"), now));
        // The one-shot entry is consumed; a second local touch on the same
        // id is treated as a genuine new edit.
        assert!(!mediator.should_ignore(&ElementId::new("s1"), now));
    }

    #[test]
    fn duplicate_filter_drops_same_kind_within_50ms() {
        let mut mediator = EventMediator::new();
        let t0 = Instant::now();
        assert!(mediator.handle_local_debounced(position_event("s1", 1, 1, 0), t0));
        let t1 = t0 + Duration::from_millis(20);
        assert!(!mediator.handle_local_debounced(position_event("s1", 2, 2, 0), t1));
        let t2 = t0 + Duration::from_millis(60);
        assert!(mediator.handle_local_debounced(position_event("s1", 3, 3, 0), t2));
    }

    #[test]
    fn debounce_coalesces_burst_to_last_value() {
        let mut mediator = EventMediator::new();
        let t0 = Instant::now();
        mediator.handle_local_debounced(position_event("s1", 10, 10, 0), t0);
        let t1 = t0 + Duration::from_millis(80);
        mediator.handle_local_debounced(position_event("s1", 30, 30, 0), t1);

        assert!(mediator.poll_debounce(t1 + Duration::from_millis(50)).is_none());

        let flushed = mediator
            .poll_debounce(t1 + DEBOUNCE_WINDOW + Duration::from_millis(1))
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!((flushed[0].x, flushed[0].y), (Some(30), Some(30)));
    }

    #[test]
    fn apply_remote_changes_respects_batch_ordering() {
        let mut mediator = EventMediator::new();
        let mut layer = SilentMutationLayer::new(NullEditor);
        layer.add_element_silently(
            crate::mutation::NewElementData {
                id: Some(ElementId::new("x")),
                element_type: "Task".into(),
                ..Default::default()
            },
            None,
        );
        layer.add_element_silently(
            crate::mutation::NewElementData {
                id: Some(ElementId::new("z")),
                element_type: "Task".into(),
                ..Default::default()
            },
            None,
        );

        let mut z_patch = serde_json::Map::new();
        z_patch.insert("name".into(), serde_json::json!("N"));

        let changes = vec![
            ChangeEvent {
                kind: ChangeKind::Remove,
                element_id: ElementId::new("x"),
                element_type: None,
                properties: None,
                x: None,
                y: None,
                width: None,
                height: None,
                element_data: None,
                source_id: None,
                target_id: None,
                timestamp: 0,
                user_id: None,
                is_remote: Some(true),
            },
            ChangeEvent {
                kind: ChangeKind::Create,
                element_id: ElementId::new("y"),
                element_type: Some("Task".into()),
                properties: None,
                x: Some(0),
                y: Some(0),
                width: None,
                height: None,
                element_data: None,
                source_id: None,
                target_id: None,
                timestamp: 0,
                user_id: None,
                is_remote: Some(true),
            },
            ChangeEvent {
                kind: ChangeKind::Property,
                element_id: ElementId::new("z"),
                element_type: None,
                properties: Some(z_patch),
                x: None,
                y: None,
                width: None,
                height: None,
                element_data: None,
                source_id: None,
                target_id: None,
                timestamp: 0,
                user_id: None,
                is_remote: Some(true),
            },
            ChangeEvent {
                kind: ChangeKind::Position,
                element_id: ElementId::new("z"),
                element_type: None,
                properties: None,
                x: Some(10),
                y: Some(20),
                width: None,
                height: None,
                element_data: None,
                source_id: None,
                target_id: None,
                timestamp: 0,
                user_id: None,
                is_remote: Some(true),
            },
        ];

        let now = Instant::now();
        let outcomes = mediator.apply_remote_changes(&mut layer, changes, now);
        let kinds: Vec<&str> = outcomes
            .iter()
            .map(|o| match o {
                OpOutcome::Created(_) => "create",
                OpOutcome::Updated(_) => "update",
                OpOutcome::Removed(_) => "remove",
                OpOutcome::Skipped { .. } => "skip",
            })
            .collect();
        assert_eq!(kinds, vec!["create", "update", "update", "remove"]);

        assert!(layer.store.get(&ElementId::new("y")).is_some());
        assert!(layer.store.get(&ElementId::new("x")).is_none());
        let z = layer.store.get(&ElementId::new("z")).unwrap();
        assert_eq!(z.business.get_str("name"), Some("N"));
        assert_eq!(z.data.as_shape().unwrap().x, 10);

        assert!(!mediator.is_processing_remote_event());
        assert!(!layer.render_gate.is_suspended());
    }

    #[test]
    fn sweep_expired_prunes_stale_entries() {
        let mut mediator = EventMediator::new();
        let t0 = Instant::now();
        mediator.remote_event_sources.insert(ElementId::new("a"), t0);
        mediator.event_source_history.insert(
            ElementId::new("a"),
            EventSourceRecord {
                timestamp: t0,
                origin: EventOrigin::Remote,
                processed: true,
            },
        );
        mediator.change_tracker.insert(
            ElementId::new("a"),
            ChangeTrackerEntry {
                last_kind: ChangeKind::Position,
                change_count: 1,
                last_timestamp: t0,
            },
        );

        let well_past = t0 + Duration::from_secs(11);
        mediator.sweep_expired(well_past);
        assert!(mediator.remote_event_sources.is_empty());
        assert!(mediator.event_source_history.is_empty());
        assert!(mediator.change_tracker.is_empty());
    }

    #[test]
    fn cleanup_clears_everything() {
        let mut mediator = EventMediator::new();
        let now = Instant::now();
        mediator.handle_local_debounced(position_event("s1", 1, 1, 0), now);
        mediator.remote_event_sources.insert(ElementId::new("a"), now);
        mediator.cleanup();
        assert!(mediator.poll_debounce(now + Duration::from_secs(1)).is_none());
        assert!(!mediator.should_ignore(&ElementId::new("a"), now));
    }
}
