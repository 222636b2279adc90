//! Bundles the mutation layer and the mediator into the single object a
//! host owns per diagram (one per room on the server, grounded on the same
//! one-engine-per-document shape as `collab-server`'s per-diagram actor).

use std::time::Instant;

use crate::codec::ChangeEvent;
use crate::mediator::EventMediator;
use crate::mutation::{OpOutcome, SilentMutationLayer};
use crate::render::LowLevelEditor;

pub struct Engine<E: LowLevelEditor> {
    pub mutation: SilentMutationLayer<E>,
    pub mediator: EventMediator,
}

impl<E: LowLevelEditor> Engine<E> {
    pub fn new(editor: E) -> Self {
        Self {
            mutation: SilentMutationLayer::new(editor),
            mediator: EventMediator::new(),
        }
    }

    /// Apply an inbound remote batch through the mediator, which drives the
    /// mutation layer's batch executor under the fixed ordering and
    /// suspend/resume span, then marks every touched id as a recent
    /// remote source.
    pub fn apply_remote_changes(&mut self, changes: Vec<ChangeEvent>, now: Instant) -> Vec<OpOutcome> {
        self.mediator.apply_remote_changes(&mut self.mutation, changes, now)
    }

    /// Periodic maintenance: prune expired mediator bookkeeping. Driven on
    /// a 5 s tick by the hosting actor.
    pub fn sweep(&mut self, now: Instant) {
        self.mediator.sweep_expired(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChangeKind;
    use crate::model::element::ElementId;
    use crate::render::NullEditor;

    #[test]
    fn engine_wires_mediator_to_mutation_layer() {
        let mut engine = Engine::new(NullEditor);
        let now = Instant::now();

        let change = ChangeEvent {
            kind: ChangeKind::Create,
            element_id: ElementId::new("s1"),
            element_type: Some("Task".into()),
            properties: None,
            x: Some(5),
            y: Some(5),
            width: None,
            height: None,
            element_data: None,
            source_id: None,
            target_id: None,
            timestamp: 0,
            user_id: None,
            is_remote: Some(true),
        };

        engine.apply_remote_changes(vec![change], now);
        assert!(engine.mutation.store.get(&ElementId::new("s1")).is_some());
        assert!(engine.mediator.should_ignore(&ElementId::new("s1"), now));
    }
}
