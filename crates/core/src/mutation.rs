//! Structural mutations that bypass the editor's event bus and command
//! stack, plus the batch executor that orders and suspends/resumes around
//! them.

use serde_json::{Map, Value};

use crate::model::element::{
    BusinessObject, ConnectionData, Element, ElementData, ElementId, Point, ShapeData,
};
use crate::model::store::{GeometryPatch, ModelStore};
use crate::render::{LowLevelEditor, RenderGate, RenderGuard};

/// Input to `add_element_silently`.
#[derive(Debug, Clone, Default)]
pub struct NewElementData {
    pub id: Option<ElementId>,
    pub element_type: String,
    pub properties: Map<String, Value>,
    pub geometry: Option<GeometryPatch>,
}

/// Input to `add_connection_silently`.
#[derive(Debug, Clone, Default)]
pub struct NewConnectionData {
    pub id: Option<ElementId>,
    pub element_type: String,
    pub properties: Map<String, Value>,
    pub waypoints: Option<Vec<Point>>,
}

/// A single operation in a batch, tagged by the kind the ordering rule
/// (§4.3/§5) groups on.
#[derive(Debug, Clone)]
pub enum MutationOp {
    Create {
        id: Option<ElementId>,
        element_type: String,
        properties: Map<String, Value>,
        parent: Option<ElementId>,
        geometry: Option<GeometryPatch>,
    },
    CreateConnection {
        id: Option<ElementId>,
        element_type: String,
        properties: Map<String, Value>,
        source_id: ElementId,
        target_id: ElementId,
        waypoints: Option<Vec<Point>>,
    },
    Property {
        id: ElementId,
        patch: Map<String, Value>,
    },
    Position {
        id: ElementId,
        geometry: GeometryPatch,
    },
    Remove {
        id: ElementId,
    },
}

impl MutationOp {
    fn rank(&self) -> u8 {
        match self {
            MutationOp::Create { .. } | MutationOp::CreateConnection { .. } => 0,
            MutationOp::Property { .. } => 1,
            MutationOp::Position { .. } => 2,
            MutationOp::Remove { .. } => 3,
        }
    }
}

/// Result of applying one op within a batch. Malformed/unknown-id ops are
/// reported here rather than aborting the batch (§7 propagation policy).
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Created(ElementId),
    Updated(ElementId),
    Removed(ElementId),
    Skipped { reason: String },
}

pub const DEFAULT_LARGE_BATCH_CHUNK_SIZE: usize = 50;

pub struct SilentMutationLayer<E: LowLevelEditor> {
    pub store: ModelStore,
    pub render_gate: RenderGate<E>,
}

impl<E: LowLevelEditor> SilentMutationLayer<E> {
    pub fn new(editor: E) -> Self {
        Self {
            store: ModelStore::new(),
            render_gate: RenderGate::new(editor),
        }
    }

    pub fn update_business_object_directly(
        &mut self,
        id: &ElementId,
        patch: Map<String, Value>,
    ) -> Option<Element> {
        let element = self.store.set_business(id, patch)?.clone();
        self.render_gate.refresh_element(id);
        Some(element)
    }

    pub fn set_business_object_property(&mut self, id: &ElementId, path: &str, value: Value) -> bool {
        let Some(element) = self.store.get_mut(id) else {
            return false;
        };
        let ok = element.business.set_path(path, value);
        if ok {
            self.render_gate.refresh_element(id);
        }
        ok
    }

    pub fn set_business_object_parent(&mut self, child_id: &ElementId, parent_id: &ElementId) -> bool {
        let ok = self.store.reparent(child_id, parent_id);
        if ok {
            self.render_gate.refresh_element(child_id);
        }
        ok
    }

    /// Construct and insert a shape. Overwrites (remove-then-insert) if the
    /// supplied id already exists — the registry-reregistration behavior
    /// decided for inbound creates in DESIGN.md's Open Question on id
    /// collisions.
    pub fn add_element_silently(&mut self, data: NewElementData, parent: Option<&ElementId>) -> Element {
        let id = data.id.unwrap_or_else(ElementId::generate);

        let mut business = BusinessObject::new();
        business.merge_patch(data.properties);

        let mut shape = ShapeData::default();
        if let Some(g) = data.geometry {
            if let Some(x) = g.x {
                shape.x = x;
            }
            if let Some(y) = g.y {
                shape.y = y;
            }
            if let Some(w) = g.width {
                shape.width = w;
            }
            if let Some(h) = g.height {
                shape.height = h;
            }
        }

        let element = Element {
            id: id.clone(),
            element_type: data.element_type,
            business,
            data: ElementData::Shape(shape),
        };

        if self.store.contains(&id) {
            self.store.remove_by_id(&id);
        }
        self.store
            .insert_shape(element.clone())
            .expect("a freshly-cleared id cannot collide");

        if let Some(p) = parent {
            self.store.reparent(&id, p);
        }

        self.render_gate.editor().register_graphics(&id);
        self.render_gate.refresh_element(&id);

        self.store.get(&id).cloned().unwrap_or(element)
    }

    /// Construct and insert a connection. Both endpoints must already
    /// exist; returns `None` otherwise. Waypoints default to the centers
    /// of the source/target shapes when not supplied.
    pub fn add_connection_silently(
        &mut self,
        data: NewConnectionData,
        source_id: &ElementId,
        target_id: &ElementId,
    ) -> Option<Element> {
        if !self.store.contains(source_id) || !self.store.contains(target_id) {
            return None;
        }

        let id = data.id.unwrap_or_else(ElementId::generate);
        let waypoints = data.waypoints.unwrap_or_else(|| {
            match (self.shape_center(source_id), self.shape_center(target_id)) {
                (Some(s), Some(t)) => vec![s, t],
                _ => Vec::new(),
            }
        });

        let mut business = BusinessObject::new();
        business.merge_patch(data.properties);
        business.set("sourceRef", Value::String(source_id.0.clone()));
        business.set("targetRef", Value::String(target_id.0.clone()));

        let element = Element {
            id: id.clone(),
            element_type: data.element_type,
            business,
            data: ElementData::Connection(ConnectionData {
                source_id: source_id.clone(),
                target_id: target_id.clone(),
                waypoints,
            }),
        };

        if self.store.contains(&id) {
            self.store.remove_by_id(&id);
        }
        self.store.insert_connection(element.clone()).ok()?;

        self.render_gate.editor().register_graphics(&id);
        self.render_gate.refresh_element(&id);

        self.store.get(&id).cloned()
    }

    fn shape_center(&self, id: &ElementId) -> Option<Point> {
        let shape = self.store.get(id)?.data.as_shape()?;
        Some(Point::new(
            shape.x as f64 + shape.width as f64 / 2.0,
            shape.y as f64 + shape.height as f64 / 2.0,
        ))
    }

    /// Cascades to incident connections before removing a shape.
    /// Idempotent on unknown ids.
    pub fn remove_element_silently(&mut self, id: &ElementId) -> bool {
        let Some(element) = self.store.get(id) else {
            return false;
        };
        let cascaded: Vec<ElementId> = match &element.data {
            ElementData::Shape(s) => s.incoming.iter().chain(s.outgoing.iter()).cloned().collect(),
            ElementData::Connection(_) => Vec::new(),
        };

        let removed = self.store.remove_by_id(id);
        if removed {
            self.render_gate.editor().remove_element_raw(id);
            for conn_id in &cascaded {
                self.render_gate.editor().remove_element_raw(conn_id);
            }
        }
        removed
    }

    pub fn update_visual_properties_directly(&mut self, id: &ElementId, patch: GeometryPatch) -> bool {
        let ok = self.store.set_geometry(id, patch);
        if ok {
            self.render_gate.refresh_element(id);
        }
        ok
    }

    pub fn set_element_position(&mut self, id: &ElementId, x: i64, y: i64) -> bool {
        self.update_visual_properties_directly(
            id,
            GeometryPatch {
                x: Some(x),
                y: Some(y),
                ..Default::default()
            },
        )
    }

    pub fn set_element_size(&mut self, id: &ElementId, width: u32, height: u32) -> bool {
        self.update_visual_properties_directly(
            id,
            GeometryPatch {
                width: Some(width),
                height: Some(height),
                ..Default::default()
            },
        )
    }

    pub fn refresh_element_graphics(&self, id: &ElementId) {
        self.render_gate.refresh_element(id);
    }

    pub fn refresh_all_graphics(&self) {
        self.render_gate.refresh_all();
    }

    fn apply_op(&mut self, op: MutationOp) -> OpOutcome {
        match op {
            MutationOp::Create {
                id,
                element_type,
                properties,
                parent,
                geometry,
            } => {
                if let Some(p) = &parent {
                    if !self.store.contains(p) {
                        return OpOutcome::Skipped {
                            reason: format!("parent {p} not found"),
                        };
                    }
                }
                let element = self.add_element_silently(
                    NewElementData {
                        id,
                        element_type,
                        properties,
                        geometry,
                    },
                    parent.as_ref(),
                );
                OpOutcome::Created(element.id)
            }
            MutationOp::CreateConnection {
                id,
                element_type,
                properties,
                source_id,
                target_id,
                waypoints,
            } => match self.add_connection_silently(
                NewConnectionData {
                    id,
                    element_type,
                    properties,
                    waypoints,
                },
                &source_id,
                &target_id,
            ) {
                Some(element) => OpOutcome::Created(element.id),
                None => OpOutcome::Skipped {
                    reason: format!("connection endpoint missing ({source_id} -> {target_id})"),
                },
            },
            MutationOp::Property { id, patch } => {
                if self.update_business_object_directly(&id, patch).is_some() {
                    OpOutcome::Updated(id)
                } else {
                    OpOutcome::Skipped {
                        reason: format!("element {id} not found"),
                    }
                }
            }
            MutationOp::Position { id, geometry } => {
                if self.update_visual_properties_directly(&id, geometry) {
                    OpOutcome::Updated(id)
                } else {
                    OpOutcome::Skipped {
                        reason: format!("element {id} not found or not a shape"),
                    }
                }
            }
            MutationOp::Remove { id } => {
                if self.remove_element_silently(&id) {
                    OpOutcome::Removed(id)
                } else {
                    OpOutcome::Skipped {
                        reason: format!("element {id} not found"),
                    }
                }
            }
        }
    }

    /// Apply `ops` in the order given, suspending rendering for the whole
    /// batch and resuming on every exit path (including a panic during
    /// unwinding, via `RenderGuard`'s `Drop`).
    pub fn batch_update(&mut self, ops: Vec<MutationOp>) -> Vec<OpOutcome> {
        let _guard = RenderGuard::enter(&self.render_gate);
        ops.into_iter().map(|op| self.apply_op(op)).collect()
    }

    /// Partition `ops` by kind and apply in the fixed order
    /// create → property → position → remove, within one suspend/resume
    /// span. Returns outcomes in application order.
    pub fn batch_update_optimized(&mut self, ops: Vec<MutationOp>) -> Vec<OpOutcome> {
        let _guard = RenderGuard::enter(&self.render_gate);
        let mut ordered = ops;
        ordered.sort_by_key(|op| op.rank());
        ordered.into_iter().map(|op| self.apply_op(op)).collect()
    }

    /// Split `ops` into `chunk_size`-sized chunks (preserving original
    /// order across chunks) and run `batch_update_optimized` on each. The
    /// render gate is suspended only within each chunk's call, never across
    /// chunks — callers driving an event loop should call
    /// `batch_update_optimized` per chunk directly and yield between calls
    /// instead of using this synchronous convenience, which applies every
    /// chunk back-to-back without yielding (see `collab-server`'s actor
    /// loop for the yielding variant).
    pub fn batch_update_large(&mut self, ops: Vec<MutationOp>, chunk_size: usize) -> Vec<OpOutcome> {
        let chunk_size = chunk_size.max(1);
        let mut outcomes = Vec::with_capacity(ops.len());
        for chunk in ops.chunks(chunk_size) {
            outcomes.extend(self.batch_update_optimized(chunk.to_vec()));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::NullEditor;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn layer() -> SilentMutationLayer<NullEditor> {
        SilentMutationLayer::new(NullEditor)
    }

    #[test]
    fn add_element_defaults_geometry() {
        let mut layer = layer();
        let el = layer.add_element_silently(
            NewElementData {
                element_type: "Task".into(),
                ..Default::default()
            },
            None,
        );
        let shape = el.data.as_shape().unwrap();
        assert_eq!((shape.x, shape.y, shape.width, shape.height), (0, 0, 100, 80));
    }

    #[test]
    fn add_connection_defaults_waypoints_to_centers() {
        let mut layer = layer();
        let a = layer.add_element_silently(
            NewElementData {
                id: Some(ElementId::new("a")),
                element_type: "Task".into(),
                geometry: Some(GeometryPatch {
                    x: Some(0),
                    y: Some(0),
                    width: Some(100),
                    height: Some(80),
                }),
                ..Default::default()
            },
            None,
        );
        let b = layer.add_element_silently(
            NewElementData {
                id: Some(ElementId::new("b")),
                element_type: "Task".into(),
                geometry: Some(GeometryPatch {
                    x: Some(200),
                    y: Some(0),
                    width: Some(100),
                    height: Some(80),
                }),
                ..Default::default()
            },
            None,
        );

        let conn = layer
            .add_connection_silently(
                NewConnectionData {
                    element_type: "SequenceFlow".into(),
                    ..Default::default()
                },
                &a.id,
                &b.id,
            )
            .unwrap();
        let conn_data = conn.data.as_connection().unwrap();
        assert_eq!(conn_data.waypoints, vec![Point::new(50.0, 40.0), Point::new(250.0, 40.0)]);
        assert_eq!(conn.business.get_str("sourceRef"), Some("a"));
        assert_eq!(conn.business.get_str("targetRef"), Some("b"));
    }

    #[test]
    fn add_connection_missing_endpoint_returns_none() {
        let mut layer = layer();
        let a = layer.add_element_silently(
            NewElementData {
                element_type: "Task".into(),
                ..Default::default()
            },
            None,
        );
        let result = layer.add_connection_silently(
            NewConnectionData {
                element_type: "SequenceFlow".into(),
                ..Default::default()
            },
            &a.id,
            &ElementId::new("missing"),
        );
        assert!(result.is_none());
    }

    #[test]
    fn batch_update_optimized_orders_create_before_property_before_position_before_remove() {
        let mut layer = layer();
        let x = layer.add_element_silently(
            NewElementData {
                id: Some(ElementId::new("x")),
                element_type: "Task".into(),
                ..Default::default()
            },
            None,
        );
        let z = layer.add_element_silently(
            NewElementData {
                id: Some(ElementId::new("z")),
                element_type: "Task".into(),
                ..Default::default()
            },
            None,
        );

        let mut name_patch = Map::new();
        name_patch.insert("name".into(), Value::String("N".into()));

        let ops = vec![
            MutationOp::Remove { id: x.id.clone() },
            MutationOp::Create {
                id: Some(ElementId::new("y")),
                element_type: "Task".into(),
                properties: Map::new(),
                parent: None,
                geometry: None,
            },
            MutationOp::Property {
                id: z.id.clone(),
                patch: name_patch,
            },
            MutationOp::Position {
                id: z.id.clone(),
                geometry: GeometryPatch {
                    x: Some(10),
                    y: Some(20),
                    ..Default::default()
                },
            },
        ];

        let outcomes = layer.batch_update_optimized(ops);
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
        assert!(layer.store.get(&x.id).is_none());
        let z_after = layer.store.get(&z.id).unwrap();
        assert_eq!(z_after.business.get_str("name"), Some("N"));
        let z_shape = z_after.data.as_shape().unwrap();
        assert_eq!((z_shape.x, z_shape.y), (10, 20));
    }

    #[test]
    fn batch_update_never_aborts_on_malformed_op() {
        let mut layer = layer();
        let ops = vec![
            MutationOp::Remove {
                id: ElementId::new("ghost"),
            },
            MutationOp::Create {
                id: Some(ElementId::new("real")),
                element_type: "Task".into(),
                properties: Map::new(),
                parent: None,
                geometry: None,
            },
        ];
        let outcomes = layer.batch_update(ops);
        assert!(matches!(outcomes[0], OpOutcome::Skipped { .. }));
        assert!(matches!(outcomes[1], OpOutcome::Created(_)));
    }

    #[test]
    fn render_gate_released_after_every_batch_kind() {
        let mut layer = layer();
        layer.batch_update(vec![]);
        assert!(!layer.render_gate.is_suspended());
        layer.batch_update_optimized(vec![]);
        assert!(!layer.render_gate.is_suspended());
        layer.batch_update_large(vec![], 50);
        assert!(!layer.render_gate.is_suspended());
    }

    #[test]
    fn batch_update_large_chunks_and_suspends_per_chunk() {
        struct RecordingEditor {
            suspend_calls: Rc<RefCell<Vec<bool>>>,
        }
        impl LowLevelEditor for RecordingEditor {
            fn add_element_raw(&self, _e: &Element) {}
            fn remove_element_raw(&self, _id: &ElementId) {}
            fn suspend_render(&self) {
                self.suspend_calls.borrow_mut().push(true);
            }
            fn resume_render(&self) {
                self.suspend_calls.borrow_mut().push(false);
            }
            fn refresh_graphics(&self, _id: &ElementId) {}
            fn register_graphics(&self, _id: &ElementId) {}
            fn refresh_all_graphics(&self) {}
        }

        let calls = Rc::new(RefCell::new(Vec::new()));
        let editor = RecordingEditor {
            suspend_calls: calls.clone(),
        };
        let mut layer = SilentMutationLayer::new(editor);

        let ops: Vec<MutationOp> = (0..250)
            .map(|i| MutationOp::Create {
                id: Some(ElementId::new(format!("n{i}"))),
                element_type: "Task".into(),
                properties: Map::new(),
                parent: None,
                geometry: None,
            })
            .collect();

        let outcomes = layer.batch_update_large(ops, 50);
        assert_eq!(outcomes.len(), 250);
        assert_eq!(layer.store.len(), 250);
        // 5 chunks => 5 suspend/resume pairs, alternating.
        assert_eq!(calls.borrow().len(), 10);
        assert!(calls.borrow().iter().step_by(2).all(|&v| v));
        assert!(calls.borrow().iter().skip(1).step_by(2).all(|&v| !v));
    }
}
