//! In-memory authoritative replica of the diagram graph.
//!
//! Single-writer discipline: a `ModelStore` is always owned by exactly one
//! task (see `collab-server`'s per-diagram actor) — no internal locking.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::element::{ConnectionData, Element, ElementData, ElementId, Point};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct ModelStore {
    elements: HashMap<ElementId, Element>,
}

/// Fields that may be patched by `set_geometry`; `None` leaves the field
/// untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryPatch {
    pub x: Option<i64>,
    pub y: Option<i64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn get_mut(&mut self, id: &ElementId) -> Option<&mut Element> {
        self.elements.get_mut(id)
    }

    pub fn contains(&self, id: &ElementId) -> bool {
        self.elements.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    /// Insert a new shape. Fails if `id` is already present.
    pub fn insert_shape(&mut self, element: Element) -> Result<()> {
        if !element.is_shape() {
            return Err(Error::NotAShape(element.id));
        }
        if self.elements.contains_key(&element.id) {
            return Err(Error::DuplicateId(element.id));
        }
        self.elements.insert(element.id.clone(), element);
        Ok(())
    }

    /// Insert a new connection. Fails if `id` is taken or either endpoint is
    /// missing. On success, updates both endpoints' adjacency sets.
    pub fn insert_connection(&mut self, element: Element) -> Result<()> {
        let ElementData::Connection(ConnectionData {
            source_id,
            target_id,
            ..
        }) = &element.data
        else {
            return Err(Error::NotAConnection(element.id));
        };
        if self.elements.contains_key(&element.id) {
            return Err(Error::DuplicateId(element.id));
        }
        if !self.elements.contains_key(source_id) {
            return Err(Error::EndpointNotFound(source_id.clone()));
        }
        if !self.elements.contains_key(target_id) {
            return Err(Error::EndpointNotFound(target_id.clone()));
        }

        let id = element.id.clone();
        let source_id = source_id.clone();
        let target_id = target_id.clone();
        self.elements.insert(id.clone(), element);

        if let Some(shape) = self
            .elements
            .get_mut(&source_id)
            .and_then(|e| e.data.as_shape_mut())
        {
            shape.outgoing.insert(id.clone());
        }
        if let Some(shape) = self
            .elements
            .get_mut(&target_id)
            .and_then(|e| e.data.as_shape_mut())
        {
            shape.incoming.insert(id);
        }
        Ok(())
    }

    /// Remove an element by id. Shapes cascade-remove all incident
    /// connections first. Idempotent — removing an unknown id returns
    /// `false` rather than erroring.
    pub fn remove_by_id(&mut self, id: &ElementId) -> bool {
        let Some(element) = self.elements.get(id) else {
            return false;
        };

        match &element.data {
            ElementData::Shape(shape) => {
                let incident: Vec<ElementId> =
                    shape.incoming.iter().chain(shape.outgoing.iter()).cloned().collect();
                for conn_id in incident {
                    self.remove_connection_only(&conn_id);
                }
                self.elements.remove(id);
            }
            ElementData::Connection(_) => {
                self.remove_connection_only(id);
            }
        }
        true
    }

    /// Remove a connection and detach it from both endpoints' adjacency,
    /// without touching the endpoints themselves.
    fn remove_connection_only(&mut self, id: &ElementId) {
        let Some(element) = self.elements.remove(id) else {
            return;
        };
        let ElementData::Connection(ConnectionData {
            source_id,
            target_id,
            ..
        }) = element.data
        else {
            return;
        };
        if let Some(shape) = self.elements.get_mut(&source_id).and_then(|e| e.data.as_shape_mut())
        {
            shape.outgoing.remove(id);
        }
        if let Some(shape) = self.elements.get_mut(&target_id).and_then(|e| e.data.as_shape_mut())
        {
            shape.incoming.remove(id);
        }
    }

    /// Shallow-merge `patch` into the element's business object, supporting
    /// dotted-path keys (e.g. `"documentation.text"`) in the patch's own
    /// top-level keys by delegating to `BusinessObject::set_path`.
    pub fn set_business(&mut self, id: &ElementId, patch: Map<String, Value>) -> Option<&Element> {
        let element = self.elements.get_mut(id)?;
        for (key, value) in patch {
            if key.contains('.') {
                element.business.set_path(&key, value);
            } else {
                element.business.set(key, value);
            }
        }
        Some(element)
    }

    pub fn set_geometry(&mut self, id: &ElementId, patch: GeometryPatch) -> bool {
        let Some(shape) = self.elements.get_mut(id).and_then(|e| e.data.as_shape_mut()) else {
            return false;
        };
        if let Some(x) = patch.x {
            shape.x = x;
        }
        if let Some(y) = patch.y {
            shape.y = y;
        }
        if let Some(width) = patch.width {
            shape.width = width;
        }
        if let Some(height) = patch.height {
            shape.height = height;
        }
        true
    }

    pub fn move_by(&mut self, id: &ElementId, dx: i64, dy: i64) -> bool {
        let Some(shape) = self.elements.get_mut(id).and_then(|e| e.data.as_shape_mut()) else {
            return false;
        };
        shape.x += dx;
        shape.y += dy;
        true
    }

    pub fn set_waypoints(&mut self, id: &ElementId, waypoints: Vec<Point>) -> bool {
        let Some(conn) = self.elements.get_mut(id).and_then(|e| e.data.as_connection_mut()) else {
            return false;
        };
        conn.waypoints = waypoints;
        true
    }

    /// Set `child.business.parent = parent_id` and, if the parent's business
    /// object already carries a `flowElements` list, append `child_id` to it
    /// (idempotently). Both ids must exist.
    pub fn reparent(&mut self, child_id: &ElementId, parent_id: &ElementId) -> bool {
        if !self.elements.contains_key(parent_id) {
            return false;
        }
        let Some(child) = self.elements.get_mut(child_id) else {
            return false;
        };
        child.business.set_parent(parent_id);

        if let Some(parent) = self.elements.get_mut(parent_id) {
            parent.business.append_flow_element(child_id);
        }
        true
    }

    pub fn count_by_type(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for element in self.elements.values() {
            *counts.entry(element.element_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::element::{Element, Point};

    fn shape(id: &str) -> Element {
        Element::new_shape(ElementId::new(id), "Task")
    }

    #[test]
    fn insert_connection_requires_both_endpoints() {
        let mut store = ModelStore::new();
        store.insert_shape(shape("a")).unwrap();
        let conn = Element::new_connection(
            ElementId::new("c1"),
            "SequenceFlow",
            ElementId::new("a"),
            ElementId::new("missing"),
            vec![],
        );
        assert!(matches!(
            store.insert_connection(conn),
            Err(Error::EndpointNotFound(_))
        ));
    }

    #[test]
    fn insert_connection_updates_adjacency() {
        let mut store = ModelStore::new();
        store.insert_shape(shape("a")).unwrap();
        store.insert_shape(shape("b")).unwrap();
        let conn = Element::new_connection(
            ElementId::new("c1"),
            "SequenceFlow",
            ElementId::new("a"),
            ElementId::new("b"),
            vec![Point::new(0.0, 0.0)],
        );
        store.insert_connection(conn).unwrap();

        let a = store.get(&ElementId::new("a")).unwrap();
        let b = store.get(&ElementId::new("b")).unwrap();
        assert!(a.data.as_shape().unwrap().outgoing.contains(&ElementId::new("c1")));
        assert!(b.data.as_shape().unwrap().incoming.contains(&ElementId::new("c1")));
    }

    #[test]
    fn remove_shape_cascades_to_connections() {
        let mut store = ModelStore::new();
        store.insert_shape(shape("a")).unwrap();
        store.insert_shape(shape("b")).unwrap();
        let conn = Element::new_connection(
            ElementId::new("c1"),
            "SequenceFlow",
            ElementId::new("a"),
            ElementId::new("b"),
            vec![],
        );
        store.insert_connection(conn).unwrap();

        assert!(store.remove_by_id(&ElementId::new("a")));

        assert!(store.get(&ElementId::new("a")).is_none());
        assert!(store.get(&ElementId::new("c1")).is_none());
        let b = store.get(&ElementId::new("b")).unwrap();
        assert!(b.data.as_shape().unwrap().incoming.is_empty());
    }

    #[test]
    fn remove_unknown_id_is_idempotent() {
        let mut store = ModelStore::new();
        assert!(!store.remove_by_id(&ElementId::new("ghost")));
    }

    #[test]
    fn reparent_appends_to_flow_elements_only_if_present() {
        let mut store = ModelStore::new();
        store.insert_shape(shape("parent")).unwrap();
        store.insert_shape(shape("child")).unwrap();

        store.reparent(&ElementId::new("child"), &ElementId::new("parent"));
        let child = store.get(&ElementId::new("child")).unwrap();
        assert_eq!(child.business.parent(), Some(ElementId::new("parent")));

        // No flowElements key yet on parent, so nothing appended.
        let parent = store.get(&ElementId::new("parent")).unwrap();
        assert!(parent.business.flow_elements().is_none());

        // Now give the parent a flowElements list and reparent again.
        store
            .get_mut(&ElementId::new("parent"))
            .unwrap()
            .business
            .set("flowElements", serde_json::Value::Array(vec![]));
        store.reparent(&ElementId::new("child"), &ElementId::new("parent"));
        let parent = store.get(&ElementId::new("parent")).unwrap();
        assert_eq!(
            parent.business.flow_elements().unwrap(),
            vec![ElementId::new("child")]
        );
    }

    #[test]
    fn count_by_type() {
        let mut store = ModelStore::new();
        store.insert_shape(shape("a")).unwrap();
        store.insert_shape(shape("b")).unwrap();
        let counts = store.count_by_type();
        assert_eq!(counts.get("Task"), Some(&2));
    }
}
