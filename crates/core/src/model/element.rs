//! The graph element arena: shapes, connections, and their business objects.
//!
//! Elements live in an id-keyed arena (see [`super::store::ModelStore`]) rather
//! than behind pointers, so incident connections can be removed by id lookup
//! without fighting the borrow checker over cyclic shape↔connection references.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

/// Default shape width/height when none is specified on creation.
pub const DEFAULT_SHAPE_WIDTH: u32 = 100;
pub const DEFAULT_SHAPE_HEIGHT: u32 = 80;

/// Identity of an element, unique within a diagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random id (used when the caller doesn't supply one).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ElementId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ElementId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A waypoint on a connection's routed path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Which half of the kind tag an element belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Shape,
    Connection,
}

/// Shape-specific geometry and endpoint adjacency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeData {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
    /// Ids of connections whose `target_id` is this shape.
    #[serde(default)]
    pub incoming: HashSet<ElementId>,
    /// Ids of connections whose `source_id` is this shape.
    #[serde(default)]
    pub outgoing: HashSet<ElementId>,
}

impl Default for ShapeData {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: DEFAULT_SHAPE_WIDTH,
            height: DEFAULT_SHAPE_HEIGHT,
            incoming: HashSet::new(),
            outgoing: HashSet::new(),
        }
    }
}

/// Connection-specific endpoints and routed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub source_id: ElementId,
    pub target_id: ElementId,
    #[serde(default)]
    pub waypoints: Vec<Point>,
}

/// The kind-specific payload of an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementData {
    Shape(ShapeData),
    Connection(ConnectionData),
}

impl ElementData {
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementData::Shape(_) => ElementKind::Shape,
            ElementData::Connection(_) => ElementKind::Connection,
        }
    }

    pub fn as_shape(&self) -> Option<&ShapeData> {
        match self {
            ElementData::Shape(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_shape_mut(&mut self) -> Option<&mut ShapeData> {
        match self {
            ElementData::Shape(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_connection(&self) -> Option<&ConnectionData> {
        match self {
            ElementData::Connection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_connection_mut(&mut self) -> Option<&mut ConnectionData> {
        match self {
            ElementData::Connection(c) => Some(c),
            _ => None,
        }
    }
}

/// Open, dynamically-typed business object.
///
/// Modeled directly as the JSON map the spec describes — `name`,
/// `documentation`, `assignee`, `parent`, and friends are just well-known
/// keys in this map rather than separate struct fields, so dotted-path
/// writes (`documentation.text`) and unknown keys are handled uniformly
/// instead of needing a parallel `extras` bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessObject(pub Map<String, Value>);

impl BusinessObject {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.get_str("parent").map(ElementId::new)
    }

    pub fn set_parent(&mut self, id: &ElementId) {
        self.set("parent", Value::String(id.0.clone()));
    }

    /// Shallow-merge `patch` into this object: each top-level key in `patch`
    /// overwrites the corresponding key here (or is inserted if new).
    pub fn merge_patch(&mut self, patch: Map<String, Value>) {
        for (k, v) in patch {
            self.0.insert(k, v);
        }
    }

    /// Assign `value` at a dotted path (e.g. `"documentation.text"`),
    /// lazily creating intermediate object maps. Returns `false` if an
    /// intermediate segment already holds a non-object value (can't descend).
    pub fn set_path(&mut self, path: &str, value: Value) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        set_path_in_map(&mut self.0, &segments, value)
    }

    /// Read a value at a dotted path, if present.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self.0.get(path.split('.').next()?)?;
        for segment in path.split('.').skip(1) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// The `flowElements` id list, if this object carries one.
    pub fn flow_elements(&self) -> Option<Vec<ElementId>> {
        let arr = self.get("flowElements")?.as_array()?;
        Some(
            arr.iter()
                .filter_map(Value::as_str)
                .map(ElementId::new)
                .collect(),
        )
    }

    /// Append `child` to `flowElements` iff the list is already present and
    /// doesn't already contain it. No-op (returns `false`) if the key is
    /// absent or not an array — callers that want to create the list should
    /// set it explicitly first.
    pub fn append_flow_element(&mut self, child: &ElementId) -> bool {
        let Some(Value::Array(arr)) = self.0.get_mut("flowElements") else {
            return false;
        };
        let already_present = arr.iter().any(|v| v.as_str() == Some(child.0.as_str()));
        if !already_present {
            arr.push(Value::String(child.0.clone()));
        }
        true
    }
}

fn set_path_in_map(map: &mut Map<String, Value>, segments: &[&str], value: Value) -> bool {
    match segments {
        [] => false,
        [last] => {
            map.insert((*last).to_string(), value);
            true
        }
        [head, rest @ ..] => {
            let entry = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            let Value::Object(nested) = entry else {
                return false;
            };
            set_path_in_map(nested, rest, value)
        }
    }
}

/// A node in the diagram graph: a shape or a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub element_type: String,
    #[serde(default)]
    pub business: BusinessObject,
    #[serde(flatten)]
    pub data: ElementData,
}

impl Element {
    pub fn new_shape(id: ElementId, element_type: impl Into<String>) -> Self {
        Self {
            id,
            element_type: element_type.into(),
            business: BusinessObject::new(),
            data: ElementData::Shape(ShapeData::default()),
        }
    }

    pub fn new_connection(
        id: ElementId,
        element_type: impl Into<String>,
        source_id: ElementId,
        target_id: ElementId,
        waypoints: Vec<Point>,
    ) -> Self {
        Self {
            id,
            element_type: element_type.into(),
            business: BusinessObject::new(),
            data: ElementData::Connection(ConnectionData {
                source_id,
                target_id,
                waypoints,
            }),
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.data.kind()
    }

    pub fn is_shape(&self) -> bool {
        matches!(self.data, ElementData::Shape(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self.data, ElementData::Connection(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_path_creates_intermediate_maps() {
        let mut bo = BusinessObject::new();
        assert!(bo.set_path("documentation.text", Value::String("hi".into())));
        assert_eq!(
            bo.get_path("documentation.text"),
            Some(&Value::String("hi".into()))
        );
    }

    #[test]
    fn flow_elements_append_is_idempotent() {
        let mut bo = BusinessObject::new();
        bo.set("flowElements", Value::Array(vec![]));
        let child = ElementId::new("b1");
        assert!(bo.append_flow_element(&child));
        assert!(bo.append_flow_element(&child));
        assert_eq!(bo.flow_elements().unwrap(), vec![child]);
    }

    #[test]
    fn flow_elements_absent_is_noop() {
        let mut bo = BusinessObject::new();
        assert!(!bo.append_flow_element(&ElementId::new("x")));
    }

    #[test]
    fn shape_defaults_match_spec() {
        let shape = ShapeData::default();
        assert_eq!(shape.width, 100);
        assert_eq!(shape.height, 80);
        assert_eq!((shape.x, shape.y), (0, 0));
    }
}
