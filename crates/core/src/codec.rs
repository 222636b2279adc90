//! Canonical wire representation of a change event (§4.6), and the
//! translation between it and the mutation layer's typed ops.
//!
//! Property extraction is one-directional: encoding a local mutation into a
//! `ChangeEvent` only copies the known, well-behaved keys listed in §4.6.
//! Decoding an inbound `ChangeEvent` back into a `MutationOp` accepts
//! whatever is in `properties` verbatim — the wire schema doesn't carry a
//! `parent` field, so reparenting travels as an ordinary key in a
//! `property`-kind event's patch, same as any other business-object key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::element::{BusinessObject, Element, ElementId, Point};
use crate::model::store::GeometryPatch;
use crate::mutation::MutationOp;

/// Business-object keys copied onto the wire when encoding a `property`
/// change, in extraction order. Unlisted keys never cross the wire via the
/// encode path (they still travel fine as part of an explicit patch built
/// by hand, e.g. for reparenting).
pub const EXTRACTED_PROPERTY_KEYS: &[&str] = &[
    "name",
    "documentation",
    "assignee",
    "candidateUsers",
    "candidateGroups",
    "formKey",
    "priority",
    "dueDate",
];

/// Copy the well-known keys out of a business object, skipping absent ones.
pub fn extract_properties(business: &BusinessObject) -> Map<String, Value> {
    let mut out = Map::new();
    for key in EXTRACTED_PROPERTY_KEYS {
        if let Some(value) = business.get(key) {
            out.insert((*key).to_string(), value.clone());
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Property,
    Position,
    Create,
    Remove,
    Connection,
}

/// The wire form of a change event (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub element_id: ElementId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ElementId>,
    /// Milliseconds since epoch. Stamped by the caller (never read from the
    /// system clock inside `collab-core`).
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_remote: Option<bool>,
}

impl ChangeEvent {
    fn base(kind: ChangeKind, element_id: ElementId, timestamp: i64, user_id: Option<String>) -> Self {
        Self {
            kind,
            element_id,
            element_type: None,
            properties: None,
            x: None,
            y: None,
            width: None,
            height: None,
            element_data: None,
            source_id: None,
            target_id: None,
            timestamp,
            user_id,
            is_remote: None,
        }
    }

    /// Encode a property-kind change carrying the well-known extracted keys.
    pub fn encode_property(
        element: &Element,
        timestamp: i64,
        user_id: Option<String>,
    ) -> Self {
        let mut event = Self::base(ChangeKind::Property, element.id.clone(), timestamp, user_id);
        event.element_type = Some(element.element_type.clone());
        event.properties = Some(extract_properties(&element.business));
        event
    }

    /// Encode a position-kind change from a shape's current geometry.
    pub fn encode_position(element: &Element, timestamp: i64, user_id: Option<String>) -> Option<Self> {
        let shape = element.data.as_shape()?;
        let mut event = Self::base(ChangeKind::Position, element.id.clone(), timestamp, user_id);
        event.x = Some(shape.x);
        event.y = Some(shape.y);
        event.width = Some(shape.width);
        event.height = Some(shape.height);
        Some(event)
    }

    /// Encode a create-kind change for a newly inserted shape.
    pub fn encode_create(element: &Element, timestamp: i64, user_id: Option<String>) -> Option<Self> {
        let shape = element.data.as_shape()?;
        let mut event = Self::base(ChangeKind::Create, element.id.clone(), timestamp, user_id);
        event.element_type = Some(element.element_type.clone());
        event.x = Some(shape.x);
        event.y = Some(shape.y);
        event.width = Some(shape.width);
        event.height = Some(shape.height);
        event.properties = Some(extract_properties(&element.business));
        Some(event)
    }

    /// Encode a connection-kind change for a newly inserted connection.
    pub fn encode_connection(element: &Element, timestamp: i64, user_id: Option<String>) -> Option<Self> {
        let conn = element.data.as_connection()?;
        let mut event = Self::base(ChangeKind::Connection, element.id.clone(), timestamp, user_id);
        event.element_type = Some(element.element_type.clone());
        event.source_id = Some(conn.source_id.clone());
        event.target_id = Some(conn.target_id.clone());
        event.properties = Some(extract_properties(&element.business));
        event.element_data = Some(serde_json::json!({ "waypoints": conn.waypoints }));
        Some(event)
    }

    /// Encode a remove-kind change.
    pub fn encode_remove(element_id: ElementId, timestamp: i64, user_id: Option<String>) -> Self {
        Self::base(ChangeKind::Remove, element_id, timestamp, user_id)
    }

    fn geometry_patch(&self) -> GeometryPatch {
        GeometryPatch {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }

    fn waypoints(&self) -> Option<Vec<Point>> {
        let data = self.element_data.as_ref()?;
        let waypoints = data.get("waypoints")?;
        serde_json::from_value(waypoints.clone()).ok()
    }

    /// Translate a decoded wire event into the mutation layer's typed op.
    /// Returns `None` only for a malformed connection event missing an
    /// endpoint — the caller should treat that as a skipped/malformed op
    /// per §7, not a hard failure.
    pub fn to_mutation_op(&self) -> Option<MutationOp> {
        match self.kind {
            ChangeKind::Create => Some(MutationOp::Create {
                id: Some(self.element_id.clone()),
                element_type: self.element_type.clone().unwrap_or_default(),
                properties: self.properties.clone().unwrap_or_default(),
                parent: None,
                geometry: Some(self.geometry_patch()),
            }),
            ChangeKind::Connection => {
                let source_id = self.source_id.clone()?;
                let target_id = self.target_id.clone()?;
                Some(MutationOp::CreateConnection {
                    id: Some(self.element_id.clone()),
                    element_type: self.element_type.clone().unwrap_or_default(),
                    properties: self.properties.clone().unwrap_or_default(),
                    source_id,
                    target_id,
                    waypoints: self.waypoints(),
                })
            }
            ChangeKind::Property => Some(MutationOp::Property {
                id: self.element_id.clone(),
                patch: self.properties.clone().unwrap_or_default(),
            }),
            ChangeKind::Position => Some(MutationOp::Position {
                id: self.element_id.clone(),
                geometry: self.geometry_patch(),
            }),
            ChangeKind::Remove => Some(MutationOp::Remove {
                id: self.element_id.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::element::{ElementData, ShapeData};
    use serde_json::json;

    fn task(id: &str) -> Element {
        let mut element = Element::new_shape(ElementId::new(id), "Task");
        element.business.set("name", json!("Review"));
        element.business.set("internalOnly", json!("secret"));
        element
    }

    #[test]
    fn encode_property_only_copies_known_keys() {
        let element = task("t1");
        let event = ChangeEvent::encode_property(&element, 1000, Some("u1".into()));
        let props = event.properties.unwrap();
        assert_eq!(props.get("name"), Some(&json!("Review")));
        assert!(!props.contains_key("internalOnly"));
    }

    #[test]
    fn encode_create_defaults_geometry_from_shape() {
        let element = task("t1");
        let event = ChangeEvent::encode_create(&element, 1000, None).unwrap();
        assert_eq!(event.width, Some(100));
        assert_eq!(event.height, Some(80));
    }

    #[test]
    fn round_trips_through_mutation_op_for_create() {
        let mut data = ShapeData::default();
        data.x = 5;
        let mut element = Element {
            id: ElementId::new("t1"),
            element_type: "Task".into(),
            business: BusinessObject::new(),
            data: ElementData::Shape(data),
        };
        element.business.set("name", json!("Review"));
        let event = ChangeEvent::encode_create(&element, 1000, None).unwrap();

        let op = event.to_mutation_op().unwrap();
        match op {
            MutationOp::Create { geometry, .. } => {
                assert_eq!(geometry.unwrap().x, Some(5));
            }
            _ => panic!("expected Create op"),
        }
    }

    #[test]
    fn connection_event_without_endpoints_yields_no_op() {
        let event = ChangeEvent {
            kind: ChangeKind::Connection,
            element_id: ElementId::new("c1"),
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
            is_remote: None,
        };
        assert!(event.to_mutation_op().is_none());
    }
}
