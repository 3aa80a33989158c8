//! Base object entity exchanged between agents
//!
//! Every message payload ultimately carries objects of this shape. The
//! `coreType` discriminator is a fixed closed set; the `objectType` string is
//! an extensible reverse-DNS name. Fields unknown to this crate are preserved
//! verbatim in a flattened side map so a decode/encode cycle reproduces the
//! original JSON.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reverse-DNS prefix for the framework's own object types
pub const OBJECT_TYPE_PREFIX: &str = "coaty";

/// Closed set of core object types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoreType {
    Object,
    Component,
    Device,
    User,
    Task,
    Location,
    Snapshot,
    Log,
    Config,
    Annotation,
}

impl CoreType {
    /// Wire name of this core type
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreType::Object => "Object",
            CoreType::Component => "Component",
            CoreType::Device => "Device",
            CoreType::User => "User",
            CoreType::Task => "Task",
            CoreType::Location => "Location",
            CoreType::Snapshot => "Snapshot",
            CoreType::Log => "Log",
            CoreType::Config => "Config",
            CoreType::Annotation => "Annotation",
        }
    }
}

/// Base entity exchanged on the wire
///
/// Required attributes are a globally unique identifier, the core-type
/// discriminator, an extensible object-type string, and a human-readable
/// name. An optional `parentObjectId` links to an owning object. Any other
/// fields present in the JSON form are kept in `extra` and re-emitted
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoatyObject {
    /// Globally unique identifier (UUID v4)
    pub object_id: Uuid,
    /// Core type discriminator
    pub core_type: CoreType,
    /// Extensible object type (reverse-DNS)
    pub object_type: String,
    /// Human-readable name
    pub name: String,
    /// Owning object, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_object_id: Option<Uuid>,
    /// External correlation identifier, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Unknown fields, preserved verbatim for the JSON round trip
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CoatyObject {
    /// Create a plain object with a fresh identifier
    pub fn new<T: Into<String>, N: Into<String>>(core_type: CoreType, object_type: T, name: N) -> Self {
        Self {
            object_id: Uuid::new_v4(),
            core_type,
            object_type: object_type.into(),
            name: name.into(),
            parent_object_id: None,
            external_id: None,
            extra: Map::new(),
        }
    }

    /// Create a Component identifying a controller or communication manager
    pub fn component<S: Into<String>>(name: S) -> Self {
        Self::new(
            CoreType::Component,
            format!("{OBJECT_TYPE_PREFIX}.Component"),
            name.into(),
        )
    }

    /// Create a User object
    pub fn user<S: Into<String>>(name: S) -> Self {
        Self::new(CoreType::User, format!("{OBJECT_TYPE_PREFIX}.User"), name.into())
    }

    /// Create a Device object
    pub fn device<S: Into<String>>(name: S) -> Self {
        Self::new(
            CoreType::Device,
            format!("{OBJECT_TYPE_PREFIX}.Device"),
            name.into(),
        )
    }

    /// Create a Log entry stamped with the current time (RFC 3339)
    pub fn log_entry<S: Into<String>>(message: S) -> Self {
        let mut object = Self::new(
            CoreType::Log,
            format!("{OBJECT_TYPE_PREFIX}.Log"),
            message.into(),
        );
        object.extra.insert(
            "logDate".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        object
    }

    /// Create a Snapshot of the given object, stamped with the current time
    pub fn snapshot_of(subject: &CoatyObject) -> Self {
        let mut object = Self::new(
            CoreType::Snapshot,
            format!("{OBJECT_TYPE_PREFIX}.Snapshot"),
            format!("Snapshot of {}", subject.name),
        );
        object.parent_object_id = Some(subject.object_id);
        object.extra.insert(
            "creationTimestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        if let Ok(value) = serde_json::to_value(subject) {
            object.extra.insert("object".to_string(), value);
        }
        object
    }

    /// Set the owning object
    pub fn with_parent(mut self, parent_object_id: Uuid) -> Self {
        self.parent_object_id = Some(parent_object_id);
        self
    }

    /// Set the external correlation identifier
    pub fn with_external_id<S: Into<String>>(mut self, external_id: S) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_component_factory() {
        let component = CoatyObject::component("TestController");
        assert_eq!(component.core_type, CoreType::Component);
        assert_eq!(component.object_type, "coaty.Component");
        assert_eq!(component.name, "TestController");
        assert!(component.parent_object_id.is_none());
    }

    #[test]
    fn test_core_type_wire_names() {
        assert_eq!(
            serde_json::to_value(CoreType::Component).unwrap(),
            json!("Component")
        );
        assert_eq!(serde_json::to_value(CoreType::Object).unwrap(), json!("Object"));
        assert_eq!(CoreType::Snapshot.as_str(), "Snapshot");
    }

    #[test]
    fn test_json_round_trip_preserves_unknown_fields() {
        let raw = json!({
            "objectId": "3d34eb53-2536-4134-b0cd-8c406b94bb80",
            "coreType": "Device",
            "objectType": "com.example.Lamp",
            "name": "Desk lamp",
            "displayType": "lamp",
            "floor": 7
        });

        let object: CoatyObject = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(object.extra.get("floor"), Some(&json!(7)));
        assert_eq!(object.extra.get("displayType"), Some(&json!("lamp")));

        let round_tripped = serde_json::to_value(&object).unwrap();
        assert_eq!(round_tripped, raw);
    }

    #[test]
    fn test_snapshot_links_parent() {
        let device = CoatyObject::device("Sensor");
        let snapshot = CoatyObject::snapshot_of(&device);
        assert_eq!(snapshot.core_type, CoreType::Snapshot);
        assert_eq!(snapshot.parent_object_id, Some(device.object_id));
        assert!(snapshot.extra.contains_key("creationTimestamp"));
        assert!(snapshot.extra.contains_key("object"));
    }

    #[test]
    fn test_rejects_unknown_core_type() {
        let raw = json!({
            "objectId": "3d34eb53-2536-4134-b0cd-8c406b94bb80",
            "coreType": "Widget",
            "objectType": "com.example.Widget",
            "name": "bogus"
        });
        assert!(serde_json::from_value::<CoatyObject>(raw).is_err());
    }
}
