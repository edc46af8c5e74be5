use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::message::MessageId;
use crate::domain::principal::PrincipalId;
use crate::domain::property::PropertyStatus;

pub const PERSON_LABEL: &str = "Person";
pub const PROPERTY_LABEL: &str = "Property";
pub const LISTED_RELATION: &str = "LISTED";

/// Match-or-create node. Properties are merged into whatever the node already
/// carries; existing keys are overwritten.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub label: String,
    pub key: String,
    pub properties: BTreeMap<String, String>,
}

impl GraphNode {
    pub fn person(principal_id: &PrincipalId, name: Option<&str>) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("phone".to_string(), principal_id.0.clone());
        if let Some(name) = name {
            properties.insert("name".to_string(), name.to_string());
        }
        Self { label: PERSON_LABEL.to_string(), key: principal_id.0.clone(), properties }
    }

    pub fn property(address_key: &str, address: &str) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("address".to_string(), address.to_string());
        Self { label: PROPERTY_LABEL.to_string(), key: address_key.to_string(), properties }
    }
}

/// Graph relationship between a principal and the address they listed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEdge {
    pub edge_key: String,
    pub principal_id: PrincipalId,
    pub address_key: String,
    pub message_id: MessageId,
    pub evidence_ref: Option<String>,
    pub role: Option<String>,
    pub status: PropertyStatus,
    pub created_at: DateTime<Utc>,
}

impl LinkEdge {
    pub fn edge_key(principal_id: &PrincipalId, address_key: &str, message_id: &MessageId) -> String {
        format!("{}|{}|{}", principal_id.0, address_key, message_id.0)
    }
}
