//! Request payloads sent to the session store
//!
//! Update payloads only carry fields that changed locally. Property updates
//! use `Option<Property>` per key: `None` removes the key, while
//! `Some(Property { value: None, .. })` stores a semantic null.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use lobbysync_domain::{DomainError, PlayerId, Property, PropertyMap};

/// Per-key property changes; `None` removes the key.
pub type PropertyUpdate = BTreeMap<String, Option<Property>>;

/// Apply a property update to a map, returning whether anything changed.
pub fn apply_property_update(target: &mut PropertyMap, update: &PropertyUpdate) -> bool {
    let mut changed = false;
    for (key, change) in update {
        match change {
            Some(property) => {
                if target.get(key) != Some(property) {
                    target.insert(key.clone(), property.clone());
                    changed = true;
                }
            }
            None => {
                changed |= target.remove(key).is_some();
            }
        }
    }
    changed
}

// =============================================================================
// Session requests
// =============================================================================

/// Create a new session with the caller as its first member and host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub max_players: u32,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default)]
    pub member_properties: PropertyMap,
    /// The creator hosts the record without joining it as a member
    #[serde(default)]
    pub server_hosted: bool,
}

impl CreateSessionRequest {
    pub fn new(name: impl Into<String>, max_players: u32) -> Self {
        Self {
            name: name.into(),
            max_players,
            is_private: false,
            is_locked: false,
            password: None,
            properties: PropertyMap::new(),
            member_properties: PropertyMap::new(),
            server_hosted: false,
        }
    }

    /// The creator hosts the record without being a member, so no member
    /// data is sent.
    pub fn hosted_by_server(mut self) -> Self {
        self.server_hosted = true;
        self.member_properties = PropertyMap::new();
        self
    }

    pub fn with_private(mut self, is_private: bool) -> Self {
        self.is_private = is_private;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, property: Property) -> Self {
        self.properties.insert(key.into(), property);
        self
    }

    pub fn with_member_properties(mut self, properties: PropertyMap) -> Self {
        self.member_properties = properties;
        self
    }

    /// Reject requests the store would refuse anyway.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("Session name cannot be empty"));
        }
        if self.max_players == 0 {
            return Err(DomainError::validation("Max players must be at least 1"));
        }
        Ok(())
    }
}

/// Join an existing session by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSessionRequest {
    #[serde(default)]
    pub member_properties: PropertyMap,
    #[serde(default)]
    pub password: Option<String>,
}

impl JoinSessionRequest {
    pub fn new(member_properties: PropertyMap) -> Self {
        Self {
            member_properties,
            password: None,
        }
    }
}

/// Partial update of session-level fields; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: PropertyUpdate,
}

impl UpdateSessionRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.max_players.is_none()
            && self.is_private.is_none()
            && self.is_locked.is_none()
            && self.host_id.is_none()
            && self.password.is_none()
            && self.properties.is_empty()
    }

    /// Whether the update touches fields only the host may change.
    pub fn touches_host_fields(&self) -> bool {
        self.host_id.is_some() || self.is_locked.is_some()
    }
}

/// Update the properties of one member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMemberRequest {
    #[serde(default)]
    pub properties: PropertyUpdate,
}

impl UpdateMemberRequest {
    pub fn new(properties: PropertyUpdate) -> Self {
        Self { properties }
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
