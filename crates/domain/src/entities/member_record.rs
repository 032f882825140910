//! A member of a session record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::PlayerId;
use crate::value_objects::{Property, PropertyMap};

/// One member of a session as reported by the session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: PlayerId,
    #[serde(default)]
    pub properties: PropertyMap,
    pub joined: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl MemberRecord {
    pub fn new(id: PlayerId, properties: PropertyMap, now: DateTime<Utc>) -> Self {
        Self {
            id,
            properties,
            joined: now,
            last_updated: now,
        }
    }

    pub fn property(&self, key: &str) -> Option<&Property> {
        self.properties.get(key)
    }

    /// Shorthand for the non-null value of a property.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.property(key).and_then(Property::value)
    }
}
