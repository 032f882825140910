//! Key/value properties attached to sessions and members
//!
//! A property is a nullable string value plus a visibility scope. A key that
//! maps to a property whose value is `None` is a semantic null and is distinct
//! from the key being absent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Who may read a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to anyone, including non-members browsing sessions
    #[default]
    Public,
    /// Visible only to members of the session
    Member,
    /// Visible only to the owner (member properties) or the host (session properties)
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Member => write!(f, "member"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

impl FromStr for Visibility {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Visibility::Public),
            "member" | "members" => Ok(Visibility::Member),
            "private" => Ok(Visibility::Private),
            other => Err(DomainError::validation(format!(
                "Unknown property visibility: {}",
                other
            ))),
        }
    }
}

/// A single property value with its visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub value: Option<String>,
    pub visibility: Visibility,
}

impl Property {
    pub fn new(value: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            value: Some(value.into()),
            visibility,
        }
    }

    /// Public property with the given value.
    pub fn public(value: impl Into<String>) -> Self {
        Self::new(value, Visibility::Public)
    }

    /// Property present with a null value.
    pub fn null(visibility: Visibility) -> Self {
        Self {
            value: None,
            visibility,
        }
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// The value, treating an empty string the same as a null value.
    pub fn non_empty_value(&self) -> Option<&str> {
        self.value().filter(|v| !v.is_empty())
    }

    /// Properties are compared by value only; visibility changes alone are not a change.
    pub fn same_value(&self, other: &Property) -> bool {
        self.value == other.value
    }
}

/// Ordered property map keyed by property name.
pub type PropertyMap = BTreeMap<String, Property>;
