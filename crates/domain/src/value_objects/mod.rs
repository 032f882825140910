//! Value objects - immutable types without identity

mod property;

pub use property::{Property, PropertyMap, Visibility};
