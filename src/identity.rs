//! Stable identity naming one entity's event stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Separator placed between entity type and entity id by
/// [`PersistenceId::of`].
pub const DEFAULT_SEPARATOR: char = '|';

/// Unique, non-empty key of one entity's journal stream and snapshots.
///
/// Two entities with equal `PersistenceId`s share the same event stream,
/// so at most one live instance per id may exist at a time.
///
/// # Examples
///
/// ```
/// use entityfold::PersistenceId;
///
/// let id = PersistenceId::new("counter-1").unwrap();
/// assert_eq!(id.as_str(), "counter-1");
///
/// let typed = PersistenceId::of("counter", "1").unwrap();
/// assert_eq!(typed.as_str(), "counter|1");
///
/// assert!(PersistenceId::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersistenceId(String);

impl PersistenceId {
    /// Build an identity from a raw string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Empty`] if `id` is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(id))
    }

    /// Build an identity from an optional string, as received from an
    /// untyped boundary (deserialized request, environment, ...).
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Missing`] for `None` and
    /// [`IdentityError::Empty`] for an empty string.
    pub fn from_option(id: Option<impl Into<String>>) -> Result<Self, IdentityError> {
        match id {
            Some(id) => Self::new(id),
            None => Err(IdentityError::Missing),
        }
    }

    /// Compose an identity from an entity type and an entity id as
    /// `"<entity_type>|<entity_id>"`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Empty`] if either part is empty and
    /// [`IdentityError::SeparatorInType`] if `entity_type` contains the
    /// separator, which would make the composed id ambiguous.
    pub fn of(entity_type: &str, entity_id: &str) -> Result<Self, IdentityError> {
        if entity_type.is_empty() || entity_id.is_empty() {
            return Err(IdentityError::Empty);
        }
        if entity_type.contains(DEFAULT_SEPARATOR) {
            return Err(IdentityError::SeparatorInType {
                entity_type: entity_type.to_owned(),
            });
        }
        Ok(Self(format!("{entity_type}{DEFAULT_SEPARATOR}{entity_id}")))
    }

    /// The raw identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Entity type part of an id built with [`PersistenceId::of`], if any.
    pub fn entity_type(&self) -> Option<&str> {
        self.0.split_once(DEFAULT_SEPARATOR).map(|(t, _)| t)
    }
}

impl fmt::Display for PersistenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PersistenceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PersistenceId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for PersistenceId {
    type Error = IdentityError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PersistenceId> for String {
    fn from(id: PersistenceId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_is_rejected() {
        assert!(matches!(PersistenceId::new(""), Err(IdentityError::Empty)));
    }

    #[test]
    fn missing_id_is_rejected() {
        let result = PersistenceId::from_option(None::<String>);
        assert!(matches!(result, Err(IdentityError::Missing)));
    }

    #[test]
    fn present_id_from_option() {
        let id = PersistenceId::from_option(Some("c1")).expect("valid id");
        assert_eq!(id.as_str(), "c1");
    }

    #[test]
    fn of_composes_type_and_id() {
        let id = PersistenceId::of("account", "42").expect("valid parts");
        assert_eq!(id.to_string(), "account|42");
        assert_eq!(id.entity_type(), Some("account"));
    }

    #[test]
    fn of_rejects_separator_in_type() {
        let result = PersistenceId::of("acc|ount", "42");
        assert!(matches!(
            result,
            Err(IdentityError::SeparatorInType { .. })
        ));
    }

    #[test]
    fn of_rejects_empty_parts() {
        assert!(PersistenceId::of("", "42").is_err());
        assert!(PersistenceId::of("account", "").is_err());
    }

    #[test]
    fn serde_rejects_empty_string() {
        let result: Result<PersistenceId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err(), "empty id must not deserialize");

        let id: PersistenceId = serde_json::from_str("\"c-9\"").expect("valid id");
        assert_eq!(id.as_str(), "c-9");
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "\"c-9\"");
    }
}
