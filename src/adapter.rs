//! Conversion between domain events and journal payloads.
//!
//! Domain events are expected to use adjacently tagged serde
//! (`#[serde(tag = "type", content = "data")]`). The default
//! [`JsonEventAdapter`] splits that encoding into an `event_type` tag and a
//! `data` payload on the way into the journal and reassembles it on the way
//! back, so stored records stay readable and type tags are queryable.

use std::any::type_name;
use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::AdapterError;

/// A domain event in its journal representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedEvent {
    /// Event type tag (e.g. `"Incremented"`).
    pub event_type: String,
    /// Event payload. `None` for fieldless variants; `Some(Value::Null)`
    /// for a payload that serializes to `null`, such as `()`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub data: Option<serde_json::Value>,
}

/// A `data` key that is present is `Some`, even when it holds `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Translates domain events to and from their journal representation.
///
/// Replace the default adapter to migrate old payload shapes during replay
/// without touching the stored records.
pub trait EventAdapter<E>: Send + Sync + 'static {
    /// Convert a domain event into its stored form.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Encode`] if the event cannot be represented.
    fn to_journal(&self, event: &E) -> Result<EncodedEvent, AdapterError>;

    /// Convert a stored record back into a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Decode`] if the payload does not describe a
    /// known event.
    fn from_journal(&self, encoded: &EncodedEvent) -> Result<E, AdapterError>;
}

/// Computes routing tags stored alongside each event.
pub type Tagger<E> = Arc<dyn Fn(&E) -> BTreeSet<String> + Send + Sync>;

/// Serde-based [`EventAdapter`] for adjacently tagged event enums.
///
/// Events that do not serialize to a `{"type": ..}` object (plain structs,
/// numbers) are stored whole, tagged with their Rust type name.
pub struct JsonEventAdapter<E>(PhantomData<fn() -> E>);

impl<E> JsonEventAdapter<E> {
    /// Create the adapter.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for JsonEventAdapter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for JsonEventAdapter<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for JsonEventAdapter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JsonEventAdapter").field(&type_name::<E>()).finish()
    }
}

impl<E> EventAdapter<E> for JsonEventAdapter<E>
where
    E: Serialize + DeserializeOwned + 'static,
{
    fn to_journal(&self, event: &E) -> Result<EncodedEvent, AdapterError> {
        let value =
            serde_json::to_value(event).map_err(|e| AdapterError::Encode(Arc::new(e)))?;

        // Adjacently tagged enums produce `{"type": "Variant"}` or
        // `{"type": "Variant", "data": ...}`.
        if let serde_json::Value::Object(map) = &value
            && let Some(serde_json::Value::String(event_type)) = map.get("type")
            && map.keys().all(|k| k == "type" || k == "data")
        {
            return Ok(EncodedEvent {
                event_type: event_type.clone(),
                data: map.get("data").cloned(),
            });
        }

        Ok(EncodedEvent {
            event_type: type_name::<E>().to_owned(),
            data: Some(value),
        })
    }

    fn from_journal(&self, encoded: &EncodedEvent) -> Result<E, AdapterError> {
        let value = match &encoded.data {
            Some(data) if encoded.event_type == type_name::<E>() => data.clone(),
            Some(data) => serde_json::json!({ "type": encoded.event_type, "data": data }),
            None => serde_json::json!({ "type": encoded.event_type }),
        };

        serde_json::from_value(value).map_err(|e| AdapterError::Decode {
            event_type: encoded.event_type.clone(),
            source: Arc::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum AccountEvent {
        Opened,
        Deposited { amount: u64 },
        Renamed(String),
        Closed(()),
        Imported(serde_json::Value),
        Labelled(Option<String>),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Plain {
        n: u32,
    }

    #[test]
    fn splits_tag_and_payload() {
        let adapter = JsonEventAdapter::<AccountEvent>::new();
        let encoded = adapter
            .to_journal(&AccountEvent::Deposited { amount: 5 })
            .expect("encode should succeed");
        assert_eq!(encoded.event_type, "Deposited");
        assert_eq!(encoded.data.expect("payload")["amount"], 5);
    }

    #[test]
    fn fieldless_variant_has_null_payload() {
        let adapter = JsonEventAdapter::<AccountEvent>::new();
        let encoded = adapter.to_journal(&AccountEvent::Opened).expect("encode");
        assert_eq!(encoded.event_type, "Opened");
        assert!(encoded.data.is_none());
        assert_eq!(adapter.from_journal(&encoded).expect("decode"), AccountEvent::Opened);
    }

    #[test]
    fn null_payload_is_kept_apart_from_missing_payload() {
        let adapter = JsonEventAdapter::<AccountEvent>::new();
        for event in [
            AccountEvent::Closed(()),
            AccountEvent::Imported(serde_json::Value::Null),
            AccountEvent::Labelled(None),
        ] {
            let encoded = adapter.to_journal(&event).expect("encode");
            assert_eq!(encoded.data, Some(serde_json::Value::Null));

            // Through the stored JSON form as well.
            let json = serde_json::to_string(&encoded).expect("serialize");
            let stored: EncodedEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(stored, encoded);
            assert_eq!(adapter.from_journal(&stored).expect("decode"), event);
        }
    }

    #[test]
    fn missing_data_key_reads_as_fieldless() {
        let stored: EncodedEvent =
            serde_json::from_str(r#"{"event_type":"Opened"}"#).expect("deserialize");
        assert_eq!(stored.data, None);
        let adapter = JsonEventAdapter::<AccountEvent>::new();
        assert_eq!(adapter.from_journal(&stored).expect("decode"), AccountEvent::Opened);
    }

    #[test]
    fn untagged_events_use_type_name() {
        let adapter = JsonEventAdapter::<Plain>::new();
        let encoded = adapter.to_journal(&Plain { n: 3 }).expect("encode");
        assert!(encoded.event_type.ends_with("Plain"), "got {}", encoded.event_type);
        assert_eq!(adapter.from_journal(&encoded).expect("decode"), Plain { n: 3 });
    }

    #[test]
    fn unknown_type_is_decode_error() {
        let adapter = JsonEventAdapter::<AccountEvent>::new();
        let err = adapter
            .from_journal(&EncodedEvent {
                event_type: "Reopened".into(),
                data: None,
            })
            .expect_err("unknown variant must not decode");
        match err {
            AdapterError::Decode { event_type, .. } => assert_eq!(event_type, "Reopened"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn account_event() -> impl Strategy<Value = AccountEvent> {
        prop_oneof![
            Just(AccountEvent::Opened),
            any::<u64>().prop_map(|amount| AccountEvent::Deposited { amount }),
            ".*".prop_map(AccountEvent::Renamed),
            Just(AccountEvent::Closed(())),
            Just(AccountEvent::Imported(serde_json::Value::Null)),
            any::<i64>().prop_map(|n| AccountEvent::Imported(serde_json::json!(n))),
            proptest::option::of(".*").prop_map(AccountEvent::Labelled),
        ]
    }

    proptest! {
        #[test]
        fn journal_form_decodes_to_original(event in account_event()) {
            let adapter = JsonEventAdapter::<AccountEvent>::new();
            let encoded = adapter.to_journal(&event).expect("encode");
            prop_assert_eq!(adapter.from_journal(&encoded).expect("decode"), event);
        }
    }
}
