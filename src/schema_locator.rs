//! A way to cache and retrieve Schemas

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::native::etw_types::EventRecord;
use crate::native::guid::Guid;
use crate::native::{EtwBackend, NativeError};
use crate::schema::Schema;

/// Schema module errors
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The native layer could not provide a schema
    #[error("schema lookup failed: {0}")]
    Native(#[from] NativeError),
}

type SchemaResult<T> = Result<T, SchemaError>;

/// A way to group events that share the same [`Schema`]
///
/// From the [docs](https://docs.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_descriptor):
/// > For manifest-based ETW, the combination Provider.DecodeGuid + Event.Id + Event.Version should uniquely identify an event,
/// > i.e. all events with the same DecodeGuid, Id, and Version should have the same set of fields with no changes in field names, field types, or field ordering.
#[derive(Debug, Eq, PartialEq, Hash)]
struct SchemaKey {
    provider: Guid,
    id: u16,
    /// The version indicates a revision to the definition of an event with a particular Id.
    version: u8,
    // Opcode and level are part of the key for classic (MOF) providers, which reuse ids across opcodes
    opcode: u8,
    level: u8,
}

impl SchemaKey {
    pub fn new(event: &EventRecord) -> Self {
        SchemaKey {
            provider: event.provider_id(),
            id: event.event_id(),
            opcode: event.opcode(),
            version: event.version(),
            level: event.level(),
        }
    }
}

/// Represents a cache of Schemas already located
///
/// This cache is implemented as a [HashMap] where the key is a combination of the following elements
/// of an event header
/// * ProviderId
/// * Id
/// * Opcode
/// * Version
/// * Level
///
/// Credits: [KrabsETW::schema_locator](https://github.com/microsoft/krabsetw/blob/master/krabs/krabs/schema_locator.hpp).
///
/// Each session owns its own locator, which handlers receive alongside each record.
pub struct SchemaLocator {
    backend: Arc<dyn EtwBackend>,
    schemas: Mutex<HashMap<SchemaKey, Arc<Schema>>>,
}

impl std::fmt::Debug for SchemaLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaLocator")
            .field("len", &self.schemas.try_lock().map(|guard| guard.len()))
            .finish()
    }
}

impl SchemaLocator {
    pub fn new(backend: Arc<dyn EtwBackend>) -> Self {
        SchemaLocator {
            backend,
            schemas: Mutex::new(HashMap::new()),
        }
    }

    /// Retrieve the Schema of an ETW Event
    ///
    /// # Arguments
    /// * `event` - The [EventRecord] that's passed to the callback
    ///
    /// # Example
    /// ```
    /// # use etwsession::native::etw_types::EventRecord;
    /// # use etwsession::schema_locator::SchemaLocator;
    /// let my_callback = |record: &EventRecord, schema_locator: &SchemaLocator| {
    ///     let schema = schema_locator.event_schema(record).unwrap();
    /// };
    /// ```
    pub fn event_schema(&self, event: &EventRecord) -> SchemaResult<Arc<Schema>> {
        let key = SchemaKey::new(event);

        if let Some(s) = self
            .schemas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(s));
        }

        // The lookup may be slow (TDH): do not hold the lock meanwhile
        let new_schema = Arc::new(self.backend.event_schema(event)?);
        let mut schemas = self.schemas.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(schemas.entry(key).or_insert(new_schema)))
    }

    pub fn len(&self) -> usize {
        self.schemas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::EventHeader;
    use crate::native::replay::ReplayEtw;
    use crate::native::tdh_types::{Property, TdhInType};

    #[test]
    fn test_schema_is_cached() {
        let provider = Guid::from_u128(0xabcd);
        let backend = Arc::new(ReplayEtw::new());
        backend.register_schema(
            Schema::new(provider, 1)
                .with_event_name("First")
                .with_property(Property::scalar("Value", TdhInType::InTypeUInt32)),
        );
        let locator = SchemaLocator::new(backend);

        let header = EventHeader::new(provider, 1);
        let record = EventRecord::new(header, &[], &[]);
        let first = locator.event_schema(&record).unwrap();
        let second = locator.event_schema(&record).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.event_name(), "First");
        assert_eq!(locator.len(), 1);
    }

    #[test]
    fn test_unknown_schema() {
        let locator = SchemaLocator::new(Arc::new(ReplayEtw::new()));
        let record = EventRecord::new(EventHeader::new(Guid::from_u128(1), 2), &[], &[]);
        assert!(matches!(
            locator.event_schema(&record),
            Err(SchemaError::Native(NativeError::SchemaNotFound { event_id: 2, .. }))
        ));
        assert!(locator.is_empty());
    }
}
