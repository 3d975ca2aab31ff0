//! ETW Event Schema
//!
//! This module contains the means needed to interact with the Schema of an ETW event
use crate::native::etw_types::DecodingSource;
use crate::native::guid::Guid;
use crate::native::tdh_types::Property;

/// The description of one kind of event: its names and the ordered list of its properties
///
/// Schemas are obtained from a [`SchemaLocator`](crate::schema_locator::SchemaLocator), which asks
/// the native layer for them (TDH on Windows, the registered schemas for the replay backend) and caches them.
///
/// # Example
/// ```
/// # use etwsession::native::etw_types::EventRecord;
/// # use etwsession::schema_locator::SchemaLocator;
/// let my_callback = |record: &EventRecord, schema_locator: &SchemaLocator| {
///     let schema = schema_locator.event_schema(record).unwrap();
///     println!("{} from {}", schema.event_name(), schema.provider_name());
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    provider_guid: Guid,
    event_id: u16,
    event_version: u8,
    opcode: u8,
    level: u8,
    decoding_source: DecodingSource,
    provider_name: String,
    task_name: String,
    opcode_name: String,
    event_name: String,
    properties: Vec<Property>,
}

impl Schema {
    /// An empty schema for the event `event_id` of `provider_guid`
    pub fn new(provider_guid: Guid, event_id: u16) -> Self {
        Schema {
            provider_guid,
            event_id,
            event_version: 0,
            opcode: 0,
            level: 0,
            decoding_source: DecodingSource::default(),
            provider_name: String::new(),
            task_name: String::new(),
            opcode_name: String::new(),
            event_name: String::new(),
            properties: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.event_version = version;
        self
    }

    pub fn with_opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode;
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_decoding_source(mut self, decoding_source: DecodingSource) -> Self {
        self.decoding_source = decoding_source;
        self
    }

    pub fn with_provider_name(mut self, name: &str) -> Self {
        self.provider_name = name.to_string();
        self
    }

    pub fn with_task_name(mut self, name: &str) -> Self {
        self.task_name = name.to_string();
        self
    }

    pub fn with_opcode_name(mut self, name: &str) -> Self {
        self.opcode_name = name.to_string();
        self
    }

    pub fn with_event_name(mut self, name: &str) -> Self {
        self.event_name = name.to_string();
        self
    }

    /// Append a property (properties are laid out in the payload in insertion order)
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn provider_guid(&self) -> Guid {
        self.provider_guid
    }

    pub fn event_id(&self) -> u16 {
        self.event_id
    }

    pub fn event_version(&self) -> u8 {
        self.event_version
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Use the `decoding_source` function to obtain the [DecodingSource]
    ///
    /// This value identifies the source used parse the event data
    pub fn decoding_source(&self) -> DecodingSource {
        self.decoding_source
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// See: [TaskType](https://docs.microsoft.com/en-us/windows/win32/wes/eventmanifestschema-tasktype-complextype)
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// See: [OpcodeType](https://docs.microsoft.com/en-us/windows/win32/wes/eventmanifestschema-opcodetype-complextype)
    pub fn opcode_name(&self) -> &str {
        &self.opcode_name
    }

    /// The symbolic name of the event
    ///
    /// Falls back to the task name for manifests that do not name their events.
    pub fn event_name(&self) -> &str {
        if self.event_name.is_empty() {
            &self.task_name
        } else {
            &self.event_name
        }
    }

    /// The event name, without the task name fallback
    pub(crate) fn declared_event_name(&self) -> &str {
        &self.event_name
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::tdh_types::TdhInType;

    #[test]
    fn test_getters() {
        let schema = Schema::new(Guid::from_u128(1), 10)
            .with_version(2)
            .with_opcode(1)
            .with_provider_name("Microsoft-Windows-Kernel-Process")
            .with_task_name("ProcessStart")
            .with_opcode_name("Start")
            .with_property(Property::scalar("ProcessID", TdhInType::InTypeUInt32))
            .with_property(Property::scalar("ImageName", TdhInType::InTypeUnicodeString));

        assert_eq!(schema.provider_guid(), Guid::from_u128(1));
        assert_eq!(schema.event_id(), 10);
        assert_eq!(schema.event_version(), 2);
        assert_eq!(schema.opcode_name(), "Start");
        assert_eq!(schema.event_name(), "ProcessStart");
        assert_eq!(schema.properties().len(), 2);
        assert_eq!(schema.properties()[1].name, "ImageName");
    }

    #[test]
    fn test_event_name() {
        let schema = Schema::new(Guid::zeroed(), 1)
            .with_task_name("Task")
            .with_event_name("Event");
        assert_eq!(schema.event_name(), "Event");
    }
}
