//! Integrates with [serde](https://serde.rs/) enabling [`EventRecord`](crate::EventRecord) to be serialized to various formats.
//!
//! Requires the `serde` feature be enabled.
//!
//! If the `time_rs` feature is enabled, then time stamps are serialized per the serialization format
//! of the time crate. Otherwise, if `time_rs` is not enabled, then timestamps are serialized as 64bit
//! unix timestamps.
//!
//! ```
//! use etwsession::schema_locator::SchemaLocator;
//! use etwsession::{EventRecord, EventSerializer};
//! extern crate serde_json;
//!
//! fn event_callback(record: &EventRecord, schema_locator: &SchemaLocator) {
//!     match schema_locator.event_schema(record) {
//!         Err(err) => println!("Error {:?}", err),
//!         Ok(schema) => {
//!             // Generate a serializer for the record using the schema
//!             let ser = EventSerializer::new(record, &schema, Default::default());
//!             // Pass the serializer to any serde compatible serializer
//!             match serde_json::to_value(ser) {
//!                 Err(err) => println!("Error {:?}", err),
//!                 Ok(json) => println!("{}", json),
//!             }
//!         }
//!     }
//! }
//! ```
#![cfg(feature = "serde")]

use crate::native::etw_types::{EventHeader, EventRecord};
use crate::native::tdh_types::{Property, PropertyInfo, TdhInType, TdhOutType};
use crate::native::time::{FileTime, SystemTime};
use crate::parser::{Parser, Pointer};
use crate::schema::Schema;
use serde::ser::{SerializeMap, SerializeStruct};
use std::net::IpAddr;

/// Serialization options for EventSerializer
#[derive(Debug, Clone, Copy)]
pub struct EventSerializerOptions {
    /// Includes information from the schema in the serialized output such as the provider, opcode, and task names.
    pub include_schema: bool,
    /// Includes the event header in the serialized output.
    pub include_header: bool,
    /// Includes the set of [EVENT_HEADER_EXTENDED_DATA_ITEM](https://learn.microsoft.com/en-us/windows/win32/api/evntcons/ns-evntcons-event_header_extended_data_item) in the serialized output.
    pub include_extended_data: bool,
    /// When `true` unimplemented serialization fails with an error, otherwise unimplemented serialization is skipped and will not be present in the serialized output.
    pub fail_unimplemented: bool,
}

impl core::default::Default for EventSerializerOptions {
    fn default() -> Self {
        Self {
            include_schema: true,
            include_header: true,
            include_extended_data: false,
            fail_unimplemented: false,
        }
    }
}

/// Used to serialize [`EventRecord`](crate::EventRecord) using [serde](https://serde.rs/)
pub struct EventSerializer<'a, 'r> {
    record: &'a EventRecord<'r>,
    schema: &'a Schema,
    parser: Parser<'a, 'r>,
    options: EventSerializerOptions,
}

impl<'a, 'r> EventSerializer<'a, 'r> {
    /// Creates an event serializer object.
    pub fn new(
        record: &'a EventRecord<'r>,
        schema: &'a Schema,
        options: EventSerializerOptions,
    ) -> Self {
        Self {
            record,
            schema,
            parser: Parser::create(record, schema),
            options,
        }
    }
}

impl serde::ser::Serialize for EventSerializer<'_, '_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        let mut state = serializer.serialize_struct("Record", 4)?;

        if self.options.include_schema {
            state.serialize_field("Schema", &SchemaSer(self.schema))?;
        } else {
            state.skip_field("Schema")?;
        }

        if self.options.include_header {
            state.serialize_field("Header", &HeaderSer(self.record.header()))?;
        } else {
            state.skip_field("Header")?;
        }

        if self.options.include_extended_data {
            state.serialize_field("Extended", self.record.extended_data())?;
        } else {
            state.skip_field("Extended")?;
        }

        let event = EventSer {
            schema: self.schema,
            parser: &self.parser,
            options: &self.options,
        };
        state.serialize_field("Event", &event)?;

        state.end()
    }
}

struct SchemaSer<'a>(&'a Schema);

impl serde::ser::Serialize for SchemaSer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("Schema", 5)?;
        state.serialize_field("Provider", &self.0.provider_name().trim())?;
        state.serialize_field("Event", &self.0.event_name())?;
        state.serialize_field("Opcode", &self.0.opcode_name().trim())?;
        state.serialize_field("Task", &self.0.task_name().trim())?;
        state.serialize_field("DecodingSource", &self.0.decoding_source())?;
        state.end()
    }
}

struct HeaderSer<'a>(&'a EventHeader);

impl serde::ser::Serialize for HeaderSer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        let header = self.0;
        let mut state = serializer.serialize_struct("Header", 8)?;
        state.serialize_field("Flags", &header.flags)?;
        state.serialize_field("EventProperty", &header.event_property)?;
        state.serialize_field("ThreadId", &header.thread_id)?;
        state.serialize_field("ProcessId", &header.process_id)?;
        state.serialize_field("TimeStamp", &FileTime::from_quad(header.timestamp))?;
        state.serialize_field("ProviderId", &header.provider_id)?;
        state.serialize_field("ActivityId", &header.activity_id)?;
        state.serialize_field("Descriptor", &DescriptorSer(header))?;
        state.end()
    }
}

struct DescriptorSer<'a>(&'a EventHeader);

impl serde::ser::Serialize for DescriptorSer<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        let header = self.0;
        let mut state = serializer.serialize_struct("Descriptor", 7)?;
        state.serialize_field("Id", &header.event_id)?;
        state.serialize_field("Version", &header.version)?;
        state.serialize_field("Channel", &header.channel)?;
        state.serialize_field("Level", &header.level)?;
        state.serialize_field("Opcode", &header.opcode)?;
        state.serialize_field("Task", &header.task)?;
        state.serialize_field("Keyword", &header.keyword)?;
        state.end()
    }
}

struct EventSer<'s, 'a, 'r> {
    schema: &'s Schema,
    parser: &'s Parser<'a, 'r>,
    options: &'s EventSerializerOptions,
}

impl serde::ser::Serialize for EventSer<'_, '_, '_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut len: usize = 0;
        for prop in self.schema.properties() {
            if PropHandler::for_property(prop).is_some() {
                len += 1;
            } else if self.options.fail_unimplemented {
                return Err(serde::ser::Error::custom(format!(
                    "not implemented for property {:?} ({:?} / {:?})",
                    prop.name,
                    prop.in_type(),
                    prop.out_type(),
                )));
            }
        }

        let mut state = serializer.serialize_map(Some(len))?;
        for prop in self.schema.properties() {
            if let Some(handler) = PropHandler::for_property(prop) {
                handler.ser::<S>(&mut state, prop, self.parser)?;
            }
        }
        state.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropHandler {
    Null,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Pointer,
    Float,
    Double,
    String,
    FileTime,
    SystemTime,
    Guid,
    Binary,
    IpAddr,
    ArrayInt16,
    ArrayUInt16,
    ArrayInt32,
    ArrayUInt32,
    ArrayInt64,
    ArrayUInt64,
}

macro_rules! prop_ser_type {
    ($typ:ty, $map:expr, $prop:expr, $parser:expr) => {{
        let v = $parser
            .try_parse::<$typ>(&$prop.name)
            .map_err(serde::ser::Error::custom)?;
        $map.serialize_entry(&$prop.name, &v)
    }};
}

impl PropHandler {
    /// The wire form is given by the in-type, the out-type only refines it
    fn for_property(prop: &Property) -> Option<Self> {
        match prop.info {
            PropertyInfo::Value {
                in_type, out_type, ..
            } => match (in_type, out_type) {
                (_, TdhOutType::OutTypeIpv4 | TdhOutType::OutTypeIpv6) => Some(Self::IpAddr),
                (TdhInType::InTypeNull, _) => Some(Self::Null),
                (TdhInType::InTypeBoolean, _) => Some(Self::Bool),
                (TdhInType::InTypeInt8, _) => Some(Self::Int8),
                (TdhInType::InTypeUInt8, _) => Some(Self::UInt8),
                (TdhInType::InTypeInt16, _) => Some(Self::Int16),
                (TdhInType::InTypeUInt16, _) => Some(Self::UInt16),
                (TdhInType::InTypeInt32, _) => Some(Self::Int32),
                (TdhInType::InTypeUInt32 | TdhInType::InTypeHexInt32, _) => Some(Self::UInt32),
                (TdhInType::InTypeInt64, _) => Some(Self::Int64),
                (TdhInType::InTypeUInt64 | TdhInType::InTypeHexInt64, _) => Some(Self::UInt64),
                (TdhInType::InTypePointer, _) => Some(Self::Pointer),
                (TdhInType::InTypeFloat, _) => Some(Self::Float),
                (TdhInType::InTypeDouble, _) => Some(Self::Double),
                (
                    TdhInType::InTypeUnicodeString
                    | TdhInType::InTypeAnsiString
                    | TdhInType::InTypeCountedString
                    | TdhInType::InTypeSid,
                    _,
                ) => Some(Self::String),
                (TdhInType::InTypeGuid, _) => Some(Self::Guid),
                (TdhInType::InTypeFileTime, _) => Some(Self::FileTime),
                (TdhInType::InTypeSystemTime, _) => Some(Self::SystemTime),
                (TdhInType::InTypeBinary, _) => Some(Self::Binary),
            },
            PropertyInfo::Array { in_type, .. } => match in_type {
                TdhInType::InTypeInt8 | TdhInType::InTypeUInt8 | TdhInType::InTypeBinary => {
                    Some(Self::Binary)
                }
                TdhInType::InTypeInt16 => Some(Self::ArrayInt16),
                TdhInType::InTypeUInt16 => Some(Self::ArrayUInt16),
                TdhInType::InTypeInt32 => Some(Self::ArrayInt32),
                TdhInType::InTypeUInt32 | TdhInType::InTypeHexInt32 => Some(Self::ArrayUInt32),
                TdhInType::InTypeInt64 => Some(Self::ArrayInt64),
                TdhInType::InTypeUInt64 | TdhInType::InTypeHexInt64 => Some(Self::ArrayUInt64),
                _ => None,
            },
        }
    }

    fn ser<S>(
        &self,
        map: &mut S::SerializeMap,
        prop: &Property,
        parser: &Parser,
    ) -> Result<(), S::Error>
    where
        S: serde::ser::Serializer,
    {
        match self {
            PropHandler::Bool => prop_ser_type!(bool, map, prop, parser),
            PropHandler::Int8 => prop_ser_type!(i8, map, prop, parser),
            PropHandler::UInt8 => prop_ser_type!(u8, map, prop, parser),
            PropHandler::Int16 => prop_ser_type!(i16, map, prop, parser),
            PropHandler::UInt16 => prop_ser_type!(u16, map, prop, parser),
            PropHandler::Int32 => prop_ser_type!(i32, map, prop, parser),
            PropHandler::UInt32 => prop_ser_type!(u32, map, prop, parser),
            PropHandler::Int64 => prop_ser_type!(i64, map, prop, parser),
            PropHandler::UInt64 => prop_ser_type!(u64, map, prop, parser),
            PropHandler::Pointer => prop_ser_type!(Pointer, map, prop, parser),
            PropHandler::Float => prop_ser_type!(f32, map, prop, parser),
            PropHandler::Double => prop_ser_type!(f64, map, prop, parser),
            PropHandler::String => prop_ser_type!(String, map, prop, parser),
            PropHandler::Binary => prop_ser_type!(Vec<u8>, map, prop, parser),
            PropHandler::IpAddr => prop_ser_type!(IpAddr, map, prop, parser),
            PropHandler::FileTime => prop_ser_type!(FileTime, map, prop, parser),
            PropHandler::SystemTime => prop_ser_type!(SystemTime, map, prop, parser),
            PropHandler::Guid => prop_ser_type!(crate::Guid, map, prop, parser),
            PropHandler::ArrayInt16 => prop_ser_type!(Vec<i16>, map, prop, parser),
            PropHandler::ArrayUInt16 => prop_ser_type!(Vec<u16>, map, prop, parser),
            PropHandler::ArrayInt32 => prop_ser_type!(Vec<i32>, map, prop, parser),
            PropHandler::ArrayUInt32 => prop_ser_type!(Vec<u32>, map, prop, parser),
            PropHandler::ArrayInt64 => prop_ser_type!(Vec<i64>, map, prop, parser),
            PropHandler::ArrayUInt64 => prop_ser_type!(Vec<u64>, map, prop, parser),
            PropHandler::Null => {
                let value: Option<usize> = None;
                map.serialize_entry(&prop.name, &value)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::tdh_types::PropertyCount;

    #[test]
    fn handlers() {
        let port = Property::new("Port", TdhInType::InTypeUInt16, TdhOutType::OutTypePort);
        assert_eq!(PropHandler::for_property(&port), Some(PropHandler::UInt16));

        let addr = Property::new("Addr", TdhInType::InTypeUInt32, TdhOutType::OutTypeIpv4);
        assert_eq!(PropHandler::for_property(&addr), Some(PropHandler::IpAddr));

        let sid = Property::scalar("UserSid", TdhInType::InTypeSid);
        assert_eq!(PropHandler::for_property(&sid), Some(PropHandler::String));

        let ids = Property::array("Ids", TdhInType::InTypeUInt32, PropertyCount::Count(3));
        assert_eq!(PropHandler::for_property(&ids), Some(PropHandler::ArrayUInt32));

        let names = Property::array("Names", TdhInType::InTypeUnicodeString, PropertyCount::Count(2));
        assert_eq!(PropHandler::for_property(&names), None);
    }
}
