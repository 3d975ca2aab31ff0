//! ETW Types Parser
//!
//! This module act as a helper to parse the Buffer from an ETW Event
//!
//! Properties are located lazily: asking for a property walks the payload up to that property only,
//! and every located property is cached for the lifetime of the [`Parser`]. Every access is bounds
//! checked against the payload size, since its content comes from outside of this process.

use crate::native::etw_types::EventRecord;
use crate::native::guid::Guid;
use crate::native::sid::{Sid, SidError};
use crate::native::tdh_types::{Property, PropertyCount, PropertyInfo, PropertyLength, TdhInType, TdhOutType};
use crate::native::time::{FileTime, SystemTime};
use crate::property::PropertySlice;
use crate::schema::Schema;
use crate::schema_locator::SchemaError;
use std::collections::HashMap;
use std::convert::TryInto;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};

/// Parser module errors
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    /// No property has this name
    #[error("no property named {0:?}")]
    FieldNotFound(String),
    /// The property cannot be read as the requested type
    #[error("property {name:?} ({found:?}) cannot be read as {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: TdhInType,
    },
    /// The property does not span the number of bytes its type requires
    #[error("property {name:?} spans {actual} bytes, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// The property (or one before it) extends past the end of the event payload
    #[error("property {name:?} lies outside of the event buffer")]
    OutOfBounds { name: String },
    /// This layout is not supported by this crate
    #[error("property {name:?} cannot be located: {reason}")]
    Unsupported { name: String, reason: &'static str },
    /// An error while transforming an Utf-8 buffer into String
    #[error("utf-8 error {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// A SID property is malformed
    #[error("invalid SID: {0}")]
    Sid(#[from] SidError),
    /// The event has no usable schema
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

type ParserResult<T> = Result<T, ParserError>;

fn type_mismatch(property: &Property, expected: &'static str) -> ParserError {
    ParserError::TypeMismatch {
        name: property.name.clone(),
        expected,
        found: property.in_type(),
    }
}

fn length_mismatch(slice: &PropertySlice, expected: usize) -> ParserError {
    ParserError::LengthMismatch {
        name: slice.property.name.clone(),
        expected,
        actual: slice.buffer.len(),
    }
}

/// Cache of the properties we've extracted already
///
/// This is useful because computing their offset can be costly
struct CachedSlices<'schema, 'record> {
    /// Located properties, in schema order
    slices: Vec<PropertySlice<'schema, 'record>>,
    by_name: HashMap<&'schema str, usize>,
    /// The user buffer index we've cached up to
    last_cached_offset: usize,
}

impl Default for CachedSlices<'_, '_> {
    fn default() -> Self {
        CachedSlices {
            slices: Vec::new(),
            by_name: HashMap::new(),
            last_cached_offset: 0,
        }
    }
}

/// Represents a Parser
///
/// This structure provides a way to parse an ETW event (= extract its properties).
/// Because properties may have variable length (e.g. strings), a `Parser` is only suited to a single [`EventRecord`]
///
/// # Example
/// ```
/// # use etwsession::native::etw_types::EventRecord;
/// # use etwsession::schema_locator::SchemaLocator;
/// # use etwsession::parser::Parser;
/// let my_callback = |record: &EventRecord, schema_locator: &SchemaLocator| {
///     let schema = schema_locator.event_schema(record).unwrap();
///     let parser = Parser::create(record, &schema);
///
///     // There are several ways to define the type requested for `try_parse`
///     // It is possible to use type inference...
///     let property1: Option<String> = parser.try_parse("PropertyName").ok();
///
///     // ...or to use the turbofish operator
///     match parser.try_parse::<u32>("OtherPropertyName") {
///         Ok(_) => println!("OtherPropertyName is a valid u32"),
///         Err(_) => println!("OtherPropertyName is invalid"),
///     }
/// };
/// ```
pub struct Parser<'schema, 'record> {
    properties: &'schema [Property],
    buffer: &'record [u8],
    pointer_size: usize,
    cache: Mutex<CachedSlices<'schema, 'record>>,
}

impl<'schema, 'record> Parser<'schema, 'record> {
    /// Use the `create` function to create an instance of a Parser
    ///
    /// # Arguments
    /// * `event_record` - The record to parse
    /// * `schema` - The [Schema] from the ETW Event we want to parse
    pub fn create(event_record: &EventRecord<'record>, schema: &'schema Schema) -> Self {
        Parser {
            properties: schema.properties(),
            buffer: event_record.user_buffer(),
            pointer_size: event_record.pointer_size(),
            cache: Mutex::new(CachedSlices::default()),
        }
    }

    /// Read an already located property as an unsigned count/length
    fn referenced_value(
        &self,
        property: &Property,
        index: u16,
        located: &[PropertySlice<'schema, 'record>],
    ) -> ParserResult<usize> {
        let referenced = located.get(index as usize).ok_or(ParserError::Unsupported {
            name: property.name.clone(),
            reason: "its length or count refers to a property that does not precede it",
        })?;
        let buf = referenced.buffer;
        let value = match buf.len() {
            1 => buf[0] as u64,
            2 => u16::from_ne_bytes([buf[0], buf[1]]) as u64,
            4 => u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
            8 => u64::from_ne_bytes(buf.try_into().map_err(|_| length_mismatch(referenced, 8))?),
            _ => return Err(type_mismatch(referenced.property, "an integer length")),
        };
        usize::try_from(value).map_err(|_| ParserError::OutOfBounds {
            name: property.name.clone(),
        })
    }

    /// Size of a property whose length is implied by its content
    fn implied_size(
        &self,
        property: &Property,
        in_type: TdhInType,
        remaining_user_buffer: &[u8],
    ) -> ParserResult<usize> {
        match in_type {
            TdhInType::InTypeAnsiString => Ok(remaining_user_buffer
                .iter()
                .position(|c| *c == 0)
                .map(|p| p + 1) // include the final null byte
                .unwrap_or(remaining_user_buffer.len())),
            TdhInType::InTypeUnicodeString => Ok(remaining_user_buffer
                .chunks_exact(2)
                .position(|c| c == [0, 0])
                .map(|p| (p + 1) * 2)
                .unwrap_or(remaining_user_buffer.len() & !1)),
            TdhInType::InTypeCountedString => {
                // A 16-bit byte count, then the UTF-16 characters
                let prefix = remaining_user_buffer
                    .get(..2)
                    .ok_or_else(|| ParserError::OutOfBounds {
                        name: property.name.clone(),
                    })?;
                Ok(2 + u16::from_ne_bytes([prefix[0], prefix[1]]) as usize)
            }
            TdhInType::InTypeSid => {
                Sid::encoded_len(remaining_user_buffer).ok_or_else(|| ParserError::OutOfBounds {
                    name: property.name.clone(),
                })
            }
            _ => Err(ParserError::Unsupported {
                name: property.name.clone(),
                reason: "its size is neither declared nor implied by its type",
            }),
        }
    }

    fn find_property_size(
        &self,
        property: &Property,
        remaining_user_buffer: &[u8],
        located: &[PropertySlice<'schema, 'record>],
    ) -> ParserResult<usize> {
        let (in_type, length, count) = match property.info {
            PropertyInfo::Value {
                in_type, length, ..
            } => (in_type, length, None),
            PropertyInfo::Array {
                in_type,
                length,
                count,
                ..
            } => (in_type, length, Some(count)),
        };

        // Unicode strings declare their length in characters
        let unit = if in_type == TdhInType::InTypeUnicodeString {
            2
        } else {
            1
        };

        let element_size = if in_type == TdhInType::InTypePointer {
            // For pointer input type we can immediately infer the size based on the header flags.
            self.pointer_size
        } else {
            match length {
                PropertyLength::Length(l) if l > 0 => l as usize * unit,
                PropertyLength::Index(i) => self.referenced_value(property, i, located)? * unit,
                PropertyLength::Length(_) => match in_type.fixed_size() {
                    Some(s) => s,
                    None if count.is_some() => {
                        return Err(ParserError::Unsupported {
                            name: property.name.clone(),
                            reason: "arrays of variable-size elements",
                        })
                    }
                    None => return self.implied_size(property, in_type, remaining_user_buffer),
                },
            }
        };

        let element_count = match count {
            None => 1,
            Some(PropertyCount::Count(c)) => c as usize,
            Some(PropertyCount::Index(i)) => self.referenced_value(property, i, located)?,
        };

        element_size
            .checked_mul(element_count)
            .ok_or_else(|| ParserError::OutOfBounds {
                name: property.name.clone(),
            })
    }

    fn find_property(&self, name: &str) -> ParserResult<PropertySlice<'schema, 'record>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        // We may have extracted this property already
        if let Some(index) = cache.by_name.get(name) {
            return Ok(cache.slices[*index]);
        }

        // Do not walk the payload for a property that does not exist
        if !self.properties.iter().any(|p| p.name == name) {
            return Err(ParserError::FieldNotFound(name.to_string()));
        }

        let properties_not_parsed_yet = match self.properties.get(cache.slices.len()..) {
            Some(s) => s,
            None => return Err(ParserError::FieldNotFound(name.to_string())),
        };

        for property in properties_not_parsed_yet {
            let remaining_user_buffer = self.buffer.get(cache.last_cached_offset..).ok_or_else(
                || ParserError::OutOfBounds {
                    name: property.name.clone(),
                },
            )?;

            let prop_size = self.find_property_size(property, remaining_user_buffer, &cache.slices)?;
            let property_buffer =
                remaining_user_buffer
                    .get(..prop_size)
                    .ok_or_else(|| ParserError::OutOfBounds {
                        name: property.name.clone(),
                    })?;

            let prop_slice = PropertySlice {
                property,
                buffer: property_buffer,
            };
            let index = cache.slices.len();
            cache.slices.push(prop_slice);
            cache.by_name.entry(property.name.as_str()).or_insert(index);
            cache.last_cached_offset += prop_size;

            if property.name == name {
                return Ok(prop_slice);
            }
        }

        Err(ParserError::FieldNotFound(name.to_string()))
    }

    /// Locate a property without interpreting it
    pub fn property_slice(&self, name: &str) -> ParserResult<PropertySlice<'schema, 'record>> {
        self.find_property(name)
    }

    /// Return a property from the event, or an error in case the parsing failed.
    ///
    /// You must explicitly define `T`, the type you want to parse the property into.<br/>
    /// In case this type is not compatible with the ETW type, [`ParserError::TypeMismatch`] is returned.
    pub fn try_parse<T>(&self, name: &str) -> ParserResult<T>
    where
        Parser<'schema, 'record>: private::TryParse<T>,
    {
        use crate::parser::private::TryParse;
        self.try_parse_impl(name)
    }

    /// Same as [`Parser::try_parse`], but panics when the property cannot be parsed
    ///
    /// Inside an event handler, the panic is caught by the session: it aborts this handler call only.
    pub fn parse<T>(&self, name: &str) -> T
    where
        Parser<'schema, 'record>: private::TryParse<T>,
    {
        match self.try_parse(name) {
            Ok(value) => value,
            Err(err) => panic!("unable to parse property {:?}: {}", name, err),
        }
    }
}

mod private {
    use super::*;

    /// Trait to try and parse a type
    ///
    /// This trait has to be implemented in order to be able to parse a type we want to retrieve from
    /// within an Event.
    ///
    /// An implementation for most of the Primitive Types is created by using a Macro, any other needed type
    /// requires this trait to be implemented
    pub trait TryParse<T> {
        /// Implement the `try_parse` function to provide a way to Parse `T` from an ETW event or
        /// return an Error in case the type `T` can't be parsed
        ///
        /// # Arguments
        /// * `name` - Name of the property to be found in the Schema
        fn try_parse_impl(&self, name: &str) -> Result<T, ParserError>;
    }
}

impl Parser<'_, '_> {
    /// The declared width of an integer property
    fn integer_width(&self, in_type: TdhInType) -> Option<usize> {
        match in_type {
            TdhInType::InTypePointer => Some(self.pointer_size),
            other => other.fixed_size(),
        }
    }
}

macro_rules! impl_try_parse_primitive {
    ($T:ident, $accepts:expr) => {
        impl private::TryParse<$T> for Parser<'_, '_> {
            fn try_parse_impl(&self, name: &str) -> ParserResult<$T> {
                let prop_slice = self.find_property(name)?;
                let size = std::mem::size_of::<$T>();

                match prop_slice.property.info {
                    PropertyInfo::Value { in_type, .. }
                        if $accepts(in_type) && self.integer_width(in_type) == Some(size) =>
                    {
                        let bytes = prop_slice
                            .buffer
                            .try_into()
                            .map_err(|_| length_mismatch(&prop_slice, size))?;
                        Ok($T::from_ne_bytes(bytes))
                    }
                    _ => Err(type_mismatch(prop_slice.property, stringify!($T))),
                }
            }
        }
    };
}

macro_rules! impl_try_parse_primitive_array {
    ($T:ident) => {
        impl private::TryParse<Vec<$T>> for Parser<'_, '_> {
            fn try_parse_impl(&self, name: &str) -> ParserResult<Vec<$T>> {
                let prop_slice = self.find_property(name)?;
                let size = std::mem::size_of::<$T>();

                match prop_slice.property.info {
                    PropertyInfo::Array { in_type, .. }
                        if in_type.is_integer() && self.integer_width(in_type) == Some(size) =>
                    {
                        if prop_slice.buffer.len() % size != 0 {
                            return Err(length_mismatch(
                                &prop_slice,
                                prop_slice.buffer.len() / size * size,
                            ));
                        }
                        // The payload has no alignment guarantee: copy element by element
                        Ok(prop_slice
                            .buffer
                            .chunks_exact(size)
                            .filter_map(|c| c.try_into().ok().map($T::from_ne_bytes))
                            .collect())
                    }
                    _ => Err(type_mismatch(
                        prop_slice.property,
                        concat!("an array of ", stringify!($T)),
                    )),
                }
            }
        }
    };
}

fn is_integer(in_type: TdhInType) -> bool {
    in_type.is_integer()
}

fn is_float(in_type: TdhInType) -> bool {
    matches!(in_type, TdhInType::InTypeFloat | TdhInType::InTypeDouble)
}

impl_try_parse_primitive!(u8, is_integer);
impl_try_parse_primitive!(i8, is_integer);
impl_try_parse_primitive!(u16, is_integer);
impl_try_parse_primitive!(i16, is_integer);
impl_try_parse_primitive!(u32, is_integer);
impl_try_parse_primitive!(i32, is_integer);
impl_try_parse_primitive!(u64, is_integer);
impl_try_parse_primitive!(i64, is_integer);
impl_try_parse_primitive!(f32, is_float);
impl_try_parse_primitive!(f64, is_float);

impl_try_parse_primitive_array!(u16);
impl_try_parse_primitive_array!(i16);
impl_try_parse_primitive_array!(u32);
impl_try_parse_primitive_array!(i32);
impl_try_parse_primitive_array!(u64);
impl_try_parse_primitive_array!(i64);

fn decode_utf16(buffer: &[u8]) -> String {
    let wide = buffer
        .chunks_exact(2)
        .map(|c| u16::from_ne_bytes([c[0], c[1]]))
        .take_while(|c| *c != 0);
    widestring::decode_utf16_lossy(wide).collect::<String>()
}

/// The `String` impl of the `TryParse` trait should be used to retrieve the following [TdhInTypes]:
///
/// * InTypeUnicodeString
/// * InTypeAnsiString
/// * InTypeCountedString
/// * InTypeSid (rendered as `S-1-...`)
/// * InTypeGuid
///
/// On success a `String` with the with the data from the `name` property will be returned
///
/// # Arguments
/// * `name` - Name of the property to be found in the Schema
///
/// # Example
/// ```
/// # use etwsession::native::etw_types::EventRecord;
/// # use etwsession::schema_locator::SchemaLocator;
/// # use etwsession::parser::Parser;
/// let my_callback = |record: &EventRecord, schema_locator: &SchemaLocator| {
///     let schema = schema_locator.event_schema(record).unwrap();
///     let parser = Parser::create(record, &schema);
///     let image_name: String = parser.try_parse("ImageName").unwrap();
/// };
/// ```
///
/// [TdhInTypes]: TdhInType
impl private::TryParse<String> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> ParserResult<String> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value { in_type, .. } => match in_type {
                TdhInType::InTypeUnicodeString => {
                    if prop_slice.buffer.len() % 2 != 0 {
                        return Err(length_mismatch(&prop_slice, prop_slice.buffer.len() + 1));
                    }
                    Ok(decode_utf16(prop_slice.buffer))
                }
                TdhInType::InTypeAnsiString => {
                    let end = prop_slice
                        .buffer
                        .iter()
                        .position(|c| *c == 0)
                        .unwrap_or(prop_slice.buffer.len());
                    Ok(std::str::from_utf8(&prop_slice.buffer[..end])?.to_string())
                }
                TdhInType::InTypeCountedString => {
                    // Bounds were checked when locating the property
                    Ok(decode_utf16(prop_slice.buffer.get(2..).unwrap_or_default()))
                }
                TdhInType::InTypeSid => Ok(Sid::from_bytes(prop_slice.buffer)?.to_string()),
                TdhInType::InTypeGuid => {
                    let guid: Guid = private::TryParse::<Guid>::try_parse_impl(self, name)?;
                    Ok(guid.to_string())
                }
                _ => Err(type_mismatch(prop_slice.property, "String")),
            },
            _ => Err(type_mismatch(prop_slice.property, "String")),
        }
    }
}

impl private::TryParse<Guid> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> Result<Guid, ParserError> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value {
                in_type: TdhInType::InTypeGuid,
                ..
            } => Guid::from_ne_slice(prop_slice.buffer).ok_or_else(|| length_mismatch(&prop_slice, 16)),
            _ => Err(type_mismatch(prop_slice.property, "Guid")),
        }
    }
}

impl private::TryParse<Sid> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> Result<Sid, ParserError> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value {
                in_type: TdhInType::InTypeSid,
                ..
            } => Ok(Sid::from_bytes(prop_slice.buffer)?),
            _ => Err(type_mismatch(prop_slice.property, "Sid")),
        }
    }
}

impl private::TryParse<IpAddr> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> ParserResult<IpAddr> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value { out_type, .. }
                if out_type == TdhOutType::OutTypeIpv4 || out_type == TdhOutType::OutTypeIpv6 =>
            {
                // Addresses are stored in network order
                match prop_slice.buffer.len() {
                    16 => {
                        let tmp: [u8; 16] = prop_slice
                            .buffer
                            .try_into()
                            .map_err(|_| length_mismatch(&prop_slice, 16))?;
                        Ok(IpAddr::V6(Ipv6Addr::from(tmp)))
                    }
                    4 => {
                        let tmp: [u8; 4] = prop_slice
                            .buffer
                            .try_into()
                            .map_err(|_| length_mismatch(&prop_slice, 4))?;
                        Ok(IpAddr::V4(Ipv4Addr::from(tmp)))
                    }
                    _ => Err(length_mismatch(
                        &prop_slice,
                        if out_type == TdhOutType::OutTypeIpv4 { 4 } else { 16 },
                    )),
                }
            }
            _ => Err(type_mismatch(prop_slice.property, "IpAddr")),
        }
    }
}

impl private::TryParse<bool> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> ParserResult<bool> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value {
                in_type: TdhInType::InTypeBoolean,
                ..
            } => match prop_slice.buffer.len() {
                1 => Ok(prop_slice.buffer[0] != 0),
                4 | 8 => Ok(prop_slice.buffer.iter().any(|b| *b != 0)),
                _ => Err(length_mismatch(&prop_slice, 4)),
            },
            _ => Err(type_mismatch(prop_slice.property, "bool")),
        }
    }
}

impl private::TryParse<FileTime> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> ParserResult<FileTime> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value {
                in_type: TdhInType::InTypeFileTime,
                ..
            } => {
                let bytes = prop_slice
                    .buffer
                    .try_into()
                    .map_err(|_| length_mismatch(&prop_slice, 8))?;
                Ok(FileTime::from_slice(bytes))
            }
            _ => Err(type_mismatch(prop_slice.property, "FileTime")),
        }
    }
}

impl private::TryParse<SystemTime> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> ParserResult<SystemTime> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value {
                in_type: TdhInType::InTypeSystemTime,
                ..
            } => {
                let bytes = prop_slice
                    .buffer
                    .try_into()
                    .map_err(|_| length_mismatch(&prop_slice, 16))?;
                Ok(SystemTime::from_slice(bytes))
            }
            _ => Err(type_mismatch(prop_slice.property, "SystemTime")),
        }
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Pointer(usize);

impl std::ops::Deref for Pointer {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::LowerHex for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = self.0;

        std::fmt::LowerHex::fmt(&val, f) // delegate to u32/u64 implementation
    }
}

impl std::fmt::UpperHex for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = self.0;

        std::fmt::UpperHex::fmt(&val, f) // delegate to u32/u64 implementation
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = self.0;

        std::fmt::Display::fmt(&val, f) // delegate to u32/u64 implementation
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Pointer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0 as u64)
    }
}

impl private::TryParse<Pointer> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> ParserResult<Pointer> {
        let prop_slice = self.find_property(name)?;

        match prop_slice.property.info {
            PropertyInfo::Value { in_type, .. }
                if matches!(
                    in_type,
                    TdhInType::InTypePointer | TdhInType::InTypeHexInt32 | TdhInType::InTypeHexInt64
                ) =>
            {
                match prop_slice.buffer.len() {
                    4 => Ok(Pointer(
                        private::TryParse::<u32>::try_parse_impl(self, name)? as usize,
                    )),
                    8 => Ok(Pointer(
                        private::TryParse::<u64>::try_parse_impl(self, name)? as usize,
                    )),
                    _ => Err(length_mismatch(&prop_slice, self.pointer_size)),
                }
            }
            _ => Err(type_mismatch(prop_slice.property, "Pointer")),
        }
    }
}

/// Raw bytes of any property
impl private::TryParse<Vec<u8>> for Parser<'_, '_> {
    fn try_parse_impl(&self, name: &str) -> Result<Vec<u8>, ParserError> {
        let prop_slice = self.find_property(name)?;
        Ok(prop_slice.buffer.to_vec())
    }
}
