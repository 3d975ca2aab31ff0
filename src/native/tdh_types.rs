//! Basic TDH types
//!
//! The `tdh_type` module provides an abstraction over the basic TDH types, this module act as a
//! helper for the parser to determine which IN and OUT type are expected from a property within an
//! event
//!
//! This is basically a redefinition of the In an Out TDH types following the rust naming
//! convention, it can also come in handy when implementing the `TryParse` trait for a type
//! to determine how to handle a [Property] based on this values
use num_traits::FromPrimitive;

/// Attributes of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Name of the Property
    pub name: String,
    /// Represent the [PropertyFlags]
    pub flags: PropertyFlags,
    pub info: PropertyInfo,
}

/// Where the length of a property comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyLength {
    /// A fixed length. For `InTypeUnicodeString` it counts UTF-16 code units, for every other type it counts bytes.
    /// Zero means "implied by the type" (fixed-size types, NUL-terminated strings...)
    Length(u16),
    /// The length is the value of the property at this index (which must come before this one)
    Index(u16),
}

/// Number of elements of an array property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyCount {
    Count(u16),
    /// The count is the value of the property at this index (which must come before this one)
    Index(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyInfo {
    Value {
        in_type: TdhInType,
        out_type: TdhOutType,
        length: PropertyLength,
    },
    Array {
        in_type: TdhInType,
        out_type: TdhOutType,
        length: PropertyLength,
        count: PropertyCount,
    },
}

impl Property {
    /// A scalar property whose size is implied by its in-type
    pub fn new(name: &str, in_type: TdhInType, out_type: TdhOutType) -> Self {
        Property {
            name: name.to_string(),
            flags: PropertyFlags::empty(),
            info: PropertyInfo::Value {
                in_type,
                out_type,
                length: PropertyLength::Length(0),
            },
        }
    }

    /// Same as [`Property::new`], with the default out-type of `in_type`
    pub fn scalar(name: &str, in_type: TdhInType) -> Self {
        Self::new(name, in_type, in_type.default_out_type())
    }

    /// An array of `count` elements of `in_type`
    pub fn array(name: &str, in_type: TdhInType, count: PropertyCount) -> Self {
        let mut flags = PropertyFlags::empty();
        match count {
            PropertyCount::Count(_) => flags |= PropertyFlags::PROPERTY_PARAM_FIXED_COUNT,
            PropertyCount::Index(_) => flags |= PropertyFlags::PROPERTY_PARAM_COUNT,
        }
        Property {
            name: name.to_string(),
            flags,
            info: PropertyInfo::Array {
                in_type,
                out_type: in_type.default_out_type(),
                length: PropertyLength::Length(0),
                count,
            },
        }
    }

    /// Set where the length of this property comes from
    pub fn with_length(mut self, new_length: PropertyLength) -> Self {
        match new_length {
            PropertyLength::Length(_) => {
                self.flags.remove(PropertyFlags::PROPERTY_PARAM_LENGTH);
                self.flags |= PropertyFlags::PROPERTY_PARAM_FIXED_LENGTH;
            }
            PropertyLength::Index(_) => {
                self.flags.remove(PropertyFlags::PROPERTY_PARAM_FIXED_LENGTH);
                self.flags |= PropertyFlags::PROPERTY_PARAM_LENGTH;
            }
        }
        match &mut self.info {
            PropertyInfo::Value { length, .. } | PropertyInfo::Array { length, .. } => {
                *length = new_length
            }
        }
        self
    }

    pub fn in_type(&self) -> TdhInType {
        match self.info {
            PropertyInfo::Value { in_type, .. } | PropertyInfo::Array { in_type, .. } => in_type,
        }
    }

    pub fn out_type(&self) -> TdhOutType {
        match self.info {
            PropertyInfo::Value { out_type, .. } | PropertyInfo::Array { out_type, .. } => {
                out_type
            }
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.info, PropertyInfo::Array { .. })
    }
}

/// Represent a TDH_IN_TYPE
#[repr(u16)]
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Default)]
pub enum TdhInType {
    // Deprecated values are not defined
    #[default]
    InTypeNull,
    InTypeUnicodeString,
    InTypeAnsiString,
    InTypeInt8,    // Field size is 1 byte
    InTypeUInt8,   // Field size is 1 byte
    InTypeInt16,   // Field size is 2 bytes
    InTypeUInt16,  // Field size is 2 bytes
    InTypeInt32,   // Field size is 4 bytes
    InTypeUInt32,  // Field size is 4 bytes
    InTypeInt64,   // Field size is 8 bytes
    InTypeUInt64,  // Field size is 8 bytes
    InTypeFloat,   // Field size is 4 bytes
    InTypeDouble,  // Field size is 8 bytes
    InTypeBoolean, // Field size is 4 bytes
    InTypeBinary,  // Depends on the OutType
    InTypeGuid,
    InTypePointer,
    InTypeFileTime,   // Field size is 8 bytes
    InTypeSystemTime, // Field size is 16 bytes
    InTypeSid,        // Field size determined by the first few bytes of the field
    InTypeHexInt32,
    InTypeHexInt64,
    InTypeCountedString = 300,
}

impl TdhInType {
    pub fn from_raw(raw: u16) -> Self {
        FromPrimitive::from_u16(raw).unwrap_or(TdhInType::InTypeNull)
    }

    /// Size in bytes of the types whose size does not depend on the payload
    ///
    /// Pointers are excluded since their size depends on the event header.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            TdhInType::InTypeInt8 | TdhInType::InTypeUInt8 => Some(1),
            TdhInType::InTypeInt16 | TdhInType::InTypeUInt16 => Some(2),
            TdhInType::InTypeInt32
            | TdhInType::InTypeUInt32
            | TdhInType::InTypeHexInt32
            | TdhInType::InTypeFloat
            | TdhInType::InTypeBoolean => Some(4),
            TdhInType::InTypeInt64
            | TdhInType::InTypeUInt64
            | TdhInType::InTypeHexInt64
            | TdhInType::InTypeDouble
            | TdhInType::InTypeFileTime => Some(8),
            TdhInType::InTypeGuid | TdhInType::InTypeSystemTime => Some(16),
            _ => None,
        }
    }

    /// Whether the field holds an integer that can be read into a primitive integer
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            TdhInType::InTypeInt8
                | TdhInType::InTypeUInt8
                | TdhInType::InTypeInt16
                | TdhInType::InTypeUInt16
                | TdhInType::InTypeInt32
                | TdhInType::InTypeUInt32
                | TdhInType::InTypeInt64
                | TdhInType::InTypeUInt64
                | TdhInType::InTypeHexInt32
                | TdhInType::InTypeHexInt64
                | TdhInType::InTypeBoolean
                | TdhInType::InTypePointer
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self,
            TdhInType::InTypeUnicodeString
                | TdhInType::InTypeAnsiString
                | TdhInType::InTypeCountedString
        )
    }

    pub fn default_out_type(&self) -> TdhOutType {
        match self {
            TdhInType::InTypeUnicodeString
            | TdhInType::InTypeAnsiString
            | TdhInType::InTypeCountedString
            | TdhInType::InTypeSid => TdhOutType::OutTypeString,
            TdhInType::InTypeInt8 => TdhOutType::OutTypeInt8,
            TdhInType::InTypeUInt8 => TdhOutType::OutTypeUInt8,
            TdhInType::InTypeInt16 => TdhOutType::OutTypeInt16,
            TdhInType::InTypeUInt16 => TdhOutType::OutTypeUInt16,
            TdhInType::InTypeInt32 => TdhOutType::OutTypeInt32,
            TdhInType::InTypeUInt32 => TdhOutType::OutTypeUInt32,
            TdhInType::InTypeInt64 => TdhOutType::OutTypeInt64,
            TdhInType::InTypeUInt64 => TdhOutType::OutTypeUInt64,
            TdhInType::InTypeFloat => TdhOutType::OutTypeFloat,
            TdhInType::InTypeDouble => TdhOutType::OutTypeDouble,
            TdhInType::InTypeBoolean => TdhOutType::OutTypeBoolean,
            TdhInType::InTypeBinary => TdhOutType::OutTypeHexBinary,
            TdhInType::InTypeGuid => TdhOutType::OutTypeGuid,
            TdhInType::InTypePointer => TdhOutType::OutTypeHexInt64,
            TdhInType::InTypeFileTime | TdhInType::InTypeSystemTime => TdhOutType::OutTypeDateTime,
            TdhInType::InTypeHexInt32 => TdhOutType::OutTypeHexInt32,
            TdhInType::InTypeHexInt64 => TdhOutType::OutTypeHexInt64,
            TdhInType::InTypeNull => TdhOutType::OutTypeNull,
        }
    }
}

/// Represent a TDH_OUT_TYPE
#[repr(u16)]
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Default)]
pub enum TdhOutType {
    #[default]
    OutTypeNull,
    OutTypeString,
    OutTypeDateTime,
    OutTypeInt8,    // Field size is 1 byte
    OutTypeUInt8,   // Field size is 1 byte
    OutTypeInt16,   // Field size is 2 bytes
    OutTypeUInt16,  // Field size is 2 bytes
    OutTypeInt32,   // Field size is 4 bytes
    OutTypeUInt32,  // Field size is 4 bytes
    OutTypeInt64,   // Field size is 8 bytes
    OutTypeUInt64,  // Field size is 8 bytes
    OutTypeFloat,   // Field size is 4 bytes
    OutTypeDouble,  // Field size is 8 bytes
    OutTypeBoolean, // Field size is 4 bytes
    OutTypeGuid,
    OutTypeHexBinary,
    OutTypeHexInt8,
    OutTypeHexInt16,
    OutTypeHexInt32,
    OutTypeHexInt64,
    OutTypePid,
    OutTypeTid,
    OutTypePort,
    OutTypeIpv4,
    OutTypeIpv6,
    OutTypeWin32Error = 30,
    OutTypeNtStatus = 31,
    OutTypeHResult = 32,
    OutTypeJson = 34,
    OutTypeUtf8 = 35,
    OutTypePkcs7 = 36,
    OutTypeCodePointer = 37,
    OutTypeDatetimeUtc = 38,
}

impl TdhOutType {
    pub fn from_raw(raw: u16) -> Self {
        FromPrimitive::from_u16(raw).unwrap_or(TdhOutType::OutTypeNull)
    }
}

bitflags! {
    /// Represents the Property flags
    ///
    /// See: [Property Flags enum](https://docs.microsoft.com/en-us/windows/win32/api/tdh/ne-tdh-property_flags)
    #[derive(Default)]
    pub struct PropertyFlags: u32 {
        const PROPERTY_STRUCT = 0x1;
        const PROPERTY_PARAM_LENGTH = 0x2;
        const PROPERTY_PARAM_COUNT = 0x4;
        const PROPERTY_WBEMXML_FRAGMENT = 0x8;
        const PROPERTY_PARAM_FIXED_LENGTH = 0x10;
        const PROPERTY_PARAM_FIXED_COUNT = 0x20;
        const PROPERTY_HAS_TAGS = 0x40;
        const PROPERTY_HAS_CUSTOM_SCHEMA = 0x80;
    }
}
