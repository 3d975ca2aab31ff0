//! Basic ETW types
//!
//! The `etw_types` module provides the portable representation of the records a native tracing
//! facility hands to a session: a fixed-size [`EventHeader`], the borrowed [`EventRecord`] view that
//! handlers receive, and its [`ExtendedDataItem`]s.
//!
//! In most cases a user of the crate won't have to build these types and can directly obtain the data
//! needed by using the functions exposed by the modules at the crate level
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::native::guid::Guid;

mod event_record;
pub use event_record::EventRecord;

mod extended_data;
pub use extended_data::{ExtendedDataItem, ExtendedDataType};

/// Session names longer than this are truncated by the native layer
pub const TRACE_NAME_MAX_CHARS: usize = 200; // Microsoft documentation says the limit is 1024, but do not trust us. Experience shows that traces with names longer than ~240 character silently fail.

#[doc(hidden)]
pub const EVENT_HEADER_FLAG_EXTENDED_INFO: u16 = 0x0001;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_PRIVATE_SESSION: u16 = 0x0002;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_STRING_ONLY: u16 = 0x0004;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_TRACE_MESSAGE: u16 = 0x0008;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_NO_CPUTIME: u16 = 0x0010;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_32_BIT_HEADER: u16 = 0x0020;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_64_BIT_HEADER: u16 = 0x0040;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_CLASSIC_HEADER: u16 = 0x0100;
#[doc(hidden)]
pub const EVENT_HEADER_FLAG_PROCESSOR_INDEX: u16 = 0x0200;

/// Native control codes of a running session
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlValues {
    Query = 0,
    Stop = 1,
    Update = 2,
    Flush = 3,
}

/// Logging modes of a session, see [`TraceProperties::log_file_mode`](crate::trace::TraceProperties::log_file_mode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    None,
    Sequential,
    Circular,
    Append,
    NewFile,
    NonStoppable,
    Secure,
    RealTime,
    Buffering,
    SystemLogger,
    DelayOpenFile,
    PrivateLogger,
    NoPerProcBuffering,
}

impl From<LoggingMode> for u32 {
    fn from(val: LoggingMode) -> Self {
        match val {
            // Values of the EVENT_TRACE_*_MODE constants from evntrace.h
            LoggingMode::None => 0x0000_0000,
            LoggingMode::Sequential => 0x0000_0001,
            LoggingMode::Circular => 0x0000_0002,
            LoggingMode::Append => 0x0000_0004,
            LoggingMode::NewFile => 0x0000_0008,
            LoggingMode::NonStoppable => 0x0000_0040,
            LoggingMode::Secure => 0x0000_0080,
            LoggingMode::RealTime => 0x0000_0100,
            LoggingMode::DelayOpenFile => 0x0000_0200,
            LoggingMode::Buffering => 0x0000_0400,
            LoggingMode::PrivateLogger => 0x0000_0800,
            LoggingMode::SystemLogger => 0x0200_0000,
            LoggingMode::NoPerProcBuffering => 0x1000_0000,
        }
    }
}

/// The logging mode used when a session does not request one explicitly
pub fn default_logging_mode() -> u32 {
    u32::from(LoggingMode::RealTime) | u32::from(LoggingMode::NoPerProcBuffering)
}

/// Where the schema of an event comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DecodingSource {
    #[default]
    DecodingSourceXMLFile,
    DecodingSourceWbem,
    DecodingSourceWPP,
    DecodingSourceTlg,
    DecodingSourceMax,
}

impl From<u32> for DecodingSource {
    fn from(val: u32) -> Self {
        match val {
            0 => DecodingSource::DecodingSourceXMLFile,
            1 => DecodingSource::DecodingSourceWbem,
            2 => DecodingSource::DecodingSourceWPP,
            3 => DecodingSource::DecodingSourceTlg,
            _ => DecodingSource::DecodingSourceMax,
        }
    }
}

impl From<DecodingSource> for u32 {
    fn from(val: DecodingSource) -> Self {
        match val {
            DecodingSource::DecodingSourceXMLFile => 0,
            DecodingSource::DecodingSourceWbem => 1,
            DecodingSource::DecodingSourceWPP => 2,
            DecodingSource::DecodingSourceTlg => 3,
            DecodingSource::DecodingSourceMax => 4,
        }
    }
}

/// The fixed part of every event record
///
/// This is a flattened [EVENT_HEADER](https://learn.microsoft.com/en-us/windows/win32/api/evntcons/ns-evntcons-event_header)
/// (its `EVENT_DESCRIPTOR` is inlined). The layout has no padding, which lets the recording format
/// store headers as raw bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct EventHeader {
    pub provider_id: Guid,
    pub activity_id: Guid,
    /// Time the event occurred, in 100ns intervals since 1601-01-01 (FILETIME resolution)
    pub timestamp: i64,
    pub keyword: u64,
    pub process_id: u32,
    pub thread_id: u32,
    pub event_id: u16,
    /// `EVENT_HEADER_FLAG_*` bits
    pub flags: u16,
    pub version: u8,
    pub channel: u8,
    pub level: u8,
    pub opcode: u8,
    pub task: u16,
    pub event_property: u16,
    pub reserved: u32,
}

impl EventHeader {
    pub const SIZE: usize = std::mem::size_of::<EventHeader>();

    /// A header for a record emitted by `provider_id` with the given event id
    pub fn new(provider_id: Guid, event_id: u16) -> Self {
        EventHeader {
            provider_id,
            event_id,
            flags: EVENT_HEADER_FLAG_64_BIT_HEADER,
            ..Default::default()
        }
    }

    pub fn pointer_size(&self) -> usize {
        if self.flags & EVENT_HEADER_FLAG_32_BIT_HEADER != 0 {
            4
        } else {
            8
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(EventHeader::SIZE, 72);
        let header = EventHeader::new(Guid::from_u128(1), 42);
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), EventHeader::SIZE);
        assert_eq!(EventHeader::read_from(bytes), Some(header));
    }

    #[test]
    fn test_pointer_size() {
        let mut header = EventHeader::new(Guid::zeroed(), 1);
        assert_eq!(header.pointer_size(), 8);
        header.flags = EVENT_HEADER_FLAG_32_BIT_HEADER;
        assert_eq!(header.pointer_size(), 4);
    }

    #[test]
    fn test_logging_mode() {
        assert_eq!(default_logging_mode(), 0x1000_0100);
        assert_eq!(u32::from(LoggingMode::Circular), 2);
    }
}
