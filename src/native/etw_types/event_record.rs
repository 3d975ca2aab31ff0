//! A borrowed view over one event record

use crate::native::etw_types::{EventHeader, ExtendedDataItem};
use crate::native::guid::Guid;

/// The record type of the native facility, when there is one
#[cfg(windows)]
pub(crate) type RawRecord = windows::Win32::System::Diagnostics::Etw::EVENT_RECORD;
#[cfg(not(windows))]
pub(crate) enum RawRecord {}

/// A read-only view over an event record, as delivered by the native layer
///
/// The view borrows the native buffers: it is only valid for the duration of the dispatch call that
/// produced it. Handlers receive a `&EventRecord` and cannot keep it (or anything borrowed from it)
/// past their return.
#[derive(Clone, Copy)]
pub struct EventRecord<'a> {
    header: EventHeader,
    user_data: &'a [u8],
    extended_data: &'a [ExtendedDataItem],
    raw: Option<&'a RawRecord>,
}

impl std::fmt::Debug for EventRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecord")
            .field("header", &self.header)
            .field("user_data_len", &self.user_data.len())
            .field("extended_data", &self.extended_data)
            .finish()
    }
}

impl<'a> EventRecord<'a> {
    pub fn new(
        header: EventHeader,
        user_data: &'a [u8],
        extended_data: &'a [ExtendedDataItem],
    ) -> Self {
        EventRecord {
            header,
            user_data,
            extended_data,
            raw: None,
        }
    }

    /// Attach the native record this view was built from
    #[cfg(windows)]
    pub(crate) fn with_raw(mut self, raw: &'a RawRecord) -> Self {
        self.raw = Some(raw);
        self
    }

    #[allow(dead_code)]
    pub(crate) fn raw(&self) -> Option<&'a RawRecord> {
        self.raw
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    /// The GUID of the provider that emitted this event
    pub fn provider_id(&self) -> Guid {
        self.header.provider_id
    }

    pub fn event_id(&self) -> u16 {
        self.header.event_id
    }

    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    pub fn level(&self) -> u8 {
        self.header.level
    }

    pub fn keyword(&self) -> u64 {
        self.header.keyword
    }

    pub fn task(&self) -> u16 {
        self.header.task
    }

    pub fn event_flags(&self) -> u16 {
        self.header.flags
    }

    pub fn process_id(&self) -> u32 {
        self.header.process_id
    }

    pub fn thread_id(&self) -> u32 {
        self.header.thread_id
    }

    pub fn activity_id(&self) -> Guid {
        self.header.activity_id
    }

    /// The time the event occurred, in 100ns intervals since January 1, 1601 (UTC)
    ///
    /// Use [`FileTime`](crate::native::time::FileTime) to convert it.
    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    /// Size of a pointer in the process that emitted the event
    pub fn pointer_size(&self) -> usize {
        self.header.pointer_size()
    }

    pub(crate) fn user_buffer(&self) -> &'a [u8] {
        self.user_data
    }

    /// Returns the extended data items attached to this event
    ///
    /// Their availability is mostly determined by the flags passed to [`ProviderBuilder::trace_flags`](crate::provider::ProviderBuilder::trace_flags)
    ///
    /// # Example
    /// ```
    /// # use etwsession::native::etw_types::{EventRecord, ExtendedDataItem};
    /// # use etwsession::schema_locator::SchemaLocator;
    /// let my_callback = |record: &EventRecord, _schema_locator: &SchemaLocator| {
    ///     let related_activity = record
    ///         .extended_data()
    ///         .iter()
    ///         .find_map(|item| match item {
    ///             ExtendedDataItem::RelatedActivityId(guid) => Some(*guid),
    ///             _ => None,
    ///         });
    /// };
    /// ```
    pub fn extended_data(&self) -> &'a [ExtendedDataItem] {
        self.extended_data
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accessors() {
        let mut header = EventHeader::new(Guid::from_u128(7), 5);
        header.process_id = 1234;
        header.thread_id = 5678;
        header.opcode = 2;
        header.level = 4;
        header.timestamp = 133_000_000_000_000_000;
        let payload = [1u8, 2, 3];
        let extended = [ExtendedDataItem::TsId(3)];
        let record = EventRecord::new(header, &payload, &extended);

        assert_eq!(record.provider_id(), Guid::from_u128(7));
        assert_eq!(record.event_id(), 5);
        assert_eq!(record.process_id(), 1234);
        assert_eq!(record.thread_id(), 5678);
        assert_eq!(record.opcode(), 2);
        assert_eq!(record.level(), 4);
        assert_eq!(record.timestamp(), 133_000_000_000_000_000);
        assert_eq!(record.user_buffer(), &payload);
        assert_eq!(record.extended_data().len(), 1);
        assert_eq!(record.pointer_size(), 8);
    }
}
