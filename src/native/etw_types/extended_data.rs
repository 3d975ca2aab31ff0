//! A module to handle Extended Data from ETW traces

use num_traits::FromPrimitive;

use crate::native::guid::Guid;
use crate::native::sid::Sid;

/// Known values of `EVENT_HEADER_EXTENDED_DATA_ITEM::ExtType`
///
/// See <https://docs.microsoft.com/en-us/windows/win32/api/relogger/ns-relogger-event_header_extended_data_item>
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ExtendedDataType {
    RelatedActivityId = 1,
    Sid = 2,
    TsId = 3,
    InstanceInfo = 4,
    StackTrace32 = 5,
    StackTrace64 = 6,
    PebsIndex = 7,
    PmcCounters = 8,
    PsmKey = 9,
    EventKey = 10,
    EventSchemaTl = 11,
    ProvTraits = 12,
    ProcessStartKey = 13,
    ControlGuid = 14,
    QpcDelta = 15,
    ContainerId = 16,
}

/// A safe representation of an extended data item
///
/// Items are decoded eagerly from their raw form when the native layer builds the record: they are
/// small, and a malformed item only degrades to [`ExtendedDataItem::Unsupported`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ExtendedDataItem {
    /// Related activity identifier
    RelatedActivityId(Guid),
    /// Security identifier (SID) of the user that logged the event
    Sid(Sid),
    /// Terminal session identifier
    TsId(u32),
    InstanceInfo {
        instance_id: u32,
        parent_instance_id: u32,
        parent_guid: Guid,
    },
    /// Call stack (if the event is captured on a 32-bit computer)
    StackTrace32 { match_id: u64, addresses: Vec<u32> },
    /// Call stack (if the event is captured on a 64-bit computer)
    StackTrace64 { match_id: u64, addresses: Vec<u64> },
    /// Unique event identifier
    EventKey(u64),
    /// Unique process identifier (unique across the boot session)
    ProcessStartKey(u64),
    /// Identifier of the container the event comes from
    ContainerId(Guid),
    /// Unexpected, invalid or not implemented yet
    Unsupported { ext_type: u16, data: Vec<u8> },
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

fn read_guid(data: &[u8], offset: usize) -> Option<Guid> {
    Guid::from_ne_slice(data.get(offset..offset + 16)?)
}

impl ExtendedDataItem {
    /// Decode an item from its `ExtType` and raw data
    pub fn from_raw(ext_type: u16, data: &[u8]) -> Self {
        Self::try_from_raw(ext_type, data).unwrap_or_else(|| ExtendedDataItem::Unsupported {
            ext_type,
            data: data.to_vec(),
        })
    }

    fn try_from_raw(ext_type: u16, data: &[u8]) -> Option<Self> {
        let item = match ExtendedDataType::from_u16(ext_type)? {
            ExtendedDataType::RelatedActivityId => {
                ExtendedDataItem::RelatedActivityId(read_guid(data, 0)?)
            }
            ExtendedDataType::Sid => ExtendedDataItem::Sid(Sid::from_bytes(data).ok()?),
            ExtendedDataType::TsId => ExtendedDataItem::TsId(read_u32(data, 0)?),
            ExtendedDataType::InstanceInfo => ExtendedDataItem::InstanceInfo {
                instance_id: read_u32(data, 0)?,
                parent_instance_id: read_u32(data, 4)?,
                parent_guid: read_guid(data, 8)?,
            },
            ExtendedDataType::StackTrace32 => ExtendedDataItem::StackTrace32 {
                match_id: read_u64(data, 0)?,
                addresses: data
                    .get(8..)?
                    .chunks_exact(4)
                    .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            },
            ExtendedDataType::StackTrace64 => ExtendedDataItem::StackTrace64 {
                match_id: read_u64(data, 0)?,
                addresses: data
                    .get(8..)?
                    .chunks_exact(8)
                    .filter_map(|c| c.try_into().ok().map(u64::from_ne_bytes))
                    .collect(),
            },
            ExtendedDataType::EventKey => ExtendedDataItem::EventKey(read_u64(data, 0)?),
            ExtendedDataType::ProcessStartKey => {
                ExtendedDataItem::ProcessStartKey(read_u64(data, 0)?)
            }
            ExtendedDataType::ContainerId => ExtendedDataItem::ContainerId(read_guid(data, 0)?),
            _ => return None,
        };
        Some(item)
    }

    /// The `ExtType` of this item
    pub fn data_type(&self) -> u16 {
        let known = match self {
            ExtendedDataItem::RelatedActivityId(_) => ExtendedDataType::RelatedActivityId,
            ExtendedDataItem::Sid(_) => ExtendedDataType::Sid,
            ExtendedDataItem::TsId(_) => ExtendedDataType::TsId,
            ExtendedDataItem::InstanceInfo { .. } => ExtendedDataType::InstanceInfo,
            ExtendedDataItem::StackTrace32 { .. } => ExtendedDataType::StackTrace32,
            ExtendedDataItem::StackTrace64 { .. } => ExtendedDataType::StackTrace64,
            ExtendedDataItem::EventKey(_) => ExtendedDataType::EventKey,
            ExtendedDataItem::ProcessStartKey(_) => ExtendedDataType::ProcessStartKey,
            ExtendedDataItem::ContainerId(_) => ExtendedDataType::ContainerId,
            ExtendedDataItem::Unsupported { ext_type, .. } => return *ext_type,
        };
        known as u16
    }

    /// The raw form of this item, as `from_raw` expects it
    pub fn to_raw(&self) -> Vec<u8> {
        use zerocopy::AsBytes;

        match self {
            ExtendedDataItem::RelatedActivityId(guid) | ExtendedDataItem::ContainerId(guid) => {
                guid.as_bytes().to_vec()
            }
            ExtendedDataItem::Sid(sid) => sid.to_bytes(),
            ExtendedDataItem::TsId(id) => id.to_ne_bytes().to_vec(),
            ExtendedDataItem::InstanceInfo {
                instance_id,
                parent_instance_id,
                parent_guid,
            } => {
                let mut out = Vec::with_capacity(24);
                out.extend_from_slice(&instance_id.to_ne_bytes());
                out.extend_from_slice(&parent_instance_id.to_ne_bytes());
                out.extend_from_slice(parent_guid.as_bytes());
                out
            }
            ExtendedDataItem::StackTrace32 {
                match_id,
                addresses,
            } => {
                let mut out = match_id.to_ne_bytes().to_vec();
                addresses
                    .iter()
                    .for_each(|a| out.extend_from_slice(&a.to_ne_bytes()));
                out
            }
            ExtendedDataItem::StackTrace64 {
                match_id,
                addresses,
            } => {
                let mut out = match_id.to_ne_bytes().to_vec();
                addresses
                    .iter()
                    .for_each(|a| out.extend_from_slice(&a.to_ne_bytes()));
                out
            }
            ExtendedDataItem::EventKey(key) | ExtendedDataItem::ProcessStartKey(key) => {
                key.to_ne_bytes().to_vec()
            }
            ExtendedDataItem::Unsupported { data, .. } => data.clone(),
        }
    }
}
