//! Native API - Event Tracing tdh header
//!
//! The `tdh` module is an abstraction layer for the Windows tdh library. This module act as a
//! internal API that holds all `unsafe` calls to functions exported by the `tdh` Windows library.
use std::ffi::c_void;

use widestring::{U16CStr, U16CString};
use windows::core::{GUID, PWSTR};
use windows::Win32::Foundation::{BOOLEAN, ERROR_INSUFFICIENT_BUFFER};
use windows::Win32::System::Diagnostics::Etw;

use crate::native::etw_types::{DecodingSource, EventRecord};
use crate::native::guid::Guid;
use crate::native::tdh_types::{
    Property, PropertyCount, PropertyFlags, PropertyInfo, PropertyLength, TdhInType, TdhOutType,
};
use crate::native::{NativeError, NativeResult};
use crate::provider::event_filter::{PayloadCondition, PayloadFilter};
use crate::provider::predicate::{CompareOp, FieldValue};
use crate::schema::Schema;

/// A `TRACE_EVENT_INFO` and its trailing data, as returned by `TdhGetEventInformation`
struct TraceEventInfoRaw {
    // u64 items keep the buffer aligned for TRACE_EVENT_INFO
    data: Vec<u64>,
    len: usize,
}

impl TraceEventInfoRaw {
    fn alloc(len: u32) -> Self {
        let len = len as usize;
        TraceEventInfoRaw {
            data: vec![0u64; (len + 7) / 8],
            len,
        }
    }

    fn info_as_ptr(&mut self) -> *mut Etw::TRACE_EVENT_INFO {
        self.data.as_mut_ptr().cast()
    }

    fn info(&self) -> &Etw::TRACE_EVENT_INFO {
        // Safety: the buffer is aligned, and TDH filled it with a TRACE_EVENT_INFO
        unsafe { &*self.data.as_ptr().cast::<Etw::TRACE_EVENT_INFO>() }
    }

    fn bytes(&self) -> &[u8] {
        // Safety: `len` bytes were allocated
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast::<u8>(), self.len) }
    }

    /// The NUL-terminated wide string at `offset` (zero means absent)
    fn string_at(&self, offset: u32) -> String {
        let bytes = match self.bytes().get(offset as usize..) {
            Some(bytes) if offset != 0 => bytes,
            _ => return String::new(),
        };
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect();
        U16CStr::from_slice_truncate(&units)
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    }

    fn properties(&self) -> &[Etw::EVENT_PROPERTY_INFO] {
        let info = self.info();
        let count = info.TopLevelPropertyCount as usize;
        let start = offset_of!(Etw::TRACE_EVENT_INFO, EventPropertyInfoArray);
        let available = self.len.saturating_sub(start) / std::mem::size_of::<Etw::EVENT_PROPERTY_INFO>();
        // Safety: bounded by the size of the buffer
        unsafe { std::slice::from_raw_parts(info.EventPropertyInfoArray.as_ptr(), count.min(available)) }
    }
}

fn convert_property(raw: &TraceEventInfoRaw, property: &Etw::EVENT_PROPERTY_INFO) -> Property {
    let name = raw.string_at(property.NameOffset);
    let flags = PropertyFlags::from_bits_truncate(property.Flags.0 as u32);

    if flags.contains(PropertyFlags::PROPERTY_STRUCT) {
        log::debug!("property {} is a struct, which cannot be decoded", name);
        return Property {
            name,
            flags,
            info: PropertyInfo::Value {
                in_type: TdhInType::InTypeNull,
                out_type: TdhOutType::OutTypeNull,
                length: PropertyLength::Length(0),
            },
        };
    }

    // Safety: the property is a non-struct type, these union members are the ones TDH filled
    let (in_type, out_type, length, count) = unsafe {
        (
            TdhInType::from_raw(property.Anonymous1.nonStructType.InType),
            TdhOutType::from_raw(property.Anonymous1.nonStructType.OutType),
            if flags.contains(PropertyFlags::PROPERTY_PARAM_LENGTH) {
                PropertyLength::Index(property.Anonymous3.lengthPropertyIndex)
            } else {
                PropertyLength::Length(property.Anonymous3.length)
            },
            if flags.contains(PropertyFlags::PROPERTY_PARAM_COUNT) {
                Some(PropertyCount::Index(property.Anonymous2.countPropertyIndex))
            } else if property.Anonymous2.count > 1
                || flags.contains(PropertyFlags::PROPERTY_PARAM_FIXED_COUNT)
            {
                Some(PropertyCount::Count(property.Anonymous2.count))
            } else {
                None
            },
        )
    };

    let info = match count {
        None => PropertyInfo::Value {
            in_type,
            out_type,
            length,
        },
        Some(count) => PropertyInfo::Array {
            in_type,
            out_type,
            length,
            count,
        },
    };
    Property { name, flags, info }
}

pub(crate) fn schema_from_tdh(record: &EventRecord) -> NativeResult<Schema> {
    let schema_not_found = || NativeError::SchemaNotFound {
        provider: record.provider_id(),
        event_id: record.event_id(),
    };
    let event = record.raw().ok_or_else(schema_not_found)?;

    let mut buffer_size = 0;
    let status = unsafe {
        Etw::TdhGetEventInformation(event, &[], std::ptr::null_mut(), &mut buffer_size)
    };
    if status != ERROR_INSUFFICIENT_BUFFER.0 {
        log::debug!("TdhGetEventInformation failed with {}", status);
        return Err(schema_not_found());
    }

    let mut buffer = TraceEventInfoRaw::alloc(buffer_size);
    let status = unsafe {
        Etw::TdhGetEventInformation(event, &[], buffer.info_as_ptr(), &mut buffer_size)
    };
    if status != 0 {
        return Err(NativeError::IoError(std::io::Error::from_raw_os_error(
            status as i32,
        )));
    }

    let info = buffer.info();
    let descriptor = &info.EventDescriptor;
    // Safety: EventNameOffset is the member of this union TDH fills for manifest and TraceLogging events
    let event_name_offset = unsafe { info.Anonymous1.EventNameOffset };
    let mut schema = Schema::new(info.ProviderGuid.into(), descriptor.Id)
        .with_version(descriptor.Version)
        .with_opcode(descriptor.Opcode)
        .with_level(descriptor.Level)
        .with_decoding_source(DecodingSource::from(info.DecodingSource.0 as u32))
        .with_provider_name(&buffer.string_at(info.ProviderNameOffset))
        .with_task_name(buffer.string_at(info.TaskNameOffset).trim())
        .with_opcode_name(buffer.string_at(info.OpcodeNameOffset).trim())
        .with_event_name(&buffer.string_at(event_name_offset));
    for property in buffer.properties() {
        schema = schema.with_property(convert_property(&buffer, property));
    }
    Ok(schema)
}

fn tdh_check(status: u32, context: &str) -> NativeResult<()> {
    match status {
        0 => Ok(()),
        status => {
            log::debug!("{} failed with {}", context, status);
            Err(NativeError::InvalidParameter(format!(
                "{}: {}",
                context,
                std::io::Error::from_raw_os_error(status as i32)
            )))
        }
    }
}

fn payload_operator(condition: &PayloadCondition) -> Etw::_PAYLOAD_OPERATOR {
    match (&condition.value, condition.op) {
        (FieldValue::String(_), CompareOp::Eq) => Etw::PAYLOADFIELD_IS,
        (FieldValue::String(_), CompareOp::Ne) => Etw::PAYLOADFIELD_ISNOT,
        (_, CompareOp::Contains) => Etw::PAYLOADFIELD_CONTAINS,
        (_, CompareOp::Ne) => Etw::PAYLOADFIELD_NE,
        (_, CompareOp::Lt) => Etw::PAYLOADFIELD_LT,
        (_, CompareOp::Le) => Etw::PAYLOADFIELD_LE,
        (_, CompareOp::Gt) => Etw::PAYLOADFIELD_GT,
        (_, CompareOp::Ge) => Etw::PAYLOADFIELD_GE,
        // Other operators are refused when the filter is built
        _ => Etw::PAYLOADFIELD_EQ,
    }
}

fn payload_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Unsigned(value) => value.to_string(),
        FieldValue::Signed(value) => value.to_string(),
        FieldValue::String(value) => value.clone(),
        FieldValue::Guid(value) => value.to_string(),
    }
}

/// The payload filters of a provider, aggregated by TDH into one `EVENT_FILTER_DESCRIPTOR`
pub(crate) struct PayloadFilterDescriptor {
    descriptor: Etw::EVENT_FILTER_DESCRIPTOR,
}

impl PayloadFilterDescriptor {
    pub(crate) fn try_new(provider: Guid, filters: &[PayloadFilter]) -> NativeResult<Self> {
        let provider = GUID::from(provider);
        let mut created: Vec<*mut c_void> = Vec::with_capacity(filters.len());
        let result = filters.iter().try_for_each(|filter| {
            let handle = create_payload_filter(&provider, filter)?;
            created.push(handle);
            Ok(())
        });

        let aggregated = result.and_then(|()| {
            let pointers: Vec<*const c_void> = created.iter().map(|ptr| *ptr as *const c_void).collect();
            // There is one filter per event, whose conditions are combined by the filter itself
            let match_all = vec![BOOLEAN(1); filters.len()];
            let mut descriptor = Etw::EVENT_FILTER_DESCRIPTOR::default();
            let status = unsafe {
                // Safety: every pointer was returned by TdhCreatePayloadFilter, `match_all` has one flag per filter
                Etw::TdhAggregatePayloadFilters(&pointers, Some(match_all.as_ptr()), &mut descriptor)
            };
            tdh_check(status, "TdhAggregatePayloadFilters").map(|()| descriptor)
        });

        // The aggregated descriptor holds its own copy
        for mut handle in created {
            unsafe {
                // Safety: created by TdhCreatePayloadFilter, and deleted only once
                Etw::TdhDeletePayloadFilter(&mut handle);
            }
        }
        Ok(PayloadFilterDescriptor {
            descriptor: aggregated?,
        })
    }

    /// Valid as long as `self` is
    pub(crate) fn as_event_filter_descriptor(&self) -> Etw::EVENT_FILTER_DESCRIPTOR {
        self.descriptor
    }
}

fn create_payload_filter(provider: &GUID, filter: &PayloadFilter) -> NativeResult<*mut c_void> {
    // The wide strings must outlive the call
    let mut strings = Vec::with_capacity(filter.conditions().len() * 2);
    for condition in filter.conditions() {
        let field = U16CString::from_str(&condition.field)
            .map_err(|_| NativeError::InvalidParameter(format!("field name {:?}", condition.field)))?;
        let value = U16CString::from_str(payload_value(&condition.value))
            .map_err(|_| NativeError::InvalidParameter(format!("value {:?}", condition.value)))?;
        strings.push((field, value, payload_operator(condition)));
    }
    let predicates: Vec<Etw::PAYLOAD_FILTER_PREDICATE> = strings
        .iter_mut()
        .map(|(field, value, op)| Etw::PAYLOAD_FILTER_PREDICATE {
            FieldName: PWSTR(field.as_mut_ptr()),
            CompareOp: op.0 as u16,
            Value: PWSTR(value.as_mut_ptr()),
        })
        .collect();

    let event = Etw::EVENT_DESCRIPTOR {
        Id: filter.event_id(),
        Version: filter.version(),
        ..Default::default()
    };
    let mut handle: *mut c_void = std::ptr::null_mut();
    let status = unsafe {
        // Safety: the predicates point into `strings`, which lives until the end of this function
        Etw::TdhCreatePayloadFilter(
            provider,
            &event,
            BOOLEAN(u8::from(filter.match_any())),
            &predicates,
            &mut handle,
        )
    };
    tdh_check(status, "TdhCreatePayloadFilter")?;
    Ok(handle)
}

impl Drop for PayloadFilterDescriptor {
    fn drop(&mut self) {
        unsafe {
            // Safety: the descriptor was filled by TdhAggregatePayloadFilters
            Etw::TdhCleanupPayloadEventFilterDescriptor(&mut self.descriptor);
        }
    }
}
