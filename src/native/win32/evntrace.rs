//! Native API - Event Tracing evntrace header
//!
//! The `evntrace` module is an abstraction layer for the Windows evntrace library. This module act as a
//! internal API that holds all `unsafe` calls to functions exported by the `evntrace` Windows library.
//!
//! This module shouldn't be accessed directly. [`Win32Etw`](super::Win32Etw) provides a safe API over it.
use std::alloc::Layout;
use std::ffi::c_void;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use widestring::{U16CStr, U16CString};
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    BOOLEAN, ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, ERROR_CTX_CLOSE_PENDING,
    ERROR_INVALID_PARAMETER, ERROR_SUCCESS, ERROR_WMI_INSTANCE_NOT_FOUND, WIN32_ERROR,
};
use windows::Win32::System::Diagnostics::Etw;

use crate::native::etw_types::{ControlValues, EventHeader, EventRecord, ExtendedDataItem, TRACE_NAME_MAX_CHARS};
use crate::native::guid::Guid;
use crate::native::{EnableParameters, NativeError, NativeResult, NativeStats, RecordSink};
use crate::provider::event_filter::{event_names_size, MatchMode};
use crate::provider::filter_set::DirectFilterSet;
use crate::trace::TraceProperties;

use super::tdh::PayloadFilterDescriptor;

pub(crate) const INVALID_TRACE_HANDLE: u64 = u64::MAX;

/// Maps a status code to our error type
pub(crate) fn check(status: u32, context: &str) -> NativeResult<()> {
    match WIN32_ERROR(status) {
        ERROR_SUCCESS => Ok(()),
        ERROR_ACCESS_DENIED => Err(NativeError::AccessDenied),
        ERROR_ALREADY_EXISTS => Err(NativeError::AlreadyExist(context.to_string())),
        ERROR_INVALID_PARAMETER => Err(NativeError::InvalidParameter(context.to_string())),
        ERROR_WMI_INSTANCE_NOT_FOUND => Err(NativeError::InvalidHandle),
        _ => Err(NativeError::IoError(std::io::Error::from_raw_os_error(
            status as i32,
        ))),
    }
}

/// Wrapper over an [EVENT_TRACE_PROPERTIES](https://docs.microsoft.com/en-us/windows/win32/api/evntrace/ns-evntrace-event_trace_properties), and its allocated companion members
///
/// The [EventTraceProperties] struct contains the information about a tracing session, this struct
/// also needs two buffers right after it to hold the log file name and the session name. This struct
/// provides the full definition of the properties plus the the allocation for both names
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct EventTraceProperties {
    etw_trace_properties: Etw::EVENT_TRACE_PROPERTIES,
    wide_trace_name: [u16; TRACE_NAME_MAX_CHARS + 1], // The +1 leaves space for the final null widechar.
    wide_log_file_name: [u16; TRACE_NAME_MAX_CHARS + 1], // Unused: sessions are real-time only
}

impl std::fmt::Debug for EventTraceProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTraceProperties")
            .field("name", &self.name())
            .finish()
    }
}

impl EventTraceProperties {
    /// Create a new instance
    ///
    /// # Notes
    /// `trace_name` is limited to [`TRACE_NAME_MAX_CHARS`] characters.
    pub(crate) fn new(trace_name: &str, trace_properties: &TraceProperties) -> Self {
        let mut etw_trace_properties = Etw::EVENT_TRACE_PROPERTIES::default();

        etw_trace_properties.Wnode.BufferSize = std::mem::size_of::<EventTraceProperties>() as u32;
        etw_trace_properties.Wnode.Flags = Etw::WNODE_FLAG_TRACED_GUID;
        etw_trace_properties.Wnode.ClientContext = 1; // QPC clock resolution
        etw_trace_properties.BufferSize = trace_properties.buffer_size;
        etw_trace_properties.MinimumBuffers = trace_properties.min_buffer;
        etw_trace_properties.MaximumBuffers = trace_properties.max_buffer;
        etw_trace_properties.FlushTimer = trace_properties.flush_timer;
        etw_trace_properties.LogFileMode = match trace_properties.log_file_mode {
            0 => crate::native::etw_types::default_logging_mode(),
            mode => mode,
        };

        // > If you do not want to log events to a log file (for example, if you specify EVENT_TRACE_REAL_TIME_MODE only), set LogFileNameOffset to 0.
        // (https://learn.microsoft.com/en-us/windows/win32/api/evntrace/ns-evntrace-event_trace_properties)
        etw_trace_properties.LoggerNameOffset =
            offset_of!(EventTraceProperties, wide_trace_name) as u32;

        // > You do not copy the session name to the offset. The StartTrace function copies the name for you.
        // We still do, ControlTrace reads it back.
        let mut s = Self {
            etw_trace_properties,
            wide_trace_name: [0u16; TRACE_NAME_MAX_CHARS + 1],
            wide_log_file_name: [0u16; TRACE_NAME_MAX_CHARS + 1],
        };
        let wide_name = U16CString::from_str_truncate(trace_name);
        let name_len = wide_name.len().min(TRACE_NAME_MAX_CHARS);
        s.wide_trace_name[..name_len].copy_from_slice(&wide_name.as_slice()[..name_len]);
        s
    }

    /// An instance that only carries the buffer settings, for `ControlTrace` calls
    pub(crate) fn for_control(trace_name: &str) -> Self {
        Self::new(trace_name, &TraceProperties::default())
    }

    /// Gets a pointer to the wrapped [Etw::EVENT_TRACE_PROPERTIES]
    ///
    /// # Safety
    ///
    /// The API enforces this points to an allocated, valid `EVENT_TRACE_PROPERTIES` instance.
    /// As evey other mutable raw pointer, you should not use it in case someone else is keeping a reference to this object.
    ///
    /// Note that `StartTraceW` and `ControlTraceW` **will** modify its content on output.
    pub(crate) unsafe fn as_mut_ptr(&mut self) -> *mut Etw::EVENT_TRACE_PROPERTIES {
        &mut self.etw_trace_properties as *mut Etw::EVENT_TRACE_PROPERTIES
    }

    pub(crate) fn trace_name_array(&self) -> &[u16] {
        &self.wide_trace_name
    }

    pub(crate) fn name(&self) -> String {
        U16CStr::from_slice_truncate(&self.wide_trace_name)
            .map(|name| name.to_string_lossy())
            .unwrap_or_default()
    }

    /// The counters the last `StartTrace`/`ControlTrace` call wrote back
    pub(crate) fn stats(&self) -> NativeStats {
        let p = &self.etw_trace_properties;
        NativeStats {
            buffer_size: p.BufferSize,
            min_buffers: p.MinimumBuffers,
            max_buffers: p.MaximumBuffers,
            flush_timer: p.FlushTimer,
            log_file_mode: p.LogFileMode,
            buffers_count: p.NumberOfBuffers,
            buffers_free: p.FreeBuffers,
            buffers_written: p.BuffersWritten,
            buffers_lost: p.LogBuffersLost.saturating_add(p.RealTimeBuffersLost),
            events_lost: p.EventsLost,
            logger_name: self.name(),
        }
    }
}

/// Start a real-time session
pub(crate) fn start_trace(properties: &mut EventTraceProperties) -> NativeResult<u64> {
    let mut handle: u64 = 0;
    let name = properties.trace_name_array().to_vec();
    let status = unsafe {
        // Safety:
        //  * first argument points to a valid and allocated address (this is an output and will be modified)
        //  * second argument is a valid, null terminated widestring (a copy, since the properties are mutated)
        //  * third argument is a valid, allocated EVENT_TRACE_PROPERTIES (and will be mutated)
        Etw::StartTraceW(
            &mut handle,
            PCWSTR::from_raw(name.as_ptr()),
            properties.as_mut_ptr(),
        )
    };
    check(status, &properties.name())?;
    if handle == 0 {
        // > The session handle is 0 if the handle is not valid.
        // (https://learn.microsoft.com/en-us/windows/win32/api/evntrace/nf-evntrace-starttracew)
        return Err(NativeError::InvalidHandle);
    }
    Ok(handle)
}

/// Query, update or stop a session
pub(crate) fn control_trace(
    handle: u64,
    properties: &mut EventTraceProperties,
    control: ControlValues,
) -> NativeResult<NativeStats> {
    let control_code = match control {
        ControlValues::Query => Etw::EVENT_TRACE_CONTROL_QUERY,
        ControlValues::Stop => Etw::EVENT_TRACE_CONTROL_STOP,
        ControlValues::Update => Etw::EVENT_TRACE_CONTROL_UPDATE,
        ControlValues::Flush => Etw::EVENT_TRACE_CONTROL_FLUSH,
    };
    let status = unsafe {
        // Safety:
        //  * the handle was returned by StartTraceW
        //  * depending on the control code, the `Properties` are mutated
        Etw::ControlTraceW(
            handle,
            PCWSTR::null(),
            properties.as_mut_ptr(),
            control_code,
        )
    };
    check(status, &properties.name())?;
    Ok(properties.stats())
}

/// Similar to windows' `EVENT_FILTER_DESCRIPTOR`, but with owned data
///
/// See [`Self::as_event_filter_descriptor`] to get a Windows-rs-compatible type
#[derive(Debug)]
pub(crate) struct EventFilterDescriptor {
    data: *mut u8,
    layout: Layout,
    ty: u32,
}

impl EventFilterDescriptor {
    /// Allocates a new instance, where the included data is `data_size` bytes, and is suitably aligned for type `T`
    fn try_new<T>(data_size: usize, ty: u32) -> NativeResult<Self> {
        if data_size == 0 || data_size > 1024 {
            // See https://docs.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_filter_descriptor
            return Err(NativeError::InvalidParameter(format!(
                "filter data of {} bytes",
                data_size
            )));
        }

        let layout = Layout::from_size_align(data_size, std::mem::align_of::<T>())
            .map_err(|err| NativeError::InvalidParameter(err.to_string()))?;
        let data = unsafe {
            // Safety: layout size is non-zero
            std::alloc::alloc_zeroed(layout)
        };
        if data.is_null() {
            return Err(NativeError::InvalidParameter("allocation failed".to_string()));
        }
        Ok(Self { data, layout, ty })
    }

    /// Build a new instance that keeps (or drops) the given event IDs
    pub(crate) fn try_new_by_event_ids(eids: &[u16], filter_in: bool) -> NativeResult<Self> {
        let data_size = std::mem::size_of::<Etw::EVENT_FILTER_EVENT_ID>()
            + (eids.len().saturating_sub(1)) * std::mem::size_of::<u16>();
        let s = Self::try_new::<Etw::EVENT_FILTER_EVENT_ID>(data_size, Etw::EVENT_FILTER_TYPE_EVENT_ID)?;

        // Fill the data with an `EVENT_FILTER_EVENT_ID` and its trailing array of ids
        let p = s.data.cast::<Etw::EVENT_FILTER_EVENT_ID>();
        let p_evt = unsafe {
            (*p).FilterIn = BOOLEAN(filter_in as u8);
            (*p).Reserved = 0;
            (*p).Count = eids.len() as u16; // at most 64 ids, checked when the filter was built
            std::ptr::addr_of_mut!((*p).Events).cast::<u16>()
        };
        for (index, event_id) in eids.iter().enumerate() {
            unsafe {
                // Safety: `index` is within the `Count` items the allocation was sized for
                p_evt.add(index).write(*event_id);
            }
        }
        Ok(s)
    }

    /// Build a new instance that keeps the events of the given processes
    pub(crate) fn try_new_by_process_ids(pids: &[u32]) -> NativeResult<Self> {
        let s = Self::try_new::<u32>(std::mem::size_of_val(pids), Etw::EVENT_FILTER_TYPE_PID)?;
        let p = s.data.cast::<u32>();
        for (index, pid) in pids.iter().enumerate() {
            unsafe {
                // Safety: the allocation holds exactly `pids.len()` items
                p.add(index).write(*pid);
            }
        }
        Ok(s)
    }

    /// Build a new instance that keeps (or drops) the events with the given names
    pub(crate) fn try_new_by_event_names(names: &BTreeSet<String>, filter_in: bool) -> NativeResult<Self> {
        let names_offset = offset_of!(Etw::EVENT_FILTER_EVENT_NAME, Names);
        let data_size = names_offset + event_names_size(names);
        let s = Self::try_new::<Etw::EVENT_FILTER_EVENT_NAME>(data_size, Etw::EVENT_FILTER_TYPE_EVENT_NAME)?;

        let p = s.data.cast::<Etw::EVENT_FILTER_EVENT_NAME>();
        unsafe {
            // Keywords and level are left to the enable call
            (*p).MatchAnyKeyword = 0;
            (*p).MatchAllKeyword = 0;
            (*p).Level = 0;
            (*p).FilterIn = BOOLEAN(filter_in as u8);
            (*p).NameCount = names.len() as u16;
        }

        // Then the names, each followed by a nul byte the allocation is already zeroed for
        let mut cursor = names_offset;
        for name in names {
            unsafe {
                // Safety: the allocation was sized for every name and its terminator
                std::ptr::copy_nonoverlapping(name.as_ptr(), s.data.add(cursor), name.len());
            }
            cursor += name.len() + 1;
        }
        Ok(s)
    }

    /// Build a new instance that keeps the events with any of the `mask` keywords
    pub(crate) fn try_new_by_system_flags(mask: u64) -> NativeResult<Self> {
        let s = Self::try_new::<u64>(std::mem::size_of::<u64>(), Etw::EVENT_FILTER_TYPE_SYSTEM_FLAGS)?;
        unsafe {
            // Safety: the allocation is sized and aligned for one u64
            s.data.cast::<u64>().write(mask);
        }
        Ok(s)
    }

    /// Returns the EVENT_FILTER_DESCRIPTOR from this [`EventFilterDescriptor`]
    ///
    /// # Safety
    ///
    /// This will often be fed to an unsafe Windows function (e.g. [EnableTraceEx2](https://docs.microsoft.com/en-us/windows/win32/api/evntrace/nf-evntrace-enabletraceex2)).
    /// Note that this contains pointers to the current `EventFilterDescriptor`, that must remain valid until the called function is done.
    pub(crate) fn as_event_filter_descriptor(&self) -> Etw::EVENT_FILTER_DESCRIPTOR {
        Etw::EVENT_FILTER_DESCRIPTOR {
            Ptr: self.data as u64,
            Size: self.layout.size() as u32,
            Type: self.ty,
        }
    }
}

impl Drop for EventFilterDescriptor {
    fn drop(&mut self) {
        unsafe {
            // Safety:
            // * ptr is a block of memory currently allocated via alloc::alloc
            // * layout is th one that was used to allocate that block of memory
            std::alloc::dealloc(self.data, self.layout);
        }
    }
}

/// The native descriptors of a merged filter set
pub(crate) struct CompiledFilters {
    pub(crate) descriptors: Vec<EventFilterDescriptor>,
    pub(crate) payload: Option<PayloadFilterDescriptor>,
    /// Keywords that must be added to `MatchAllKeyword`, an all-bits system flags filter has no descriptor
    pub(crate) extra_all: u64,
}

impl CompiledFilters {
    /// The descriptors as `EnableTraceEx2` expects them, valid as long as `self` is
    pub(crate) fn native(&self) -> Vec<Etw::EVENT_FILTER_DESCRIPTOR> {
        self.descriptors
            .iter()
            .map(|efd| efd.as_event_filter_descriptor())
            .chain(self.payload.as_ref().map(|payload| payload.as_event_filter_descriptor()))
            .collect()
    }
}

/// Compile a merged filter set into native descriptors
pub(crate) fn filter_descriptors(provider: Guid, filters: &DirectFilterSet) -> NativeResult<CompiledFilters> {
    let mut descriptors = Vec::with_capacity(filters.descriptor_count());
    let mut extra_all = 0;
    if let Some(set) = &filters.event_ids {
        let ids: Vec<u16> = set.ids.iter().copied().collect();
        descriptors.push(EventFilterDescriptor::try_new_by_event_ids(&ids, set.filter_in)?);
    }
    if let Some(pids) = &filters.process_ids {
        let pids: Vec<u32> = pids.iter().copied().collect();
        descriptors.push(EventFilterDescriptor::try_new_by_process_ids(&pids)?);
    }
    match filters.system_flags {
        Some((mask, MatchMode::Any)) => {
            descriptors.push(EventFilterDescriptor::try_new_by_system_flags(mask)?)
        }
        Some((mask, MatchMode::All)) => extra_all = mask,
        None => {}
    }
    if let Some(set) = &filters.event_names {
        descriptors.push(EventFilterDescriptor::try_new_by_event_names(&set.names, set.filter_in)?);
    }
    let payload = if filters.payloads.is_empty() {
        None
    } else {
        Some(PayloadFilterDescriptor::try_new(provider, &filters.payloads)?)
    };
    Ok(CompiledFilters {
        descriptors,
        payload,
        extra_all,
    })
}

/// Issue an `EnableTraceEx2` call
pub(crate) fn enable_trace(
    handle: u64,
    control_code: u32,
    params: &EnableParameters,
) -> NativeResult<()> {
    let compiled = filter_descriptors(params.guid, &params.filters)?;
    let mut native_descriptors = compiled.native();

    let guid = GUID::from(params.guid);
    let mut native = Etw::ENABLE_TRACE_PARAMETERS {
        Version: Etw::ENABLE_TRACE_PARAMETERS_VERSION_2,
        EnableProperty: params.trace_flags,
        ControlFlags: 0,
        SourceId: guid,
        EnableFilterDesc: std::ptr::null_mut(),
        FilterDescCount: native_descriptors.len() as u32,
    };
    if !native_descriptors.is_empty() {
        native.EnableFilterDesc = native_descriptors.as_mut_ptr();
    }

    let status = unsafe {
        // Safety: `native` and the descriptors it points to outlive the call
        Etw::EnableTraceEx2(
            handle,
            &guid,
            control_code,
            params.level,
            params.any,
            params.all | compiled.extra_all,
            0,
            &native,
        )
    };
    check(status, &params.guid.to_string())
}

/// Newtype wrapper over an [EVENT_TRACE_LOGFILEW]
///
/// It owns the wide strings its raw pointers refer to. The context pointer refers to the sink of the
/// consumer, which must outlive every `ProcessTrace` call on the handle.
///
/// [EVENT_TRACE_LOGFILEW]: https://microsoft.github.io/windows-docs-rs/doc/windows/Win32/System/Diagnostics/Etw/struct.EVENT_TRACE_LOGFILEW.html
pub(crate) struct EventTraceLogfile {
    native: Etw::EVENT_TRACE_LOGFILEW,
    wide_name: U16CString,
}

impl EventTraceLogfile {
    fn create(wide_name: U16CString, mode: u32, sink: *const Arc<dyn RecordSink>) -> Self {
        let mut native = Etw::EVENT_TRACE_LOGFILEW::default();
        native.Anonymous1.ProcessTraceMode = mode | Etw::PROCESS_TRACE_MODE_EVENT_RECORD;
        native.Anonymous2.EventRecordCallback = Some(trace_callback_thunk);
        native.Context = sink as *mut c_void; // That's kind-of fine because the user context is _not supposed_ to be changed by Windows APIs
        EventTraceLogfile {
            native,
            wide_name,
        }
    }

    /// Consume the real-time stream of a session
    pub(crate) fn live(session_name: &str, sink: *const Arc<dyn RecordSink>) -> Self {
        let mut s = Self::create(
            U16CString::from_str_truncate(session_name),
            Etw::PROCESS_TRACE_MODE_REAL_TIME,
            sink,
        );
        s.native.LoggerName = PWSTR(s.wide_name.as_ptr() as *mut u16);
        s
    }

    /// Consume an `.etl` file
    pub(crate) fn file(path: &Path, sink: *const Arc<dyn RecordSink>) -> Self {
        let mut s = Self::create(
            U16CString::from_os_str_truncate(path.as_os_str()),
            0,
            sink,
        );
        s.native.LogFileName = PWSTR(s.wide_name.as_ptr() as *mut u16);
        s
    }
}

/// Open a consumer. The logfile can be dropped once this returns.
pub(crate) fn open_trace(mut logfile: EventTraceLogfile) -> NativeResult<u64> {
    let handle = unsafe {
        // Safety: the logfile and its strings are valid for the duration of the call
        // > On success, OpenTrace will update the structure with information from the opened file or session.
        Etw::OpenTraceW(&mut logfile.native)
    };
    if handle == INVALID_TRACE_HANDLE {
        return Err(NativeError::IoError(std::io::Error::last_os_error()));
    }
    Ok(handle)
}

/// Blocks until the session stops, the file ends or the consumer is closed
pub(crate) fn process_trace(handle: u64) -> NativeResult<()> {
    let status = unsafe {
        // Safety: the handle was returned by OpenTraceW. No time window: consume everything
        Etw::ProcessTrace(&[handle], std::ptr::null(), std::ptr::null())
    };
    match status {
        // The consumer was closed while processing
        s if s == ERROR_CTX_CLOSE_PENDING.0 => Ok(()),
        s => check(s, "ProcessTrace"),
    }
}

pub(crate) fn close_trace(handle: u64) -> NativeResult<()> {
    let status = unsafe {
        // Safety: the handle was returned by OpenTraceW
        Etw::CloseTrace(handle)
    };
    match status {
        s if s == ERROR_CTX_CLOSE_PENDING.0 => Ok(()),
        s => check(s, "CloseTrace"),
    }
}

fn header_from_raw(raw: &Etw::EVENT_RECORD) -> EventHeader {
    let header = &raw.EventHeader;
    let descriptor = &header.EventDescriptor;
    EventHeader {
        provider_id: header.ProviderId.into(),
        activity_id: header.ActivityId.into(),
        timestamp: header.TimeStamp,
        keyword: descriptor.Keyword,
        process_id: header.ProcessId,
        thread_id: header.ThreadId,
        event_id: descriptor.Id,
        flags: header.Flags,
        version: descriptor.Version,
        channel: descriptor.Channel,
        level: descriptor.Level,
        opcode: descriptor.Opcode,
        task: descriptor.Task,
        event_property: header.EventProperty,
        reserved: 0,
    }
}

/// # Safety
///
/// `raw` must come straight from ETW, its pointers are trusted
unsafe fn extended_data_from_raw(raw: &Etw::EVENT_RECORD) -> Vec<ExtendedDataItem> {
    if raw.ExtendedData.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(raw.ExtendedData, raw.ExtendedDataCount as usize)
        .iter()
        .map(|item| {
            let data = if item.DataPtr == 0 {
                &[][..]
            } else {
                std::slice::from_raw_parts(item.DataPtr as *const u8, item.DataSize as usize)
            };
            ExtendedDataItem::from_raw(item.ExtType, data)
        })
        .collect()
}

unsafe extern "system" fn trace_callback_thunk(p_record: *mut Etw::EVENT_RECORD) {
    let raw = match p_record.as_ref() {
        Some(raw) => raw,
        None => return,
    };
    // Safety: the context is the sink given to `EventTraceLogfile`, kept alive by the consumer
    let sink = match (raw.UserContext as *const Arc<dyn RecordSink>).as_ref() {
        Some(sink) => sink,
        None => return,
    };

    let user_data = if raw.UserData.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(raw.UserData as *const u8, raw.UserDataLength as usize)
    };
    let extended_data = extended_data_from_raw(raw);
    let record = EventRecord::new(header_from_raw(raw), user_data, &extended_data).with_raw(raw);

    if catch_unwind(AssertUnwindSafe(|| sink.on_record(&record))).is_err() {
        log::error!(
            "dispatch panicked on event {} of {}",
            record.event_id(),
            record.provider_id()
        );
    }
}
