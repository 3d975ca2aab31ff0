//! Abstraction layer for the native tracing facility
//!
//! A trace session never talks to the OS directly: it drives an [`EtwBackend`], which owns the native
//! sessions and consumers and pushes raw records to a [`RecordSink`].
//!
//! Two backends are provided:
//! * [`replay::ReplayEtw`], a portable in-process facility fed by injected (or recorded) events,
//! * `win32::Win32Etw` (Windows only), over the real ETW APIs.
use std::path::PathBuf;
use std::sync::Arc;

pub mod etw_types;
pub mod guid;
pub mod recording;
pub mod replay;
pub mod sid;
pub mod tdh_types;
pub mod time;
#[cfg(windows)]
pub mod win32;

use crate::native::etw_types::EventRecord;
use crate::native::guid::Guid;
use crate::provider::filter_set::DirectFilterSet;
use crate::schema::Schema;
use crate::trace::TraceProperties;

/// Errors reported by the native layer
#[derive(Debug, thiserror::Error)]
pub enum NativeError {
    /// The handle does not designate a live session or consumer
    #[error("invalid handle")]
    InvalidHandle,
    /// A session with this name is already running
    #[error("a session named {0:?} already exists")]
    AlreadyExist(String),
    /// The name registry does not know this provider
    #[error("provider not found: {0}")]
    ProviderNotFound(String),
    /// No schema is available for this event
    #[error("no schema for event {event_id} of provider {provider}")]
    SchemaNotFound { provider: Guid, event_id: u16 },
    /// Insufficient privileges
    #[error("access denied")]
    AccessDenied,
    /// The session or consumer has been closed
    #[error("the session or consumer is closed")]
    Closed,
    /// The native layer rejected a parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A trace file could not be decoded
    #[error("corrupted trace source: {0}")]
    Corrupted(String),
    /// Represents an standard IO Error
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type NativeResult<T> = Result<T, NativeError>;

/// A native controller session (what `StartTrace` returns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn from_raw(raw: u64) -> Self {
        SessionHandle(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// A native consumer (what `OpenTrace` returns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(u64);

impl ConsumerHandle {
    pub fn from_raw(raw: u64) -> Self {
        ConsumerHandle(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Where a consumer reads its records from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceSource {
    /// The real-time stream of a named session
    Live(String),
    /// A recorded trace file
    File(PathBuf),
}

/// Everything the native layer needs to enable a provider on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableParameters {
    pub guid: Guid,
    pub level: u8,
    pub any: u64,
    pub all: u64,
    /// `EVENT_ENABLE_PROPERTY_*` bits, passed through unchanged
    pub trace_flags: u32,
    /// The merged direct filters of the provider
    pub filters: DirectFilterSet,
}

/// The point the native layer pushes records to
///
/// The native layer calls `on_record` sequentially, from the thread running
/// [`EtwBackend::process`]. The record must not be kept past the call.
pub trait RecordSink: Send + Sync {
    fn on_record(&self, record: &EventRecord);
}

/// Raw counters of a native session (what `ControlTrace(EVENT_TRACE_CONTROL_QUERY)` reports)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeStats {
    pub buffer_size: u32,
    pub min_buffers: u32,
    pub max_buffers: u32,
    pub flush_timer: u32,
    pub log_file_mode: u32,
    /// Buffers currently allocated
    pub buffers_count: u32,
    pub buffers_free: u32,
    pub buffers_written: u32,
    pub buffers_lost: u32,
    pub events_lost: u32,
    pub logger_name: String,
}

/// The native tracing facility
///
/// Controller calls (`start_session` ... `stop_session`) and consumer calls (`open_consumer` ...
/// `close_consumer`) may come from different threads. In particular `process` blocks the calling thread
/// while the other calls are issued concurrently by control threads.
pub trait EtwBackend: Send + Sync {
    /// Start a named session with the given buffer configuration
    fn start_session(&self, name: &str, properties: &TraceProperties)
        -> NativeResult<SessionHandle>;

    /// Enable (or re-enable with new parameters) a provider on a session
    ///
    /// The filter set replaces any set previously given for this provider.
    fn enable_provider(&self, session: SessionHandle, params: &EnableParameters) -> NativeResult<()>;

    fn disable_provider(&self, session: SessionHandle, guid: Guid) -> NativeResult<()>;

    /// Ask an enabled provider to emit its rundown events
    fn capture_state(&self, session: SessionHandle, params: &EnableParameters) -> NativeResult<()>;

    fn query_session(&self, session: SessionHandle) -> NativeResult<NativeStats>;

    /// Push new buffer/flush settings to a running session
    fn update_session(
        &self,
        session: SessionHandle,
        properties: &TraceProperties,
    ) -> NativeResult<NativeStats>;

    /// Stop a session. Its consumers drain what is buffered, then their `process` returns.
    fn stop_session(&self, session: SessionHandle) -> NativeResult<NativeStats>;

    fn open_consumer(
        &self,
        source: &TraceSource,
        sink: Arc<dyn RecordSink>,
    ) -> NativeResult<ConsumerHandle>;

    /// Pump records to the sink of `consumer`, blocking until the source ends or the consumer is closed
    fn process(&self, consumer: ConsumerHandle) -> NativeResult<()>;

    /// Release a consumer. A `process` call running on another thread returns after the record it
    /// is currently dispatching, if any.
    fn close_consumer(&self, consumer: ConsumerHandle) -> NativeResult<()>;

    /// Resolve a provider name into its GUID
    fn resolve_provider_name(&self, name: &str) -> NativeResult<Guid>;

    /// Look up the schema of an event
    fn event_schema(&self, record: &EventRecord) -> NativeResult<Schema>;
}
