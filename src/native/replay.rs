//! A portable, in-process tracing facility
//!
//! [`ReplayEtw`] behaves like the native ETW controller and consumer APIs, but its providers are the
//! caller: events are pushed with [`ReplayEtw::inject`] (or read from a [recording](super::recording))
//! and delivered to every session that enabled their provider, after the same level, keyword and
//! direct-filter checks the OS performs.
//!
//! It runs on every platform, which makes it the backend of choice to test sessions and handlers.
//!
//! ```
//! use std::sync::Arc;
//! use etwsession::native::replay::{PayloadBuilder, RawEvent, ReplayEtw};
//! use etwsession::provider::Provider;
//! use etwsession::trace::TraceSession;
//! use etwsession::Guid;
//!
//! const PROVIDER: Guid = Guid::from_u128(0x5770385f_c22a_43e0_bf4c_06f5698ffbd9);
//!
//! let backend = Arc::new(ReplayEtw::new());
//! let provider = Provider::by_guid(PROVIDER).add_callback(|record, _| println!("{:?}", record)).build().unwrap();
//! let (trace, handle) = TraceSession::builder(backend.clone())
//!     .enable(provider)
//!     .start_and_process()
//!     .unwrap();
//!
//! backend.inject(RawEvent::new(PROVIDER, 1).with_user_data(PayloadBuilder::new().u32(42).build()));
//! trace.stop().unwrap();
//! handle.join().unwrap().unwrap();
//! ```
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use zerocopy::AsBytes;

use crate::native::etw_types::{
    default_logging_mode, EventHeader, EventRecord, ExtendedDataItem,
    EVENT_HEADER_FLAG_EXTENDED_INFO,
};
use crate::native::guid::Guid;
use crate::native::recording::{Entry, RecordingReader};
use crate::native::sid::Sid;
use crate::native::{
    ConsumerHandle, EnableParameters, EtwBackend, NativeError, NativeResult, NativeStats,
    RecordSink, SessionHandle, TraceSource,
};
use crate::provider::TraceFlags;
use crate::schema::Schema;
use crate::trace::TraceProperties;
use crate::traits::EncodeUtf16;

const DEFAULT_BUFFER_SIZE: u32 = 64;
const DEFAULT_MIN_BUFFERS: u32 = 4;
const DEFAULT_MAX_BUFFERS: u32 = 32;
const DEFAULT_FLUSH_TIMER: u32 = 1;

/// An owned event, before it is handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub header: EventHeader,
    pub extended_data: Vec<ExtendedDataItem>,
    pub user_data: Vec<u8>,
}

impl RawEvent {
    /// An event with no payload, level, or keyword
    pub fn new(provider: Guid, event_id: u16) -> Self {
        Self::from_header(EventHeader::new(provider, event_id))
    }

    pub fn from_header(header: EventHeader) -> Self {
        RawEvent {
            header,
            extended_data: Vec::new(),
            user_data: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.header.level = level;
        self
    }

    pub fn with_keyword(mut self, keyword: u64) -> Self {
        self.header.keyword = keyword;
        self
    }

    pub fn with_opcode(mut self, opcode: u8) -> Self {
        self.header.opcode = opcode;
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.header.version = version;
        self
    }

    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.header.process_id = pid;
        self
    }

    pub fn with_thread_id(mut self, tid: u32) -> Self {
        self.header.thread_id = tid;
        self
    }

    /// In 100ns intervals since 1601-01-01
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    pub fn with_user_data(mut self, user_data: Vec<u8>) -> Self {
        self.user_data = user_data;
        self
    }

    /// Append an extended data item
    ///
    /// Sessions only deliver it if the provider was enabled with the matching [`TraceFlags`].
    pub fn with_extended_data(mut self, item: ExtendedDataItem) -> Self {
        self.extended_data.push(item);
        self.header.flags |= EVENT_HEADER_FLAG_EXTENDED_INFO;
        self
    }

    /// The view handlers receive
    pub fn record(&self) -> EventRecord<'_> {
        EventRecord::new(self.header, &self.user_data, &self.extended_data)
    }

    fn size(&self) -> usize {
        EventHeader::SIZE
            + self.user_data.len()
            + self
                .extended_data
                .iter()
                .map(|item| 4 + item.to_raw().len())
                .sum::<usize>()
    }
}

/// The trace flag a provider must be enabled with to receive an item, if any
fn required_flag(item: &ExtendedDataItem) -> Option<TraceFlags> {
    match item {
        ExtendedDataItem::Sid(_) => Some(TraceFlags::EVENT_ENABLE_PROPERTY_SID),
        ExtendedDataItem::TsId(_) => Some(TraceFlags::EVENT_ENABLE_PROPERTY_TS_ID),
        ExtendedDataItem::StackTrace32 { .. } | ExtendedDataItem::StackTrace64 { .. } => {
            Some(TraceFlags::EVENT_ENABLE_PROPERTY_STACK_TRACE)
        }
        ExtendedDataItem::EventKey(_) => Some(TraceFlags::EVENT_ENABLE_PROPERTY_EVENT_KEY),
        ExtendedDataItem::ProcessStartKey(_) => {
            Some(TraceFlags::EVENT_ENABLE_PROPERTY_PROCESS_START_KEY)
        }
        ExtendedDataItem::ContainerId(_) => {
            Some(TraceFlags::EVENT_ENABLE_PROPERTY_SOURCE_CONTAINER_TRACKING)
        }
        _ => None,
    }
}

/// Whether the level and keywords of `record` match what the provider was enabled with
fn passes_enable_masks(record: &EventRecord, params: &EnableParameters) -> bool {
    let level = record.level();
    if level != 0 && level > params.level {
        return false;
    }

    let keyword = record.keyword();
    if keyword == 0 {
        return params.trace_flags & TraceFlags::EVENT_ENABLE_PROPERTY_IGNORE_KEYWORD_0.bits() == 0;
    }
    (params.any == 0 || keyword & params.any != 0) && keyword & params.all == params.all
}

#[derive(Debug)]
struct ReplaySession {
    name: String,
    buffer_size: u32,
    min_buffers: u32,
    max_buffers: u32,
    flush_timer: u32,
    log_file_mode: u32,
    providers: HashMap<Guid, EnableParameters>,
    queue: VecDeque<RawEvent>,
    queued_bytes: usize,
    written_bytes: u64,
    events_lost: u32,
    stopped: bool,
}

impl ReplaySession {
    fn new(name: &str, properties: &TraceProperties) -> Self {
        let or_default = |value: u32, default: u32| if value == 0 { default } else { value };
        ReplaySession {
            name: name.to_string(),
            buffer_size: or_default(properties.buffer_size, DEFAULT_BUFFER_SIZE),
            min_buffers: or_default(properties.min_buffer, DEFAULT_MIN_BUFFERS),
            max_buffers: or_default(properties.max_buffer, DEFAULT_MAX_BUFFERS),
            flush_timer: or_default(properties.flush_timer, DEFAULT_FLUSH_TIMER),
            log_file_mode: or_default(properties.log_file_mode, default_logging_mode()),
            providers: HashMap::new(),
            queue: VecDeque::new(),
            queued_bytes: 0,
            written_bytes: 0,
            events_lost: 0,
            stopped: false,
        }
    }

    fn buffer_bytes(&self) -> usize {
        self.buffer_size as usize * 1024
    }

    fn capacity(&self) -> usize {
        self.buffer_bytes() * self.max_buffers as usize
    }

    /// Queue `event` if one of the enabled providers wants it
    ///
    /// `schemas` is what the native layer knows of events, to evaluate name and payload filters.
    fn offer(&mut self, event: &RawEvent, honor_direct_filters: bool, schemas: &SchemaMap) -> bool {
        let params = match self.providers.get(&event.header.provider_id) {
            Some(params) => params,
            None => return false,
        };
        let record = event.record();
        if !passes_enable_masks(&record, params) {
            return false;
        }
        if honor_direct_filters {
            let key = (record.provider_id(), record.event_id(), record.version());
            if !params.filters.accepts(&record, schemas.get(&key)) {
                return false;
            }
        }

        let flags = TraceFlags::from_bits_truncate(params.trace_flags);
        let mut delivered = event.clone();
        delivered
            .extended_data
            .retain(|item| required_flag(item).map_or(true, |flag| flags.contains(flag)));

        let size = delivered.size();
        if self.queued_bytes + size > self.capacity() {
            self.events_lost = self.events_lost.saturating_add(1);
            return false;
        }
        self.queued_bytes += size;
        self.written_bytes += size as u64;
        self.queue.push_back(delivered);
        true
    }

    fn pop(&mut self) -> Option<RawEvent> {
        let event = self.queue.pop_front()?;
        self.queued_bytes = self.queued_bytes.saturating_sub(event.size());
        Some(event)
    }

    fn stats(&self) -> NativeStats {
        let buffer_bytes = self.buffer_bytes().max(1);
        let in_use = ((self.queued_bytes + buffer_bytes - 1) / buffer_bytes) as u32;
        let buffers_count = in_use.max(self.min_buffers).min(self.max_buffers.max(self.min_buffers));
        NativeStats {
            buffer_size: self.buffer_size,
            min_buffers: self.min_buffers,
            max_buffers: self.max_buffers,
            flush_timer: self.flush_timer,
            log_file_mode: self.log_file_mode,
            buffers_count,
            buffers_free: buffers_count.saturating_sub(in_use),
            buffers_written: (self.written_bytes / buffer_bytes as u64) as u32,
            buffers_lost: 0,
            events_lost: self.events_lost,
            logger_name: self.name.clone(),
        }
    }
}

enum ConsumerSource {
    Live(u64),
    File(VecDeque<RawEvent>),
}

struct ReplayConsumer {
    sink: Arc<dyn RecordSink>,
    source: ConsumerSource,
    closed: bool,
    processing: bool,
}

type SchemaMap = HashMap<(Guid, u16, u8), Schema>;

#[derive(Default)]
struct ReplayState {
    next_handle: u64,
    sessions: HashMap<u64, ReplaySession>,
    consumers: HashMap<u64, ReplayConsumer>,
    /// Lowercase provider name to GUID
    names: HashMap<String, Guid>,
    schemas: SchemaMap,
    rundown: HashMap<Guid, Vec<RawEvent>>,
}

fn live_session_in(
    sessions: &mut HashMap<u64, ReplaySession>,
    session: SessionHandle,
) -> NativeResult<&mut ReplaySession> {
    match sessions.get_mut(&session.as_raw()) {
        Some(session) if !session.stopped => Ok(session),
        _ => Err(NativeError::InvalidHandle),
    }
}

impl ReplayState {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn live_session(&mut self, session: SessionHandle) -> NativeResult<&mut ReplaySession> {
        live_session_in(&mut self.sessions, session)
    }

    fn remove_consumer(&mut self, handle: u64) {
        if let Some(ReplayConsumer {
            source: ConsumerSource::Live(id),
            ..
        }) = self.consumers.remove(&handle)
        {
            self.release_if_drained(id);
        }
    }

    /// A stopped session is forgotten once no consumer reads it anymore
    fn release_if_drained(&mut self, session: u64) {
        let read = self
            .consumers
            .values()
            .any(|consumer| matches!(consumer.source, ConsumerSource::Live(id) if id == session));
        let stopped = self.sessions.get(&session).map_or(false, |s| s.stopped);
        if stopped && !read {
            self.sessions.remove(&session);
        }
    }
}

/// The in-process tracing facility
///
/// One instance plays the role of the OS: every session started on it sees the events injected into it.
pub struct ReplayEtw {
    state: Mutex<ReplayState>,
    wakeup: Condvar,
    apply_direct_filters: AtomicBool,
}

impl Default for ReplayEtw {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplayEtw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ReplayEtw")
            .field("sessions", &state.sessions.len())
            .field("consumers", &state.consumers.len())
            .field("apply_direct_filters", &self.apply_direct_filters)
            .finish()
    }
}

impl ReplayEtw {
    pub fn new() -> Self {
        ReplayEtw {
            state: Mutex::new(ReplayState::default()),
            wakeup: Condvar::new(),
            apply_direct_filters: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether direct filters are applied before events are queued
    ///
    /// Real ETW applies them on a best-effort basis. Turning this off lets every event that passes the
    /// level and keyword checks through, so that only the in-process evaluation of the filters remains.
    pub fn set_apply_direct_filters(&self, apply: bool) {
        self.apply_direct_filters.store(apply, Ordering::Relaxed);
    }

    /// Make a provider resolvable by name (names are case-insensitive)
    pub fn register_provider_name(&self, name: &str, guid: Guid) {
        self.lock().names.insert(name.to_lowercase(), guid);
    }

    /// Make the schema of an event available to decoders
    pub fn register_schema(&self, schema: Schema) {
        let key = (schema.provider_guid(), schema.event_id(), schema.event_version());
        self.lock().schemas.insert(key, schema);
    }

    /// The events a provider emits when asked for its state
    pub fn set_rundown_events(&self, provider: Guid, events: Vec<RawEvent>) {
        self.lock().rundown.insert(provider, events);
    }

    /// Emit an event, as its provider would
    ///
    /// Returns the number of sessions that queued it.
    pub fn inject(&self, event: RawEvent) -> usize {
        let honor_direct_filters = self.apply_direct_filters.load(Ordering::Relaxed);
        let mut state = self.lock();
        let ReplayState {
            sessions, schemas, ..
        } = &mut *state;
        let delivered = sessions
            .values_mut()
            .filter(|session| !session.stopped)
            .map(|session| session.offer(&event, honor_direct_filters, schemas))
            .filter(|queued| *queued)
            .count();
        drop(state);
        if delivered > 0 {
            self.wakeup.notify_all();
        }
        delivered
    }

    /// Emit every event, in order
    pub fn inject_all<I: IntoIterator<Item = RawEvent>>(&self, events: I) -> usize {
        events.into_iter().map(|event| self.inject(event)).sum()
    }

    /// Events queued on a live session and not consumed yet
    pub fn pending_events(&self, session: SessionHandle) -> usize {
        self.lock()
            .sessions
            .get(&session.as_raw())
            .map_or(0, |session| session.queue.len())
    }

    fn load_recording(&self, path: &std::path::Path) -> NativeResult<VecDeque<RawEvent>> {
        let mut events = VecDeque::new();
        let mut skipped = 0usize;
        for entry in RecordingReader::open(path)? {
            match entry {
                Ok(Entry::Provider { guid, name }) => self.register_provider_name(&name, guid),
                Ok(Entry::Schema(schema)) => self.register_schema(schema),
                Ok(Entry::Event(event)) => events.push_back(event),
                Err(NativeError::Corrupted(reason)) => {
                    log::warn!("skipping an entry of {}: {}", path.display(), reason);
                    skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        log::debug!(
            "loaded {} events from {} ({} entries skipped)",
            events.len(),
            path.display(),
            skipped
        );
        Ok(events)
    }
}

impl EtwBackend for ReplayEtw {
    fn start_session(
        &self,
        name: &str,
        properties: &TraceProperties,
    ) -> NativeResult<SessionHandle> {
        if name.is_empty() {
            return Err(NativeError::InvalidParameter("empty session name".to_string()));
        }
        let mut state = self.lock();
        let taken = state
            .sessions
            .values()
            .any(|session| !session.stopped && session.name.eq_ignore_ascii_case(name));
        if taken {
            return Err(NativeError::AlreadyExist(name.to_string()));
        }
        let session = ReplaySession::new(name, properties);
        if session.max_buffers < session.min_buffers {
            return Err(NativeError::InvalidParameter(format!(
                "max_buffer ({}) is lower than min_buffer ({})",
                session.max_buffers, session.min_buffers
            )));
        }
        let handle = state.allocate_handle();
        state.sessions.insert(handle, session);
        log::trace!("replay session {} started as {}", name, handle);
        Ok(SessionHandle::from_raw(handle))
    }

    fn enable_provider(&self, session: SessionHandle, params: &EnableParameters) -> NativeResult<()> {
        let mut state = self.lock();
        state
            .live_session(session)?
            .providers
            .insert(params.guid, params.clone());
        Ok(())
    }

    fn disable_provider(&self, session: SessionHandle, guid: Guid) -> NativeResult<()> {
        let mut state = self.lock();
        state.live_session(session)?.providers.remove(&guid);
        Ok(())
    }

    fn capture_state(&self, session: SessionHandle, params: &EnableParameters) -> NativeResult<()> {
        let honor_direct_filters = self.apply_direct_filters.load(Ordering::Relaxed);
        let mut state = self.lock();
        let ReplayState {
            sessions,
            schemas,
            rundown,
            ..
        } = &mut *state;
        let events = rundown.get(&params.guid).map(Vec::as_slice).unwrap_or_default();
        let session = live_session_in(sessions, session)?;
        if !session.providers.contains_key(&params.guid) {
            return Err(NativeError::InvalidParameter(format!(
                "provider {} is not enabled on this session",
                params.guid
            )));
        }
        for event in events {
            session.offer(event, honor_direct_filters, schemas);
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    fn query_session(&self, session: SessionHandle) -> NativeResult<NativeStats> {
        let mut state = self.lock();
        Ok(state.live_session(session)?.stats())
    }

    fn update_session(
        &self,
        session: SessionHandle,
        properties: &TraceProperties,
    ) -> NativeResult<NativeStats> {
        let mut state = self.lock();
        let session = state.live_session(session)?;
        let keep = |value: u32, current: u32| if value == 0 { current } else { value };
        let min_buffers = keep(properties.min_buffer, session.min_buffers);
        let max_buffers = keep(properties.max_buffer, session.max_buffers);
        if max_buffers < min_buffers {
            return Err(NativeError::InvalidParameter(format!(
                "max_buffer ({}) is lower than min_buffer ({})",
                max_buffers, min_buffers
            )));
        }
        // The buffer size of a running session cannot change
        session.min_buffers = min_buffers;
        session.max_buffers = max_buffers;
        session.flush_timer = keep(properties.flush_timer, session.flush_timer);
        session.log_file_mode = keep(properties.log_file_mode, session.log_file_mode);
        Ok(session.stats())
    }

    fn stop_session(&self, session: SessionHandle) -> NativeResult<NativeStats> {
        let mut state = self.lock();
        let replay_session = state.live_session(session)?;
        replay_session.stopped = true;
        let stats = replay_session.stats();
        state.release_if_drained(session.as_raw());
        drop(state);
        self.wakeup.notify_all();
        Ok(stats)
    }

    fn open_consumer(
        &self,
        source: &TraceSource,
        sink: Arc<dyn RecordSink>,
    ) -> NativeResult<ConsumerHandle> {
        let source = match source {
            TraceSource::Live(name) => {
                let state = self.lock();
                let id = state
                    .sessions
                    .iter()
                    .find(|(_, session)| !session.stopped && session.name.eq_ignore_ascii_case(name))
                    .map(|(id, _)| *id)
                    .ok_or_else(|| NativeError::InvalidParameter(format!("no session named {}", name)))?;
                ConsumerSource::Live(id)
            }
            TraceSource::File(path) => ConsumerSource::File(self.load_recording(path)?),
        };

        let mut state = self.lock();
        let handle = state.allocate_handle();
        state.consumers.insert(
            handle,
            ReplayConsumer {
                sink,
                source,
                closed: false,
                processing: false,
            },
        );
        Ok(ConsumerHandle::from_raw(handle))
    }

    fn process(&self, consumer: ConsumerHandle) -> NativeResult<()> {
        let handle = consumer.as_raw();
        let sink = {
            let mut state = self.lock();
            let consumer = state
                .consumers
                .get_mut(&handle)
                .ok_or(NativeError::InvalidHandle)?;
            if consumer.closed {
                return Err(NativeError::Closed);
            }
            if consumer.processing {
                return Err(NativeError::InvalidParameter(
                    "the consumer is already being processed".to_string(),
                ));
            }
            consumer.processing = true;
            Arc::clone(&consumer.sink)
        };

        loop {
            let event = {
                let mut state = self.lock();
                loop {
                    let state_ref = &mut *state;
                    let source = match state_ref.consumers.get_mut(&handle) {
                        Some(consumer) if !consumer.closed => &mut consumer.source,
                        _ => break None,
                    };
                    let id = match source {
                        ConsumerSource::File(events) => break events.pop_front(),
                        ConsumerSource::Live(id) => *id,
                    };
                    match state_ref.sessions.get_mut(&id) {
                        Some(session) => match session.pop() {
                            Some(event) => break Some(event),
                            None if session.stopped => break None,
                            None => {}
                        },
                        None => break None,
                    }
                    state = self
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            match event {
                // Dispatch outside of the lock, handlers may call back into the facility
                Some(event) => sink.on_record(&event.record()),
                None => break,
            }
        }

        // The consumer stays around until it is closed
        let mut state = self.lock();
        let closed = match state.consumers.get_mut(&handle) {
            Some(consumer) => {
                consumer.processing = false;
                consumer.closed
            }
            None => false,
        };
        if closed {
            state.remove_consumer(handle);
        }
        Ok(())
    }

    fn close_consumer(&self, consumer: ConsumerHandle) -> NativeResult<()> {
        let mut state = self.lock();
        let handle = consumer.as_raw();
        let entry = state
            .consumers
            .get_mut(&handle)
            .ok_or(NativeError::InvalidHandle)?;
        if entry.closed {
            return Err(NativeError::Closed);
        }
        entry.closed = true;
        // A processing thread removes it on its way out
        if !entry.processing {
            state.remove_consumer(handle);
        }
        drop(state);
        self.wakeup.notify_all();
        Ok(())
    }

    fn resolve_provider_name(&self, name: &str) -> NativeResult<Guid> {
        self.lock()
            .names
            .get(&name.to_lowercase())
            .copied()
            .ok_or_else(|| NativeError::ProviderNotFound(name.to_string()))
    }

    fn event_schema(&self, record: &EventRecord) -> NativeResult<Schema> {
        self.lock()
            .schemas
            .get(&(record.provider_id(), record.event_id(), record.version()))
            .cloned()
            .ok_or(NativeError::SchemaNotFound {
                provider: record.provider_id(),
                event_id: record.event_id(),
            })
    }
}

/// Builds event payloads the way providers lay them out: packed, in native byte order
#[derive(Debug, Clone, Default)]
pub struct PayloadBuilder {
    data: Vec<u8>,
}

macro_rules! push_primitive {
    ($($name:ident: $T:ty),* $(,)?) => {
        $(
            pub fn $name(mut self, value: $T) -> Self {
                self.data.extend_from_slice(&value.to_ne_bytes());
                self
            }
        )*
    };
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    push_primitive!(
        u8: u8,
        u16: u16,
        u32: u32,
        u64: u64,
        i8: i8,
        i16: i16,
        i32: i32,
        i64: i64,
        f32: f32,
        f64: f64,
    );

    /// A 4-byte `BOOL`
    pub fn bool(self, value: bool) -> Self {
        self.u32(value as u32)
    }

    /// A NUL-terminated UTF-16 string
    pub fn utf16z(mut self, value: &str) -> Self {
        for unit in value.into_utf16() {
            self.data.extend_from_slice(&unit.to_ne_bytes());
        }
        self
    }

    /// A NUL-terminated ANSI string
    pub fn ansiz(mut self, value: &str) -> Self {
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self
    }

    /// A 16-bit byte count followed by UTF-16 characters, without terminator
    pub fn counted_utf16(mut self, value: &str) -> Self {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.data
            .extend_from_slice(&((units.len() * 2) as u16).to_ne_bytes());
        for unit in units {
            self.data.extend_from_slice(&unit.to_ne_bytes());
        }
        self
    }

    pub fn guid(mut self, value: Guid) -> Self {
        self.data.extend_from_slice(value.as_bytes());
        self
    }

    pub fn sid(mut self, value: &Sid) -> Self {
        self.data.extend_from_slice(&value.to_bytes());
        self
    }

    pub fn bytes(mut self, value: &[u8]) -> Self {
        self.data.extend_from_slice(value);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::filter_set::FilterChain;
    use crate::provider::EventFilter;
    use std::sync::atomic::AtomicUsize;

    const PROVIDER: Guid = Guid::from_u128(0x5770385f_c22a_43e0_bf4c_06f5698ffbd9);

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<(u16, usize)>>,
        calls: AtomicUsize,
    }

    impl RecordSink for Collect {
        fn on_record(&self, record: &EventRecord) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.events
                .lock()
                .unwrap()
                .push((record.event_id(), record.extended_data().len()));
        }
    }

    fn params(filters: FilterChain) -> EnableParameters {
        EnableParameters {
            guid: PROVIDER,
            level: 4,
            any: 0b0110,
            all: 0,
            trace_flags: TraceFlags::EVENT_ENABLE_PROPERTY_TS_ID.bits(),
            filters: filters.direct_set().unwrap(),
        }
    }

    fn started(backend: &ReplayEtw, name: &str, filters: FilterChain) -> SessionHandle {
        let session = backend
            .start_session(name, &TraceProperties::default())
            .unwrap();
        backend.enable_provider(session, &params(filters)).unwrap();
        session
    }

    #[test]
    fn test_level_and_keywords() {
        let backend = ReplayEtw::new();
        let session = started(&backend, "levels", FilterChain::new());

        assert_eq!(backend.inject(RawEvent::new(PROVIDER, 1).with_level(4)), 1);
        assert_eq!(backend.inject(RawEvent::new(PROVIDER, 2).with_level(5)), 0);
        assert_eq!(backend.inject(RawEvent::new(PROVIDER, 3).with_keyword(0b0100)), 1);
        assert_eq!(backend.inject(RawEvent::new(PROVIDER, 4).with_keyword(0b1000)), 0);
        assert_eq!(backend.inject(RawEvent::new(Guid::from_u128(1), 5)), 0);
        assert_eq!(backend.pending_events(session), 2);
    }

    #[test]
    fn test_direct_filters_can_be_bypassed() {
        let backend = ReplayEtw::new();
        let filters = FilterChain::new().with(EventFilter::event_ids([1])).unwrap();
        let session = started(&backend, "filters", filters);

        backend.inject(RawEvent::new(PROVIDER, 1));
        backend.inject(RawEvent::new(PROVIDER, 2));
        assert_eq!(backend.pending_events(session), 1);

        backend.set_apply_direct_filters(false);
        backend.inject(RawEvent::new(PROVIDER, 2));
        assert_eq!(backend.pending_events(session), 2);
    }

    #[test]
    fn test_extended_data_needs_its_flag() {
        let backend = ReplayEtw::new();
        let session = started(&backend, "extended", FilterChain::new());
        let sink = Arc::new(Collect::default());
        let consumer = backend
            .open_consumer(&TraceSource::Live("extended".into()), sink.clone())
            .unwrap();

        backend.inject(
            RawEvent::new(PROVIDER, 1)
                .with_extended_data(ExtendedDataItem::TsId(1))
                .with_extended_data(ExtendedDataItem::EventKey(2))
                .with_extended_data(ExtendedDataItem::RelatedActivityId(Guid::from_u128(3))),
        );
        backend.stop_session(session).unwrap();
        backend.process(consumer).unwrap();

        // TS id (enabled) and the related activity (always delivered) remain
        assert_eq!(*sink.events.lock().unwrap(), vec![(1, 2)]);
    }

    #[test]
    fn test_stop_drains_the_queue() {
        let backend = Arc::new(ReplayEtw::new());
        let session = started(&backend, "drain", FilterChain::new());
        let sink = Arc::new(Collect::default());
        let consumer = backend
            .open_consumer(&TraceSource::Live("drain".into()), sink.clone())
            .unwrap();

        let worker = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || backend.process(consumer))
        };
        backend.inject_all((0..10).map(|id| RawEvent::new(PROVIDER, id)));
        backend.stop_session(session).unwrap();
        worker.join().unwrap().unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 10);
        assert!(matches!(
            backend.query_session(session),
            Err(NativeError::InvalidHandle)
        ));
    }

    #[test]
    fn test_close_unblocks_process() {
        let backend = Arc::new(ReplayEtw::new());
        started(&backend, "close", FilterChain::new());
        let consumer = backend
            .open_consumer(&TraceSource::Live("close".into()), Arc::new(Collect::default()))
            .unwrap();

        let worker = {
            let backend = Arc::clone(&backend);
            std::thread::spawn(move || backend.process(consumer))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        backend.close_consumer(consumer).unwrap();
        worker.join().unwrap().unwrap();
    }

    #[test]
    fn test_session_names() {
        let backend = ReplayEtw::new();
        let session = started(&backend, "Unique", FilterChain::new());
        assert!(matches!(
            backend.start_session("unique", &TraceProperties::default()),
            Err(NativeError::AlreadyExist(_))
        ));
        assert!(matches!(
            backend.start_session("", &TraceProperties::default()),
            Err(NativeError::InvalidParameter(_))
        ));

        backend.stop_session(session).unwrap();
        assert!(backend
            .start_session("Unique", &TraceProperties::default())
            .is_ok());
    }

    #[test]
    fn test_update_keeps_unset_values() {
        let backend = ReplayEtw::new();
        let session = started(&backend, "update", FilterChain::new());
        let props = TraceProperties {
            max_buffer: 64,
            flush_timer: 5,
            ..Default::default()
        };
        let stats = backend.update_session(session, &props).unwrap();
        assert_eq!(stats.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(stats.min_buffers, DEFAULT_MIN_BUFFERS);
        assert_eq!(stats.max_buffers, 64);
        assert_eq!(stats.flush_timer, 5);
        assert_eq!(stats.logger_name, "update");

        let invalid = TraceProperties {
            min_buffer: 100,
            ..Default::default()
        };
        assert!(matches!(
            backend.update_session(session, &invalid),
            Err(NativeError::InvalidParameter(_))
        ));
        assert_eq!(backend.query_session(session).unwrap().min_buffers, DEFAULT_MIN_BUFFERS);
    }

    #[test]
    fn test_overflow_loses_events() {
        let backend = ReplayEtw::new();
        let props = TraceProperties {
            buffer_size: 1,
            min_buffer: 1,
            max_buffer: 1,
            ..Default::default()
        };
        let session = backend.start_session("tiny", &props).unwrap();
        backend
            .enable_provider(session, &params(FilterChain::new()))
            .unwrap();

        let payload = vec![0u8; 400];
        let queued = backend.inject_all(
            (0..5).map(|id| RawEvent::new(PROVIDER, id).with_user_data(payload.clone())),
        );
        assert_eq!(queued, 2);
        assert_eq!(backend.query_session(session).unwrap().events_lost, 3);
    }

    #[test]
    fn test_rundown() {
        let backend = ReplayEtw::new();
        let session = started(&backend, "rundown", FilterChain::new());
        backend.set_rundown_events(
            PROVIDER,
            vec![RawEvent::new(PROVIDER, 100), RawEvent::new(PROVIDER, 101)],
        );
        backend
            .capture_state(session, &params(FilterChain::new()))
            .unwrap();
        assert_eq!(backend.pending_events(session), 2);
    }

    #[test]
    fn test_payload_builder() {
        let payload = PayloadBuilder::new()
            .u16(1)
            .utf16z("ab")
            .ansiz("c")
            .counted_utf16("d")
            .bool(true)
            .build();
        assert_eq!(payload.len(), 2 + 6 + 2 + 4 + 4);
        assert_eq!(&payload[10..12], &2u16.to_ne_bytes());
    }
}
