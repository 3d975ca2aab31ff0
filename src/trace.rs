//! ETW Tracing/Session abstraction
//!
//! A [`TraceSession`] owns a native session (for live traces) and the consumer that pumps its records,
//! and routes every record to the [`Provider`] it comes from.
//!
//! ```text
//! Created --enable--> Enabled --open--> Opened --process--> Processing
//!                                          \                    |
//!                                           +--stop/close--> Stopped / Closed
//! ```
//!
//! [`TraceSession::start`] opens then processes on the calling thread. To keep control of the session while
//! it runs (statistics, live updates, enabling and disabling providers), open it and process it from another
//! thread, e.g. with [`TraceSession::start_in_thread`]. Every operation takes `&self`, so the session can be
//! shared between these threads behind an [`Arc`].
//!
//! Handlers run one at a time, on the processing thread. There is no timeout on a handler: a slow one
//! delays every following record of the session.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::native::etw_types::TRACE_NAME_MAX_CHARS;
use crate::native::time::FileTime;
use crate::native::{
    ConsumerHandle, EtwBackend, NativeError, NativeStats, RecordSink, SessionHandle, TraceSource,
};
use crate::provider::{ConfigurationError, EtwCallback, EventFilter, Provider, ProviderIdentity};
use crate::schema_locator::SchemaLocator;
use crate::utils;

pub mod callback_data;
use callback_data::{provider_matches, CallbackData};

pub use crate::native::etw_types::LoggingMode;

/// Trace module errors
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The native layer refused to enable a provider, or could not resolve its name
    #[error("unable to enable provider {provider}: {source}")]
    Enable {
        provider: ProviderIdentity,
        #[source]
        source: NativeError,
    },
    /// Live updates need a running session
    #[error("a session cannot be updated in state {0:?}")]
    Update(TraceState),
    #[error("cannot {operation} a session in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TraceState,
    },
    /// A live session needs at least one provider to be opened
    #[error("a live session needs at least one provider")]
    NoProviders,
    #[error("no provider {0} on this session")]
    UnknownProvider(ProviderIdentity),
    #[error("the processing window ends ({end:?}) before it starts ({start:?})")]
    InvalidTimeWindow { start: FileTime, end: FileTime },
    #[error(transparent)]
    Native(#[from] NativeError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

type TraceResult<T> = Result<T, TraceError>;

/// Lifecycle of a [`TraceSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceState {
    /// No provider yet
    Created,
    /// At least one provider, nothing native yet
    Enabled,
    /// The native session runs and a consumer is attached, records are not pumped yet
    Opened,
    /// A thread is pumping records
    Processing,
    /// The native session is stopped; the session can only be closed
    Stopped,
    /// Terminal
    Closed,
}

/// Trace Properties struct
///
/// Keeps the ETW session configuration settings. Zero values let the native layer pick its defaults.
///
/// [More info](https://docs.microsoft.com/en-us/message-analyzer/specifying-advanced-etw-session-configuration-settings#configuring-the-etw-session)
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceProperties {
    /// Represents the ETW Session in KB
    pub buffer_size: u32,
    /// Represents the ETW Session minimum number of buffers to use
    pub min_buffer: u32,
    /// Represents the ETW Session maximum number of buffers in the buffer pool
    pub max_buffer: u32,
    /// Represents the ETW Session flush interval in seconds
    pub flush_timer: u32,
    /// Represents the ETW Session [Logging Mode](https://docs.microsoft.com/en-us/windows/win32/etw/logging-mode-constants)
    pub log_file_mode: u32,
}

impl TraceProperties {
    /// These properties, with the non-zero fields of `update` applied
    ///
    /// A zero field in an update keeps the current value.
    pub fn updated_with(&self, update: &TraceProperties) -> TraceProperties {
        let keep = |value: u32, current: u32| if value == 0 { current } else { value };
        TraceProperties {
            buffer_size: keep(update.buffer_size, self.buffer_size),
            min_buffer: keep(update.min_buffer, self.min_buffer),
            max_buffer: keep(update.max_buffer, self.max_buffer),
            flush_timer: keep(update.flush_timer, self.flush_timer),
            log_file_mode: keep(update.log_file_mode, self.log_file_mode),
        }
    }
}

/// A snapshot of the counters of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TraceStatistics {
    /// Size of the buffers, in KB
    pub buffer_size: u32,
    pub min_buffers: u32,
    pub max_buffers: u32,
    /// Flush interval, in seconds
    pub flush_timer: u32,
    pub log_file_mode: u32,
    /// Buffers currently allocated
    pub buffers_count: u32,
    pub buffers_free: u32,
    pub buffers_written: u32,
    pub buffers_lost: u32,
    /// Events the native layer had to drop
    pub events_lost: u32,
    /// Events received by this session
    pub events_total: u64,
    /// Events that went through the filters of their provider
    pub events_handled: u64,
    pub logger_name: String,
}

impl TraceStatistics {
    fn new(native: NativeStats, callback_data: &CallbackData) -> Self {
        TraceStatistics {
            buffer_size: native.buffer_size,
            min_buffers: native.min_buffers,
            max_buffers: native.max_buffers,
            flush_timer: native.flush_timer,
            log_file_mode: native.log_file_mode,
            buffers_count: native.buffers_count,
            buffers_free: native.buffers_free,
            buffers_written: native.buffers_written,
            buffers_lost: native.buffers_lost,
            events_lost: native.events_lost,
            events_total: callback_data.events_total(),
            events_handled: callback_data.events_handled(),
            logger_name: native.logger_name,
        }
    }
}

/// Native resources of a session, released exactly once
#[derive(Debug)]
struct SessionInner {
    state: TraceState,
    session: Option<SessionHandle>,
    consumer: Option<ConsumerHandle>,
    properties: TraceProperties,
}

/// A trace session, live or reading a recorded trace
pub struct TraceSession {
    backend: Arc<dyn EtwBackend>,
    source: TraceSource,
    /// Serializes every control operation, including provider set mutations
    inner: Mutex<SessionInner>,
    callback_data: Arc<CallbackData>,
}

/// A Builder for a [`TraceSession`]
pub struct TraceBuilder {
    backend: Arc<dyn EtwBackend>,
    name: Option<String>,
    file: Option<PathBuf>,
    properties: TraceProperties,
    default_callback: Option<EtwCallback>,
    providers: Vec<Provider>,
}

impl std::fmt::Debug for TraceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBuilder")
            .field("name", &self.name)
            .field("file", &self.file)
            .field("properties", &self.properties)
            .field("default_callback", &self.default_callback.is_some())
            .field("providers", &self.providers)
            .finish()
    }
}

impl TraceBuilder {
    /// Define the trace name
    ///
    /// For live traces, this is the name of the native session. Without a name, a random one is
    /// generated. Names are truncated to [`TRACE_NAME_MAX_CHARS`] characters.
    pub fn named(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    /// Read a recorded trace instead of live events
    pub fn from_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn properties(mut self, props: TraceProperties) -> Self {
        self.properties = props;
        self
    }

    /// Set the callback that receives the events of providers that are not enabled on this session
    ///
    /// This is mostly useful for recorded traces, which embed events of many providers.
    pub fn default_callback<T>(mut self, callback: T) -> Self
    where
        T: FnMut(&crate::EventRecord, &SchemaLocator) + Send + Sync + 'static,
    {
        self.default_callback = Some(Box::new(callback));
        self
    }

    pub fn enable(mut self, provider: Provider) -> Self {
        self.providers.push(provider);
        self
    }

    /// Create the session and enable its providers, without starting anything native yet
    pub fn build(self) -> TraceResult<TraceSession> {
        let source = match self.file {
            Some(path) => TraceSource::File(path),
            None => {
                let name = match self.name {
                    Some(name) if !name.is_empty() => name,
                    _ => utils::generated_session_name(),
                };
                TraceSource::Live(utils::truncate_chars(&name, TRACE_NAME_MAX_CHARS))
            }
        };

        let locator = SchemaLocator::new(Arc::clone(&self.backend));
        let session = TraceSession {
            backend: self.backend,
            source,
            inner: Mutex::new(SessionInner {
                state: TraceState::Created,
                session: None,
                consumer: None,
                properties: self.properties,
            }),
            callback_data: Arc::new(CallbackData::new(locator, self.default_callback)),
        };

        for provider in self.providers {
            session.enable(provider)?;
        }
        Ok(session)
    }

    /// Build, open and start processing the session on a new thread
    pub fn start_and_process(
        self,
    ) -> TraceResult<(Arc<TraceSession>, JoinHandle<TraceResult<()>>)> {
        let session = Arc::new(self.build()?);
        let handle = session.start_in_thread()?;
        Ok((session, handle))
    }
}

impl TraceSession {
    pub fn builder(backend: Arc<dyn EtwBackend>) -> TraceBuilder {
        TraceBuilder {
            backend,
            name: None,
            file: None,
            properties: TraceProperties::default(),
            default_callback: None,
            providers: Vec::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The name of the native session, `None` for recorded traces
    pub fn name(&self) -> Option<&str> {
        match &self.source {
            TraceSource::Live(name) => Some(name),
            TraceSource::File(_) => None,
        }
    }

    pub fn source(&self) -> &TraceSource {
        &self.source
    }

    pub fn state(&self) -> TraceState {
        self.lock().state
    }

    pub fn properties(&self) -> TraceProperties {
        self.lock().properties
    }

    pub fn schema_locator(&self) -> &SchemaLocator {
        self.callback_data.schema_locator()
    }

    /// How many events have been handled so far
    pub fn events_handled(&self) -> u64 {
        self.callback_data.events_handled()
    }

    pub fn providers(&self) -> Vec<ProviderIdentity> {
        self.callback_data
            .providers()
            .iter()
            .map(|provider| provider.identity().clone())
            .collect()
    }

    fn resolve(&self, provider: &Provider) -> TraceResult<crate::native::guid::Guid> {
        provider
            .resolve_guid(self.backend.as_ref())
            .map_err(|source| TraceError::Enable {
                provider: provider.identity().clone(),
                source,
            })
    }

    /// Push a provider's configuration to the native session
    fn enable_native(&self, session: SessionHandle, provider: &Provider) -> TraceResult<()> {
        let guid = self.resolve(provider)?;
        let params = provider.enable_parameters(guid)?;
        let enable_error = |source| TraceError::Enable {
            provider: provider.identity().clone(),
            source,
        };
        self.backend
            .enable_provider(session, &params)
            .map_err(enable_error)?;
        if provider.rundown_enabled() {
            self.backend
                .capture_state(session, &params)
                .map_err(enable_error)?;
        }
        Ok(())
    }

    /// Attach a provider to this session
    ///
    /// On a running session, its events are dispatched from the next record onward.
    pub fn enable(&self, provider: Provider) -> TraceResult<()> {
        let mut inner = self.lock();
        match inner.state {
            TraceState::Stopped | TraceState::Closed => {
                return Err(TraceError::InvalidState {
                    operation: "enable a provider on",
                    state: inner.state,
                })
            }
            _ => {}
        }

        // Names in recorded traces are only known once the file is opened
        let deferred = matches!(self.source, TraceSource::File(_)) && inner.consumer.is_none();
        let guid = if deferred {
            provider.guid()
        } else {
            Some(self.resolve(&provider)?)
        };

        let duplicate = self.callback_data.providers().iter().any(|attached| {
            provider_matches(attached, provider.identity())
                || (guid.is_some() && attached.guid() == guid)
        });
        if duplicate {
            return Err(ConfigurationError::DuplicateProvider(provider.identity().to_string()).into());
        }

        if let Some(session) = inner.session {
            self.enable_native(session, &provider)?;
        }

        log::debug!("enabling provider {} on {:?}", provider.identity(), self.source);
        self.callback_data
            .update_providers(|providers| providers.push(Arc::new(provider)));
        if inner.state == TraceState::Created {
            inner.state = TraceState::Enabled;
        }
        Ok(())
    }

    /// Detach a provider from this session
    ///
    /// Once this returns, no further record is dispatched to it (a record it is currently handling
    /// completes). The provider is returned with its filters and handlers, ready to be enabled again.
    pub fn disable(&self, identity: &ProviderIdentity) -> TraceResult<Provider> {
        let inner = self.lock();
        let provider = self
            .callback_data
            .find_provider(identity)
            .ok_or_else(|| TraceError::UnknownProvider(identity.clone()))?;

        if let (Some(session), Some(guid)) = (inner.session, provider.guid()) {
            self.backend.disable_provider(session, guid)?;
        }

        log::debug!("disabling provider {} on {:?}", identity, self.source);
        self.callback_data.update_providers(|providers| {
            providers.retain(|attached| !Arc::ptr_eq(attached, &provider))
        });
        Ok(provider.detached())
    }

    /// Add a filter to an enabled provider
    ///
    /// The filter applies from the next dispatched record onward. When the direct filters of the provider
    /// change, the native layer receives the whole merged set again.
    pub fn add_filter(&self, identity: &ProviderIdentity, filter: EventFilter) -> TraceResult<()> {
        let inner = self.lock();
        let provider = self
            .callback_data
            .find_provider(identity)
            .ok_or_else(|| TraceError::UnknownProvider(identity.clone()))?;

        let direct = filter.is_direct();
        let filters = provider.filters().with(filter)?;
        let updated = Arc::new(provider.with_filters(filters));

        if let (true, Some(session)) = (direct, inner.session) {
            self.enable_native(session, &updated)?;
        }

        self.callback_data.update_providers(|providers| {
            for attached in providers.iter_mut() {
                if Arc::ptr_eq(attached, &provider) {
                    *attached = Arc::clone(&updated);
                }
            }
        });
        Ok(())
    }

    /// Ask an enabled provider for its rundown events
    pub fn capture_state(&self, identity: &ProviderIdentity) -> TraceResult<()> {
        let inner = self.lock();
        let session = inner.session.ok_or(TraceError::InvalidState {
            operation: "capture the state of a provider on",
            state: inner.state,
        })?;
        let provider = self
            .callback_data
            .find_provider(identity)
            .ok_or_else(|| TraceError::UnknownProvider(identity.clone()))?;
        let guid = self.resolve(&provider)?;
        let params = provider.enable_parameters(guid)?;
        self.backend.capture_state(session, &params)?;
        Ok(())
    }

    /// Start the native session (for live traces) and attach a consumer to it
    pub fn open(&self) -> TraceResult<()> {
        let mut inner = self.lock();
        if !matches!(inner.state, TraceState::Created | TraceState::Enabled) {
            return Err(TraceError::InvalidState {
                operation: "open",
                state: inner.state,
            });
        }

        let providers = self.callback_data.providers();
        if let TraceSource::Live(name) = &self.source {
            if providers.is_empty() {
                return Err(TraceError::NoProviders);
            }
            let session = self.backend.start_session(name, &inner.properties)?;
            for provider in providers.iter() {
                if let Err(err) = self.enable_native(session, provider) {
                    self.stop_quietly(session);
                    return Err(err);
                }
            }
            inner.session = Some(session);
        }

        let sink: Arc<dyn RecordSink> = Arc::clone(&self.callback_data) as Arc<dyn RecordSink>;
        let consumer = match self.backend.open_consumer(&self.source, sink) {
            Ok(consumer) => consumer,
            Err(err) => {
                if let Some(session) = inner.session.take() {
                    self.stop_quietly(session);
                }
                return Err(err.into());
            }
        };
        inner.consumer = Some(consumer);

        // Providers of a recorded trace may only be resolvable now
        let resolved = providers
            .iter()
            .filter(|provider| provider.guid().is_none())
            .try_for_each(|provider| self.resolve(provider).map(|_| ()))
            .and_then(|()| ensure_distinct_guids(&providers));
        if let Err(err) = resolved {
            if let Err(close_err) = self.backend.close_consumer(consumer) {
                log::warn!("unable to close the consumer of {:?}: {}", self.source, close_err);
            }
            inner.consumer = None;
            return Err(err);
        }

        log::debug!("opened {:?}", self.source);
        inner.state = TraceState::Opened;
        Ok(())
    }

    /// Pump the records of an opened session
    ///
    /// # Note
    /// This function will block the current thread until the session is stopped or closed (or until the
    /// end of a recorded trace). You will usually want to call this on a separate worker thread.
    pub fn process(&self) -> TraceResult<()> {
        self.pump(None, None)
    }

    /// Pump the records of an opened session, only dispatching those stamped between `start` and `end`
    ///
    /// Both bounds are inclusive, and `None` leaves that side of the window open. Records outside the
    /// window are dropped before they are counted. This is mostly useful to replay part of a recorded trace.
    pub fn process_between(
        &self,
        start: Option<FileTime>,
        end: Option<FileTime>,
    ) -> TraceResult<()> {
        if let (Some(start), Some(end)) = (start, end) {
            if end < start {
                return Err(TraceError::InvalidTimeWindow { start, end });
            }
        }
        self.pump(start, end)
    }

    fn pump(&self, start: Option<FileTime>, end: Option<FileTime>) -> TraceResult<()> {
        let consumer = {
            let mut inner = self.lock();
            match (inner.state, inner.consumer) {
                (TraceState::Opened, Some(consumer)) => {
                    inner.state = TraceState::Processing;
                    consumer
                }
                (state, _) => {
                    return Err(TraceError::InvalidState {
                        operation: "process",
                        state,
                    })
                }
            }
        };

        self.callback_data.set_time_window(start, end);
        log::debug!("processing {:?}", self.source);
        let result = self.backend.process(consumer);

        let mut inner = self.lock();
        if inner.state == TraceState::Processing {
            inner.state = TraceState::Stopped;
        }
        log::debug!("done processing {:?}", self.source);
        result.map_err(TraceError::from)
    }

    /// Open the session and process it on the calling thread
    pub fn start(&self) -> TraceResult<()> {
        self.open()?;
        self.process()
    }

    /// Open the session, then process it on a new thread
    ///
    /// Opening errors are returned directly, processing errors through the thread handle.
    pub fn start_in_thread(self: &Arc<Self>) -> TraceResult<JoinHandle<TraceResult<()>>> {
        self.open()?;
        let session = Arc::clone(self);
        Ok(std::thread::spawn(move || session.process()))
    }

    /// Push new buffer and flush settings to a running session
    ///
    /// Returns the statistics of the session, with the values the native layer actually applied.
    pub fn update(&self, properties: TraceProperties) -> TraceResult<TraceStatistics> {
        let mut inner = self.lock();
        let session = match (inner.state, inner.session) {
            (TraceState::Opened | TraceState::Processing, Some(session)) => session,
            (state, _) => return Err(TraceError::Update(state)),
        };

        let native = self.backend.update_session(session, &properties)?;
        log::debug!("updated {:?} with {:?}", self.source, properties);
        inner.properties = inner.properties.updated_with(&properties);
        Ok(TraceStatistics::new(native, &self.callback_data))
    }

    /// A snapshot of the session counters
    ///
    /// This does not wait for the processing thread.
    pub fn query_stats(&self) -> TraceResult<TraceStatistics> {
        let inner = self.lock();
        match (inner.state, inner.session) {
            (_, Some(session)) => {
                let native = self.backend.query_session(session)?;
                Ok(TraceStatistics::new(native, &self.callback_data))
            }
            (TraceState::Opened | TraceState::Processing | TraceState::Stopped, None) => {
                // Recorded traces have no native session, only our own counters
                Ok(TraceStatistics::new(NativeStats::default(), &self.callback_data))
            }
            (state, None) => Err(TraceError::InvalidState {
                operation: "query",
                state,
            }),
        }
    }

    /// Stop the native session
    ///
    /// The processing thread drains what the native layer still buffers, then returns.
    pub fn stop(&self) -> TraceResult<TraceStatistics> {
        let mut inner = self.lock();
        let session = inner.session.take().ok_or(TraceError::InvalidState {
            operation: "stop",
            state: inner.state,
        })?;

        let native = self.backend.stop_session(session)?;
        log::debug!("stopped {:?}", self.source);
        if inner.state != TraceState::Processing {
            inner.state = TraceState::Stopped;
        }
        Ok(TraceStatistics::new(native, &self.callback_data))
    }

    /// Close the session
    ///
    /// No handler starts once this returns; one that already runs may complete. Join the processing
    /// thread to make sure it is done. Closing a closed session does nothing.
    pub fn close(&self) -> TraceResult<()> {
        self.callback_data.close();

        let mut inner = self.lock();
        if inner.state == TraceState::Closed {
            return Ok(());
        }
        inner.state = TraceState::Closed;

        let mut result = Ok(());
        if let Some(session) = inner.session.take() {
            if let Err(err) = self.backend.stop_session(session) {
                result = Err(err.into());
            }
        }
        if let Some(consumer) = inner.consumer.take() {
            if let Err(err) = self.backend.close_consumer(consumer) {
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        log::debug!("closed {:?}", self.source);
        result
    }

    fn stop_quietly(&self, session: SessionHandle) {
        if let Err(err) = self.backend.stop_session(session) {
            log::warn!("unable to stop {:?}: {}", self.source, err);
        }
    }
}

/// Two providers resolving to the same GUID would compete for the same records
fn ensure_distinct_guids(providers: &[Arc<Provider>]) -> TraceResult<()> {
    let mut seen = std::collections::HashSet::new();
    for provider in providers {
        if let Some(guid) = provider.guid() {
            if !seen.insert(guid) {
                return Err(
                    ConfigurationError::DuplicateProvider(provider.identity().to_string()).into(),
                );
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("source", &self.source)
            .field("inner", &self.inner)
            .field("callback_data", &self.callback_data)
            .finish()
    }
}

/// On drop the ETW session will be stopped if not stopped before
impl Drop for TraceSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("unable to close {:?}: {}", self.source, err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::guid::Guid;
    use crate::native::replay::ReplayEtw;

    const GUID: Guid = Guid::from_u128(0x22fb2cd6_0e7b_422b_a0c7_2fad1fd0e716);

    fn provider() -> Provider {
        Provider::by_guid(GUID).build().unwrap()
    }

    fn builder() -> TraceBuilder {
        TraceSession::builder(Arc::new(ReplayEtw::new()))
    }

    #[test]
    fn test_set_properties() {
        let prop = TraceProperties {
            buffer_size: 10,
            min_buffer: 1,
            max_buffer: 20,
            flush_timer: 60,
            log_file_mode: 5,
        };
        let trace = builder().properties(prop).build().unwrap();
        assert_eq!(trace.properties(), prop);
    }

    #[test]
    fn test_set_name() {
        let trace = builder().named(String::from("TestName")).build().unwrap();
        assert_eq!(trace.name(), Some("TestName"));

        let trace = builder().build().unwrap();
        let name = trace.name().unwrap();
        assert!(name.starts_with("etwsession-"));
        assert_eq!(name.len(), "etwsession-".len() + 10);

        let trace = builder().named("x".repeat(500)).build().unwrap();
        assert_eq!(trace.name().unwrap().chars().count(), TRACE_NAME_MAX_CHARS);

        let trace = builder().from_file("trace.etwrec").build().unwrap();
        assert_eq!(trace.name(), None);
    }

    #[test]
    fn test_enable_multiple_providers() {
        let prov = Provider::by_guid("22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716").build().unwrap();
        let prov1 = Provider::by_guid("A0C1853B-5C40-4B15-8766-3CF1C58F985A").build().unwrap();

        let trace = builder().enable(prov).enable(prov1).build().unwrap();
        assert_eq!(trace.providers().len(), 2);
        assert_eq!(trace.state(), TraceState::Enabled);
    }

    #[test]
    fn test_duplicate_providers_are_rejected() {
        let result = builder().enable(provider()).enable(provider()).build();
        assert!(matches!(
            result,
            Err(TraceError::Configuration(ConfigurationError::DuplicateProvider(_)))
        ));

        // A name resolving to an attached GUID is the same provider
        let backend = Arc::new(ReplayEtw::new());
        backend.register_provider_name("Test-Provider", GUID);
        let trace = TraceSession::builder(backend).enable(provider()).build().unwrap();
        let named = Provider::by_name("Test-Provider").build().unwrap();
        assert!(matches!(
            trace.enable(named),
            Err(TraceError::Configuration(ConfigurationError::DuplicateProvider(_)))
        ));
    }

    #[test]
    fn test_unknown_provider_name() {
        let named = Provider::by_name("Does-Not-Exist").build().unwrap();
        assert!(matches!(
            builder().enable(named).build(),
            Err(TraceError::Enable {
                source: NativeError::ProviderNotFound(_),
                ..
            })
        ));
    }

    #[test]
    fn test_lifecycle_misuse() {
        let trace = builder().build().unwrap();
        assert_eq!(trace.state(), TraceState::Created);
        assert!(matches!(trace.open(), Err(TraceError::NoProviders)));
        assert!(matches!(
            trace.process(),
            Err(TraceError::InvalidState {
                operation: "process",
                ..
            })
        ));
        assert!(matches!(
            trace.update(TraceProperties::default()),
            Err(TraceError::Update(TraceState::Created))
        ));
        assert!(trace.query_stats().is_err());

        trace.close().unwrap();
        trace.close().unwrap();
        assert_eq!(trace.state(), TraceState::Closed);
        assert!(trace.enable(provider()).is_err());
        assert!(trace.open().is_err());
    }

    #[test]
    fn test_disable_returns_the_provider() {
        let trace = builder().enable(provider()).build().unwrap();
        let identity = ProviderIdentity::Guid(GUID);

        let provider = trace.disable(&identity).unwrap();
        assert!(trace.providers().is_empty());
        assert!(matches!(
            trace.disable(&identity),
            Err(TraceError::UnknownProvider(_))
        ));

        trace.enable(provider).unwrap();
        assert_eq!(trace.providers(), vec![identity]);
    }

    #[test]
    fn test_update_requires_an_open_session() {
        let trace = builder().enable(provider()).build().unwrap();
        trace.open().unwrap();
        let props = TraceProperties {
            min_buffer: 4,
            max_buffer: 16,
            flush_timer: 2,
            ..Default::default()
        };
        let stats = trace.update(props).unwrap();
        assert_eq!(stats.min_buffers, 4);
        assert_eq!(trace.properties(), props);

        trace.stop().unwrap();
        assert_eq!(trace.state(), TraceState::Stopped);
        assert!(matches!(
            trace.update(props),
            Err(TraceError::Update(TraceState::Stopped))
        ));
    }
}
