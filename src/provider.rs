//! ETW Providers abstraction.
//!
//! Provides an abstraction over an [ETW Provider](https://docs.microsoft.com/en-us/windows/win32/etw/about-event-tracing#providers):
//! its identity, its enable masks and trace flags, its filters and the handlers that receive its events.
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;

use crate::native::etw_types::EventRecord;
use crate::native::guid::Guid;
use crate::native::{EnableParameters, EtwBackend, NativeResult};
use crate::schema_locator::SchemaLocator;

pub mod event_filter;
pub mod filter_set;
pub mod predicate;
mod trace_flags;

pub use event_filter::{EventFilter, MatchMode, PayloadCondition, PayloadFilter};
pub use filter_set::{DirectFilterSet, FilterChain};
pub use predicate::{CompareOp, FieldValue, Predicate};
pub use trace_flags::TraceFlags;

use predicate::RecordContext;

/// Errors in the configuration of a provider or of its filters
///
/// They are always reported when the configuration is built or attached, never while events flow.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("an event id filter must list at least one id")]
    EmptyEventIds,
    #[error("an event id filter lists {0} ids, at most 64 are supported")]
    TooManyEventIds(usize),
    #[error("a process id filter must list at least one pid")]
    EmptyProcessIds,
    #[error("a process id filter lists {0} pids, at most 8 are supported")]
    TooManyProcessIds(usize),
    #[error("an event name filter must list at least one non-empty name")]
    EmptyEventNames,
    #[error("event names take {0} bytes, a native filter holds at most {max}", max = event_filter::MAX_EVENT_NAMES_SIZE)]
    EventNamesTooLarge(usize),
    #[error("this predicate cannot be evaluated by a payload filter: {0}")]
    UnsupportedPayloadFilter(String),
    #[error("invalid system flags mask {0:#x}: it must be non-zero and fit in 48 bits")]
    InvalidSystemFlagsMask(u64),
    #[error("boolean combinators need at least one operand")]
    EmptyCombinator,
    #[error("field predicates need a field name")]
    EmptyFieldName,
    #[error("{op:?} cannot compare field {field:?} with this kind of value")]
    IncompatibleOperator { field: String, op: CompareOp },
    #[error("these filters can never be satisfied together")]
    ContradictoryFilters,
    #[error("invalid provider GUID: {0}")]
    InvalidGuid(String),
    #[error("provider names must not be empty")]
    EmptyProviderName,
    #[error("provider {0} is already enabled on this session")]
    DuplicateProvider(String),
    #[error("trace flags {0:#x} both ignore and enable keyword-0 events")]
    InvalidFlagCombination(u32),
}

/// How a provider is designated
///
/// Names are resolved into a GUID when the provider is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderIdentity {
    Guid(Guid),
    Name(String),
}

impl Display for ProviderIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderIdentity::Guid(guid) => write!(f, "{}", guid),
            ProviderIdentity::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<Guid> for ProviderIdentity {
    fn from(guid: Guid) -> Self {
        ProviderIdentity::Guid(guid)
    }
}

impl From<&str> for ProviderIdentity {
    fn from(name: &str) -> Self {
        ProviderIdentity::Name(name.to_string())
    }
}

/// Identifies a handler registered on a [`Provider`], so that it can be removed later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    fn next() -> Self {
        HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub type EtwCallback = Box<dyn FnMut(&EventRecord, &SchemaLocator) + Send + Sync + 'static>;

type Handlers = Arc<Mutex<Vec<(HandlerId, EtwCallback)>>>;

/// Describes an ETW Provider to use, along with its options
pub struct Provider {
    identity: ProviderIdentity,
    /// Set at construction for GUID providers, on first enable for named ones
    guid: OnceCell<Guid>,
    /// Provider Any keyword
    any: u64,
    /// Provider All keyword
    all: u64,
    /// Provider level flag
    level: u8,
    /// Used as `EnableParameters.EnableProperty` when enabling the provider (using [EnableTraceEx2](https://docs.microsoft.com/en-us/windows/win32/api/evntrace/nf-evntrace-enabletraceex2)).
    /// Kept raw so that bits unknown to this crate reach the native layer.
    trace_flags: u32,
    rundown: bool,
    filters: Arc<FilterChain>,
    /// Callbacks that will receive events from this Provider
    callbacks: Handlers,
}

/// A Builder for a `Provider`
///
/// See [`Provider`] for various functions that create `ProviderBuilder`s.
pub struct ProviderBuilder {
    identity: Result<ProviderIdentity, ConfigurationError>,
    any: u64,
    all: u64,
    level: u8,
    trace_flags: u32,
    rundown: bool,
    filters: Vec<EventFilter>,
    callbacks: Vec<EtwCallback>,
}

impl std::fmt::Debug for ProviderBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBuilder")
            .field("identity", &self.identity)
            .field("any", &self.any)
            .field("all", &self.all)
            .field("level", &self.level)
            .field("trace_flags", &self.trace_flags)
            .field("rundown", &self.rundown)
            .field("filters", &self.filters)
            .field("n_callbacks", &self.callbacks.len())
            .finish()
    }
}

// Create builders
impl Provider {
    /// Create a Provider defined by its GUID
    ///
    /// Anything convertible into a [`Guid`] is accepted: `Guid` themselves, `u128`, but also `&str`.
    /// A malformed GUID string is reported by [`ProviderBuilder::build`].
    pub fn by_guid<G>(guid: G) -> ProviderBuilder
    where
        G: TryInto<Guid>,
        G::Error: Display,
    {
        let identity = guid
            .try_into()
            .map(ProviderIdentity::Guid)
            .map_err(|err| ConfigurationError::InvalidGuid(err.to_string()));
        ProviderBuilder::new(identity)
    }

    /// Create a Provider defined by its name.
    ///
    /// The name is resolved into a GUID when the provider is enabled, through the name registry of
    /// the native layer.
    ///
    /// # Example
    /// ```
    /// # use etwsession::provider::Provider;
    /// let my_provider = Provider::by_name("Microsoft-Windows-WinINet").build().unwrap();
    /// ```
    pub fn by_name(name: &str) -> ProviderBuilder {
        let identity = if name.is_empty() {
            Err(ConfigurationError::EmptyProviderName)
        } else {
            Ok(ProviderIdentity::Name(name.to_string()))
        };
        ProviderBuilder::new(identity)
    }
}

// Actually use the Provider
impl Provider {
    pub fn identity(&self) -> &ProviderIdentity {
        &self.identity
    }

    /// The GUID of this provider, if it is known yet
    pub fn guid(&self) -> Option<Guid> {
        self.guid.get().copied()
    }

    pub fn any(&self) -> u64 {
        self.any
    }

    pub fn all(&self) -> u64 {
        self.all
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// The trace flags this crate knows of
    pub fn trace_flags(&self) -> TraceFlags {
        TraceFlags::from_bits_truncate(self.trace_flags)
    }

    pub fn raw_trace_flags(&self) -> u32 {
        self.trace_flags
    }

    pub fn rundown_enabled(&self) -> bool {
        self.rundown
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    /// Change the trace flags of a provider that is not enabled
    pub fn set_trace_flags(&mut self, flags: TraceFlags) -> Result<(), ConfigurationError> {
        self.set_raw_trace_flags(flags.bits())
    }

    pub fn set_raw_trace_flags(&mut self, flags: u32) -> Result<(), ConfigurationError> {
        if TraceFlags::contradictory(flags) {
            return Err(ConfigurationError::InvalidFlagCombination(flags));
        }
        self.trace_flags = flags;
        Ok(())
    }

    /// Add a filter to a provider that is not enabled
    ///
    /// To filter an enabled provider, see [`TraceSession::add_filter`](crate::trace::TraceSession::add_filter).
    pub fn add_filter(&mut self, filter: EventFilter) -> Result<(), ConfigurationError> {
        self.filters = Arc::new(self.filters.with(filter)?);
        Ok(())
    }

    /// Register a callback that will be called for every event of this provider that passes its filters
    ///
    /// Handlers are called in registration order. This can be done while the provider is enabled; a
    /// handler registered from inside another handler of the same provider would deadlock.
    pub fn register_handler<T>(&self, callback: T) -> HandlerId
    where
        T: FnMut(&EventRecord, &SchemaLocator) + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(callback)));
        id
    }

    /// Unregister a handler. Returns `false` if it was not registered on this provider.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(handler_id, _)| *handler_id != id);
        callbacks.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Get the GUID of this provider, querying the name registry of `backend` if needed
    pub(crate) fn resolve_guid(&self, backend: &dyn EtwBackend) -> NativeResult<Guid> {
        match &self.identity {
            ProviderIdentity::Guid(guid) => Ok(*guid),
            ProviderIdentity::Name(name) => self
                .guid
                .get_or_try_init(|| backend.resolve_provider_name(name))
                .copied(),
        }
    }

    pub(crate) fn enable_parameters(
        &self,
        guid: Guid,
    ) -> Result<EnableParameters, ConfigurationError> {
        Ok(EnableParameters {
            guid,
            level: self.level,
            any: self.any,
            all: self.all,
            trace_flags: self.trace_flags,
            filters: self.filters.direct_set()?,
        })
    }

    /// Another handle on this provider, sharing its handlers, with different filters
    pub(crate) fn with_filters(&self, filters: FilterChain) -> Provider {
        Provider {
            identity: self.identity.clone(),
            guid: self.guid.clone(),
            any: self.any,
            all: self.all,
            level: self.level,
            trace_flags: self.trace_flags,
            rundown: self.rundown,
            filters: Arc::new(filters),
            callbacks: Arc::clone(&self.callbacks),
        }
    }

    pub(crate) fn detached(&self) -> Provider {
        self.with_filters(FilterChain::clone(&self.filters))
    }

    /// Run the filters, then the handlers
    ///
    /// Returns whether the record passed the filters. A panicking handler is logged, and the next
    /// handlers still run. No handler starts once `closing` is set.
    pub(crate) fn on_event(&self, context: &RecordContext, closing: &AtomicBool) -> bool {
        if !self.filters.accepts(context) {
            return false;
        }

        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for (id, callback) in callbacks.iter_mut() {
            if closing.load(Ordering::Acquire) {
                break;
            }
            let call = catch_unwind(AssertUnwindSafe(|| {
                callback(context.record(), context.locator())
            }));
            if let Err(panic) = call {
                let reason = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                log::error!(
                    "handler {:?} of provider {} panicked on event {}: {}",
                    id,
                    self.identity,
                    context.record().event_id(),
                    reason
                );
            }
        }
        true
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("identity", &self.identity)
            .field("guid", &self.guid.get())
            .field("any", &self.any)
            .field("all", &self.all)
            .field("level", &self.level)
            .field("trace_flags", &self.trace_flags)
            .field("rundown", &self.rundown)
            .field("filters", &self.filters)
            .field(
                "callbacks",
                &self.callbacks.try_lock().map(|callbacks| callbacks.len()).ok(),
            )
            .finish()
    }
}

impl ProviderBuilder {
    fn new(identity: Result<ProviderIdentity, ConfigurationError>) -> Self {
        ProviderBuilder {
            identity,
            any: 0,
            all: 0,
            level: 5,
            trace_flags: 0,
            rundown: false,
            filters: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// Set the `any` flag in the Provider instance
    /// [More info](https://docs.microsoft.com/en-us/message-analyzer/system-etw-provider-event-keyword-level-settings#filtering-with-system-etw-provider-event-keywords-and-levels)
    ///
    /// # Example
    /// ```
    /// # use etwsession::provider::Provider;
    /// let my_provider = Provider::by_guid("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F").any(0xf0010000000003ff).build();
    /// ```
    pub fn any(mut self, any: u64) -> Self {
        self.any = any;
        self
    }

    /// Set the `all` flag in the Provider instance
    /// [More info](https://docs.microsoft.com/en-us/message-analyzer/system-etw-provider-event-keyword-level-settings#filtering-with-system-etw-provider-event-keywords-and-levels)
    pub fn all(mut self, all: u64) -> Self {
        self.all = all;
        self
    }

    /// Set the `level` flag in the Provider instance
    ///
    /// # Example
    /// ```
    /// # use etwsession::provider::Provider;
    /// // LogAlways (0x0)
    /// // Critical (0x1)
    /// // Error (0x2)
    /// // Warning (0x3)
    /// // Information (0x4)
    /// // Verbose (0x5)
    /// let my_provider = Provider::by_guid("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F").level(0x5).build();
    /// ```
    pub fn level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    /// Set the `trace_flags` flag in the Provider instance
    /// [More info](https://docs.microsoft.com/en-us/windows-hardware/drivers/devtest/trace-flags)
    ///
    /// # Example
    /// ```
    /// # use etwsession::provider::{Provider, TraceFlags};
    /// let my_provider = Provider::by_guid("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F").trace_flags(TraceFlags::EVENT_ENABLE_PROPERTY_SID).build();
    /// ```
    pub fn trace_flags(mut self, trace_flags: TraceFlags) -> Self {
        self.trace_flags = trace_flags.bits();
        self
    }

    /// Same as [`ProviderBuilder::trace_flags`], also accepting values this crate has no name for
    pub fn raw_trace_flags(mut self, trace_flags: u32) -> Self {
        self.trace_flags = trace_flags;
        self
    }

    /// Ask the provider for its rundown events as soon as it is enabled
    pub fn enable_rundown_events(mut self) -> Self {
        self.rundown = true;
        self
    }

    /// Add a callback function that will be called when the Provider generates an Event
    ///
    /// # Notes
    ///
    /// The callback will be run on a background thread (the one that is blocked on the `process` function).
    /// A slow callback delays every other event of the session.
    ///
    /// # Example
    /// ```
    /// # use etwsession::provider::Provider;
    /// # use etwsession::native::etw_types::EventRecord;
    /// # use etwsession::schema_locator::SchemaLocator;
    /// let provider = Provider::by_guid("1EDEEE53-0AFE-4609-B846-D8C0B2075B1F").add_callback(|record: &EventRecord, schema_locator: &SchemaLocator| {
    ///     // Handle Event
    /// }).build();
    /// ```
    pub fn add_callback<T>(mut self, callback: T) -> Self
    where
        T: FnMut(&EventRecord, &SchemaLocator) + Send + Sync + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Add a filter to this Provider.
    ///
    /// Adding multiple filters will bind them with an `AND` relationship.<br/>
    /// If you want an `OR` relationship, use a [`Predicate::Or`].
    ///
    /// # Example
    /// ```
    /// # use etwsession::provider::{EventFilter, Provider};
    /// let only_events_18_or_42 = EventFilter::event_ids([18, 42]);
    /// let only_pid_1234 = EventFilter::process_ids([1234]);
    ///
    /// Provider::by_guid("22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716")
    ///     .add_filter(only_events_18_or_42)
    ///     .add_filter(only_pid_1234)
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn add_filter(mut self, filter: EventFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Build the provider
    ///
    /// This is where the identity, the trace flags and every filter are validated.
    ///
    /// # Example
    /// ```
    /// # use etwsession::provider::Provider;
    /// # use etwsession::native::etw_types::EventRecord;
    /// # use etwsession::schema_locator::SchemaLocator;
    /// # let process_callback = |_event: &EventRecord, _locator: &SchemaLocator| {};
    /// Provider::by_guid("22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716") // Microsoft-Windows-Kernel-Process
    ///   .add_callback(process_callback)
    ///   .build()
    ///   .unwrap();
    /// ```
    pub fn build(self) -> Result<Provider, ConfigurationError> {
        let identity = self.identity?;
        if TraceFlags::contradictory(self.trace_flags) {
            return Err(ConfigurationError::InvalidFlagCombination(self.trace_flags));
        }

        let mut filters = FilterChain::new();
        for filter in self.filters {
            filters.push(filter)?;
        }

        let guid = OnceCell::new();
        if let ProviderIdentity::Guid(value) = identity {
            let _ = guid.set(value);
        }

        let callbacks = self
            .callbacks
            .into_iter()
            .map(|callback| (HandlerId::next(), callback))
            .collect();

        Ok(Provider {
            identity,
            guid,
            any: self.any,
            all: self.all,
            level: self.level,
            trace_flags: self.trace_flags,
            rundown: self.rundown,
            filters: Arc::new(filters),
            callbacks: Arc::new(Mutex::new(callbacks)),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::EventHeader;
    use crate::native::replay::ReplayEtw;

    const GUID_STR: &str = "22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716";

    fn dispatch(provider: &Provider, event_id: u16) -> bool {
        let backend = ReplayEtw::new();
        let locator = SchemaLocator::new(Arc::new(backend));
        let guid = provider.guid().unwrap_or_default();
        let record = EventRecord::new(EventHeader::new(guid, event_id), &[], &[]);
        let context = RecordContext::new(&record, &locator);
        provider.on_event(&context, &AtomicBool::new(false))
    }

    #[test]
    fn test_identity() {
        let provider = Provider::by_guid(GUID_STR).build().unwrap();
        let expected = Guid::parse(GUID_STR).unwrap();
        assert_eq!(provider.identity(), &ProviderIdentity::Guid(expected));
        assert_eq!(provider.guid(), Some(expected));
        assert_eq!(provider.level(), 5);

        let provider = Provider::by_name("Microsoft-Windows-Kernel-Process").build().unwrap();
        assert_eq!(provider.guid(), None);
        assert_eq!(
            provider.identity().to_string(),
            "Microsoft-Windows-Kernel-Process"
        );

        let provider = Provider::by_guid(0x1234u128).build().unwrap();
        assert_eq!(provider.guid(), Some(Guid::from_u128(0x1234)));
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            Provider::by_guid("not-a-guid").build(),
            Err(ConfigurationError::InvalidGuid(_))
        ));
        assert!(matches!(
            Provider::by_name("").build(),
            Err(ConfigurationError::EmptyProviderName)
        ));
        assert!(matches!(
            Provider::by_guid(GUID_STR)
                .trace_flags(
                    TraceFlags::EVENT_ENABLE_PROPERTY_IGNORE_KEYWORD_0
                        | TraceFlags::EVENT_ENABLE_PROPERTY_ENABLE_KEYWORD_0
                )
                .build(),
            Err(ConfigurationError::InvalidFlagCombination(0x50))
        ));
        assert!(matches!(
            Provider::by_guid(GUID_STR)
                .add_filter(EventFilter::event_ids([]))
                .build(),
            Err(ConfigurationError::EmptyEventIds)
        ));
        assert!(matches!(
            Provider::by_guid(GUID_STR)
                .add_filter(EventFilter::event_ids([1]))
                .add_filter(EventFilter::event_ids([2]))
                .build(),
            Err(ConfigurationError::ContradictoryFilters)
        ));
    }

    #[test]
    fn test_unknown_trace_flags_are_kept() {
        let mut provider = Provider::by_guid(GUID_STR)
            .raw_trace_flags(0x8000_0001)
            .build()
            .unwrap();
        assert_eq!(provider.raw_trace_flags(), 0x8000_0001);
        assert_eq!(provider.trace_flags(), TraceFlags::EVENT_ENABLE_PROPERTY_SID);
        let params = provider.enable_parameters(Guid::zeroed()).unwrap();
        assert_eq!(params.trace_flags, 0x8000_0001);

        provider
            .set_trace_flags(TraceFlags::EVENT_ENABLE_PROPERTY_STACK_TRACE)
            .unwrap();
        assert_eq!(provider.raw_trace_flags(), 0x4);
        assert!(provider.set_raw_trace_flags(0x50).is_err());
        assert_eq!(provider.raw_trace_flags(), 0x4);
    }

    #[test]
    fn test_handlers_run_in_order_and_can_be_removed() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&calls);
        let provider = Provider::by_guid(GUID_STR)
            .add_callback(move |_, _| first.lock().unwrap().push("first"))
            .build()
            .unwrap();
        let second = Arc::clone(&calls);
        let second_id = provider.register_handler(move |_, _| second.lock().unwrap().push("second"));
        let third = Arc::clone(&calls);
        provider.register_handler(move |_, _| third.lock().unwrap().push("third"));
        assert_eq!(provider.handler_count(), 3);

        assert!(dispatch(&provider, 1));
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);

        assert!(provider.remove_handler(second_id));
        assert!(!provider.remove_handler(second_id));
        calls.lock().unwrap().clear();
        dispatch(&provider, 1);
        assert_eq!(*calls.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_the_others() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let provider = Provider::by_guid(GUID_STR)
            .add_callback(|_, _| panic!("handler failure"))
            .add_callback(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        assert!(dispatch(&provider, 1));
        assert!(dispatch(&provider, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_filters_gate_the_handlers() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let mut provider = Provider::by_guid(GUID_STR)
            .add_filter(EventFilter::event_ids([5, 6]))
            .add_callback(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();
        provider
            .add_filter(EventFilter::predicate(Predicate::EventIdEquals(5)))
            .unwrap();

        let delivered: Vec<bool> = [4, 5, 5, 6].iter().map(|id| dispatch(&provider, *id)).collect();
        assert_eq!(delivered, vec![false, true, true, false]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Only the event id filter is handed to the native layer
        let params = provider.enable_parameters(Guid::zeroed()).unwrap();
        assert_eq!(params.filters.descriptor_count(), 1);
    }

    #[test]
    fn test_detached_copies_share_handlers() {
        let provider = Provider::by_guid(GUID_STR).build().unwrap();
        let copy = provider.with_filters(FilterChain::new().with(EventFilter::event_ids([1])).unwrap());
        copy.register_handler(|_, _| {});
        assert_eq!(provider.handler_count(), 1);
        assert!(provider.filters().is_empty());
        assert_eq!(copy.filters().len(), 1);
    }
}
