use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::native::etw_types::EventRecord;
use crate::native::time::FileTime;
use crate::native::RecordSink;
use crate::provider::predicate::RecordContext;
use crate::provider::{EtwCallback, Provider, ProviderIdentity};
use crate::schema_locator::SchemaLocator;

type ProviderSet = Arc<Vec<Arc<Provider>>>;

/// Data used by callbacks when the trace is running
///
/// The native layer pushes records here from the processing thread, while control threads attach and
/// detach providers. The provider set is copy-on-write: each record is dispatched against the set
/// that was current when it arrived, and mutations only hold the lock long enough to swap it.
pub(crate) struct CallbackData {
    closing: AtomicBool,
    /// Records stamped outside `[window_start, window_end]` are dropped
    window_start: AtomicI64,
    window_end: AtomicI64,
    /// Every record received, including those no handler wanted
    events_total: AtomicU64,
    /// Records that went through the filters of their provider (or to the default callback)
    events_handled: AtomicU64,
    providers: Mutex<ProviderSet>,
    /// Receives the records of providers that are not attached
    default_callback: Option<Mutex<EtwCallback>>,
    schema_locator: SchemaLocator,
}

impl CallbackData {
    pub(crate) fn new(schema_locator: SchemaLocator, default_callback: Option<EtwCallback>) -> Self {
        CallbackData {
            closing: AtomicBool::new(false),
            window_start: AtomicI64::new(i64::MIN),
            window_end: AtomicI64::new(i64::MAX),
            events_total: AtomicU64::new(0),
            events_handled: AtomicU64::new(0),
            providers: Mutex::new(Arc::new(Vec::new())),
            default_callback: default_callback.map(Mutex::new),
            schema_locator,
        }
    }

    pub(crate) fn providers(&self) -> ProviderSet {
        Arc::clone(&self.providers.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply `change` to a copy of the provider set, then publish the copy
    pub(crate) fn update_providers<F, T>(&self, change: F) -> T
    where
        F: FnOnce(&mut Vec<Arc<Provider>>) -> T,
    {
        let mut current = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&current);
        let result = change(&mut next);
        *current = Arc::new(next);
        result
    }

    pub(crate) fn find_provider(&self, identity: &ProviderIdentity) -> Option<Arc<Provider>> {
        self.providers()
            .iter()
            .find(|provider| provider_matches(provider, identity))
            .cloned()
    }

    pub(crate) fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    /// How many events have been handled since this instance was created
    pub(crate) fn events_handled(&self) -> u64 {
        self.events_handled.load(Ordering::Relaxed)
    }

    /// No handler starts after this returns
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub(crate) fn schema_locator(&self) -> &SchemaLocator {
        &self.schema_locator
    }

    /// Only dispatch the records stamped between `start` and `end`, inclusive
    pub(crate) fn set_time_window(&self, start: Option<FileTime>, end: Option<FileTime>) {
        let start = start.map_or(i64::MIN, |start| start.as_quad());
        let end = end.map_or(i64::MAX, |end| end.as_quad());
        self.window_start.store(start, Ordering::Relaxed);
        self.window_end.store(end, Ordering::Relaxed);
    }

    fn in_time_window(&self, record: &EventRecord) -> bool {
        let timestamp = record.timestamp();
        timestamp >= self.window_start.load(Ordering::Relaxed)
            && timestamp <= self.window_end.load(Ordering::Relaxed)
    }

    fn on_unattached(&self, record: &EventRecord) {
        match &self.default_callback {
            Some(callback) => {
                let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
                // The session may have been closed while this thread waited for the callback
                if self.closing.load(Ordering::Acquire) {
                    return;
                }
                if catch_unwind(AssertUnwindSafe(|| callback(record, &self.schema_locator))).is_err() {
                    log::error!(
                        "the default callback panicked on event {} of {}",
                        record.event_id(),
                        record.provider_id()
                    );
                }
                self.events_handled.fetch_add(1, Ordering::Relaxed);
            }
            None => log::warn!(
                "dropping event {} of {}, which no provider of this session expects",
                record.event_id(),
                record.provider_id()
            ),
        }
    }
}

/// Whether `provider` is the one designated by `identity`
///
/// A GUID designates a named provider once that name has been resolved to it.
pub(crate) fn provider_matches(provider: &Provider, identity: &ProviderIdentity) -> bool {
    if provider.identity() == identity {
        return true;
    }
    match identity {
        ProviderIdentity::Guid(guid) => provider.guid() == Some(*guid),
        ProviderIdentity::Name(_) => false,
    }
}

impl RecordSink for CallbackData {
    fn on_record(&self, record: &EventRecord) {
        if self.closing.load(Ordering::Acquire) || !self.in_time_window(record) {
            return;
        }
        self.events_total.fetch_add(1, Ordering::Relaxed);

        let providers = self.providers();
        // Identities are unique on a session, the latest attached provider would win otherwise
        let target = providers
            .iter()
            .rev()
            .find(|provider| provider.guid() == Some(record.provider_id()));

        match target {
            Some(provider) => {
                let context = RecordContext::new(record, &self.schema_locator);
                if provider.on_event(&context, &self.closing) {
                    self.events_handled.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => self.on_unattached(record),
        }
    }
}

impl std::fmt::Debug for CallbackData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackData")
            .field("closing", &self.closing)
            .field("events_total", &self.events_total)
            .field("events_handled", &self.events_handled)
            .field("providers", &self.providers().len())
            .field("default_callback", &self.default_callback.is_some())
            .field("schema_locator", &self.schema_locator)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::EventHeader;
    use crate::native::guid::Guid;
    use crate::native::replay::ReplayEtw;

    fn callback_data(default_callback: Option<EtwCallback>) -> CallbackData {
        CallbackData::new(SchemaLocator::new(Arc::new(ReplayEtw::new())), default_callback)
    }

    fn counting_provider(guid: Guid, counter: &Arc<AtomicU64>) -> Provider {
        let counter = Arc::clone(counter);
        Provider::by_guid(guid)
            .add_callback(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_routing_by_provider() {
        let data = callback_data(None);
        let first = Arc::new(AtomicU64::new(0));
        let second = Arc::new(AtomicU64::new(0));
        data.update_providers(|providers| {
            providers.push(Arc::new(counting_provider(Guid::from_u128(1), &first)));
            providers.push(Arc::new(counting_provider(Guid::from_u128(2), &second)));
        });

        for (guid, id) in [(1, 10), (2, 10), (2, 11), (3, 10)] {
            let record = EventRecord::new(EventHeader::new(Guid::from_u128(guid), id), &[], &[]);
            data.on_record(&record);
        }

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(data.events_total(), 4);
        assert_eq!(data.events_handled(), 3);
        assert!(data.find_provider(&ProviderIdentity::Guid(Guid::from_u128(2))).is_some());
        assert!(data.find_provider(&ProviderIdentity::Name("Other".into())).is_none());
    }

    #[test]
    fn test_default_callback() {
        let unattached = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&unattached);
        let data = callback_data(Some(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let record = EventRecord::new(EventHeader::new(Guid::from_u128(9), 1), &[], &[]);
        data.on_record(&record);
        assert_eq!(unattached.load(Ordering::SeqCst), 1);
        assert_eq!(data.events_handled(), 1);
    }

    #[test]
    fn test_default_callback_is_not_called_once_closed() {
        let unattached = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&unattached);
        let data = Arc::new(callback_data(Some(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))));

        // Hold the default callback while a record is on its way to it
        let held = data
            .default_callback
            .as_ref()
            .unwrap()
            .lock()
            .unwrap();
        let dispatching = Arc::clone(&data);
        let dispatch = std::thread::spawn(move || {
            let record = EventRecord::new(EventHeader::new(Guid::from_u128(9), 1), &[], &[]);
            dispatching.on_record(&record);
        });
        while data.events_total() == 0 {
            std::thread::yield_now();
        }
        data.close();
        drop(held);
        dispatch.join().unwrap();

        assert_eq!(unattached.load(Ordering::SeqCst), 0);
        assert_eq!(data.events_handled(), 0);
    }

    #[test]
    fn test_nothing_is_dispatched_once_closed() {
        let data = callback_data(None);
        let calls = Arc::new(AtomicU64::new(0));
        data.update_providers(|providers| {
            providers.push(Arc::new(counting_provider(Guid::from_u128(1), &calls)))
        });

        data.close();
        let record = EventRecord::new(EventHeader::new(Guid::from_u128(1), 1), &[], &[]);
        data.on_record(&record);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(data.events_total(), 0);
    }
}
