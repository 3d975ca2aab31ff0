//! Test that traces are started and stopped as expected

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use once_cell::sync::OnceCell;

use etwsession::native::replay::{RawEvent, ReplayEtw};
use etwsession::native::NativeError;
use etwsession::provider::Provider;
use etwsession::schema_locator::SchemaLocator;
use etwsession::trace::{TraceError, TraceProperties, TraceSession, TraceState};
use etwsession::EventRecord;

mod utils;
use utils::{init_logs, wait_until, Counter, TEST_PROVIDER};

fn counting_provider(counter: &Counter) -> Provider {
    let counter = counter.clone();
    Provider::by_guid(TEST_PROVIDER)
        .add_callback(move |_: &EventRecord, _: &SchemaLocator| counter.increment())
        .build()
        .unwrap()
}

#[test]
fn states_of_a_session() {
    init_logs();
    let backend = Arc::new(ReplayEtw::new());
    let counter = Counter::new();

    let trace = Arc::new(
        TraceSession::builder(backend.clone())
            .named(String::from("etwsession-test-states"))
            .build()
            .unwrap(),
    );
    assert_eq!(trace.state(), TraceState::Created);

    trace.enable(counting_provider(&counter)).unwrap();
    assert_eq!(trace.state(), TraceState::Enabled);

    trace.open().unwrap();
    assert_eq!(trace.state(), TraceState::Opened);

    let processing = Arc::clone(&trace);
    let handle = thread::spawn(move || processing.process());
    wait_until(|| trace.state() == TraceState::Processing);

    backend.inject(RawEvent::new(TEST_PROVIDER, 1));
    counter.wait_for(1);

    trace.stop().unwrap();
    handle.join().unwrap().unwrap();
    assert_eq!(trace.state(), TraceState::Stopped);
    assert!(matches!(
        trace.stop(),
        Err(TraceError::InvalidState {
            operation: "stop",
            ..
        })
    ));

    trace.close().unwrap();
    assert_eq!(trace.state(), TraceState::Closed);
    trace.close().unwrap();
}

#[test]
fn stopping_drains_pending_events() {
    init_logs();
    let backend = Arc::new(ReplayEtw::new());
    let counter = Counter::new();

    let (trace, handle) = TraceSession::builder(backend.clone())
        .enable(counting_provider(&counter))
        .start_and_process()
        .unwrap();

    let queued = backend.inject_all((0..50).map(|id| RawEvent::new(TEST_PROVIDER, id)));
    assert_eq!(queued, 50);
    let stats = trace.stop().unwrap();
    handle.join().unwrap().unwrap();

    assert_eq!(stats.events_lost, 0);
    assert_eq!(counter.get(), 50);
    assert_eq!(trace.events_handled(), 50);
}

#[test]
fn nothing_is_dispatched_once_closed() {
    init_logs();
    let backend = Arc::new(ReplayEtw::new());
    let counter = Counter::new();

    let (trace, handle) = TraceSession::builder(backend.clone())
        .enable(counting_provider(&counter))
        .start_and_process()
        .unwrap();

    let producing = Arc::new(AtomicBool::new(true));
    let producer = {
        let backend = Arc::clone(&backend);
        let producing = Arc::clone(&producing);
        thread::spawn(move || {
            let mut id = 0u16;
            while producing.load(Ordering::SeqCst) {
                backend.inject(RawEvent::new(TEST_PROVIDER, id));
                id = id.wrapping_add(1);
            }
        })
    };

    counter.wait_for(10);
    trace.close().unwrap();
    handle.join().unwrap().unwrap();
    let after_join = counter.get();

    // Keep emitting for a while: a closed session must not call anything anymore
    thread::sleep(Duration::from_millis(50));
    producing.store(false, Ordering::SeqCst);
    producer.join().unwrap();

    assert_eq!(counter.get(), after_join);
    assert_eq!(trace.state(), TraceState::Closed);
}

#[test]
fn live_updates() {
    init_logs();
    let backend = Arc::new(ReplayEtw::new());
    let counter = Counter::new();

    let initial = TraceProperties {
        buffer_size: 32,
        min_buffer: 2,
        max_buffer: 8,
        flush_timer: 1,
        ..Default::default()
    };
    let (trace, handle) = TraceSession::builder(backend.clone())
        .properties(initial)
        .enable(counting_provider(&counter))
        .start_and_process()
        .unwrap();

    let stats = trace.query_stats().unwrap();
    assert_eq!(stats.buffer_size, 32);
    assert_eq!(stats.max_buffers, 8);
    assert_eq!(stats.logger_name, trace.name().unwrap());

    let updated = TraceProperties {
        buffer_size: 32,
        min_buffer: 4,
        max_buffer: 64,
        flush_timer: 3,
        ..Default::default()
    };
    let applied = trace.update(updated).unwrap();
    assert_eq!(applied.max_buffers, 64);

    backend.inject_all((0..5).map(|id| RawEvent::new(TEST_PROVIDER, id)));
    wait_until(|| trace.events_handled() == 5);

    let stats = trace.query_stats().unwrap();
    assert_eq!(stats.min_buffers, 4);
    assert_eq!(stats.max_buffers, 64);
    assert_eq!(stats.flush_timer, 3);
    assert_eq!(stats.events_total, 5);
    assert_eq!(stats.events_handled, 5);
    assert_eq!(trace.properties(), updated);

    // Contradicting settings are refused and leave the session as it was
    let invalid = TraceProperties {
        min_buffer: 16,
        max_buffer: 2,
        ..Default::default()
    };
    assert!(matches!(
        trace.update(invalid),
        Err(TraceError::Native(NativeError::InvalidParameter(_)))
    ));
    assert_eq!(trace.query_stats().unwrap().max_buffers, 64);
    assert_eq!(trace.properties(), updated);

    // Zero fields keep their current value
    let flush_only = TraceProperties {
        flush_timer: 5,
        ..Default::default()
    };
    let applied = trace.update(flush_only).unwrap();
    assert_eq!(
        (applied.min_buffers, applied.max_buffers, applied.flush_timer),
        (4, 64, 5)
    );
    assert_eq!(
        trace.properties(),
        TraceProperties {
            flush_timer: 5,
            ..updated
        }
    );

    trace.stop().unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn session_names_are_unique() {
    init_logs();
    let backend = Arc::new(ReplayEtw::new());
    let name = String::from("etwsession-test-unique");

    {
        let first = TraceSession::builder(backend.clone())
            .named(name.clone())
            .enable(counting_provider(&Counter::new()))
            .build()
            .unwrap();
        first.open().unwrap();

        let second = TraceSession::builder(backend.clone())
            .named(name.clone())
            .enable(counting_provider(&Counter::new()))
            .build()
            .unwrap();
        assert!(matches!(
            second.open(),
            Err(TraceError::Native(NativeError::AlreadyExist(_)))
        ));
        // A failed open leaves the session where it was
        assert_eq!(second.state(), TraceState::Enabled);
    }

    // Dropping a session stops it, its name is free again
    let third = TraceSession::builder(backend)
        .named(name)
        .enable(counting_provider(&Counter::new()))
        .build()
        .unwrap();
    third.open().unwrap();
    third.close().unwrap();
}

#[test]
fn handlers_can_control_their_session() {
    init_logs();
    let backend = Arc::new(ReplayEtw::new());
    let counter = Counter::new();
    let trace: Arc<OnceCell<Arc<TraceSession>>> = Arc::default();

    let handler_trace = Arc::clone(&trace);
    let handler_counter = counter.clone();
    let provider = Provider::by_guid(TEST_PROVIDER)
        .add_callback(move |record: &EventRecord, _: &SchemaLocator| {
            handler_counter.increment();
            if record.event_id() == 99 {
                if let Some(trace) = handler_trace.get() {
                    // Statistics are available from the processing thread too
                    assert!(trace.query_stats().is_ok());
                    trace.stop().unwrap();
                }
            }
        })
        .build()
        .unwrap();

    let (session, handle) = TraceSession::builder(backend.clone())
        .enable(provider)
        .start_and_process()
        .unwrap();
    trace.set(Arc::clone(&session)).unwrap();

    backend.inject_all([RawEvent::new(TEST_PROVIDER, 1), RawEvent::new(TEST_PROVIDER, 99)]);
    handle.join().unwrap().unwrap();

    assert_eq!(counter.get(), 2);
    assert_eq!(session.state(), TraceState::Stopped);
}
