use std::path::PathBuf;
use std::sync::Arc;

use etwsession::native::recording::RecordingWriter;
use etwsession::native::replay::ReplayEtw;
use etwsession::native::time::FileTime;
use etwsession::native::NativeError;
use etwsession::parser::Parser;
use etwsession::provider::{ConfigurationError, Provider};
use etwsession::schema_locator::SchemaLocator;
use etwsession::trace::{TraceError, TraceSession, TraceState};
use etwsession::EventRecord;

mod utils;
use utils::{init_logs, value_event, value_schema, Collector, OTHER_PROVIDER, TEST_PROVIDER};

fn dump_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("etwsession-{}-{}.etwrec", std::process::id(), name))
}

/// Record a trace the way a live session would have seen it
fn save_a_trace(path: &PathBuf) {
    let mut writer = RecordingWriter::create(path).unwrap();
    writer.write_provider(TEST_PROVIDER, "Test-Provider").unwrap();
    writer.write_provider(OTHER_PROVIDER, "Other-Provider").unwrap();
    writer.write_schema(&value_schema(TEST_PROVIDER, 1)).unwrap();
    for value in 0..5 {
        writer
            .write_event(&value_event(TEST_PROVIDER, 1, value, "recorded"))
            .unwrap();
        writer
            .write_event(&value_event(OTHER_PROVIDER, 2, value, "other"))
            .unwrap();
    }
    writer.finish().unwrap();
}

#[test]
fn etwrec_file() {
    init_logs();
    let path = dump_file("replay");
    save_a_trace(&path);

    let values = Collector::new();
    let unattached = Collector::new();

    let values_by_handler = values.clone();
    // Names are resolved from the recording itself
    let provider = Provider::by_name("Test-Provider")
        .add_callback(move |record: &EventRecord, schema_locator: &SchemaLocator| {
            let schema = schema_locator.event_schema(record).unwrap();
            let parser = Parser::create(record, &schema);
            values_by_handler.push(parser.try_parse::<u32>("Value").unwrap());
        })
        .build()
        .unwrap();

    let unattached_by_callback = unattached.clone();
    let (trace, handle) = TraceSession::builder(Arc::new(ReplayEtw::new()))
        .from_file(&path)
        .enable(provider)
        .default_callback(move |record: &EventRecord, _: &SchemaLocator| {
            unattached_by_callback.push(record.provider_id())
        })
        .start_and_process()
        .unwrap();

    // The end of the file ends the processing
    handle.join().unwrap().unwrap();
    assert_eq!(trace.state(), TraceState::Stopped);

    assert_eq!(values.values(), vec![0, 1, 2, 3, 4]);
    assert_eq!(unattached.values(), vec![OTHER_PROVIDER; 5]);

    let stats = trace.query_stats().unwrap();
    assert_eq!(stats.events_total, 10);
    assert_eq!(stats.events_handled, 10);

    trace.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn part_of_a_recorded_trace() {
    init_logs();
    let path = dump_file("window");
    let first = FileTime::from_unix_timestamp_millis(1_700_000_000_000);
    let mut writer = RecordingWriter::create(&path).unwrap();
    writer.write_schema(&value_schema(TEST_PROVIDER, 1)).unwrap();
    for value in 0..6u32 {
        // One event per second
        let timestamp = first.as_quad() + i64::from(value) * 10_000_000;
        writer
            .write_event(&value_event(TEST_PROVIDER, 1, value, "timed").with_timestamp(timestamp))
            .unwrap();
    }
    writer.finish().unwrap();

    let values = Collector::new();
    let values_by_handler = values.clone();
    let provider = Provider::by_guid(TEST_PROVIDER)
        .add_callback(move |record: &EventRecord, schema_locator: &SchemaLocator| {
            let schema = schema_locator.event_schema(record).unwrap();
            let parser = Parser::create(record, &schema);
            values_by_handler.push(parser.try_parse::<u32>("Value").unwrap());
        })
        .build()
        .unwrap();
    let trace = TraceSession::builder(Arc::new(ReplayEtw::new()))
        .from_file(&path)
        .enable(provider)
        .build()
        .unwrap();

    let start = FileTime::from_quad(first.as_quad() + 10_000_000);
    let end = FileTime::from_quad(first.as_quad() + 3 * 10_000_000);
    assert!(matches!(
        trace.process_between(Some(end), Some(start)),
        Err(TraceError::InvalidTimeWindow { .. })
    ));

    trace.open().unwrap();
    trace.process_between(Some(start), Some(end)).unwrap();

    // Both bounds are included, records outside the window are not even counted
    assert_eq!(values.values(), vec![1, 2, 3]);
    assert_eq!(trace.query_stats().unwrap().events_total, 3);

    trace.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn names_resolving_to_an_attached_guid() {
    init_logs();
    let path = dump_file("same-provider");
    save_a_trace(&path);

    let by_name = Provider::by_name("Test-Provider").build().unwrap();
    let by_guid = Provider::by_guid(TEST_PROVIDER).build().unwrap();
    // Both are accepted until the name can be looked up in the file
    let trace = TraceSession::builder(Arc::new(ReplayEtw::new()))
        .from_file(&path)
        .enable(by_name)
        .enable(by_guid)
        .build()
        .unwrap();

    assert!(matches!(
        trace.open(),
        Err(TraceError::Configuration(ConfigurationError::DuplicateProvider(_)))
    ));
    assert_eq!(trace.state(), TraceState::Enabled);

    // Without the duplicate, the session opens
    trace.disable(&TEST_PROVIDER.into()).unwrap();
    trace.open().unwrap();
    assert_eq!(trace.providers().len(), 1);
    trace.close().unwrap();
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn missing_file() {
    init_logs();
    let trace = TraceSession::builder(Arc::new(ReplayEtw::new()))
        .from_file(dump_file("missing"))
        .default_callback(|_: &EventRecord, _: &SchemaLocator| {})
        .build()
        .unwrap();

    assert!(matches!(
        trace.start(),
        Err(TraceError::Native(NativeError::IoError(_)))
    ));
    assert_eq!(trace.state(), TraceState::Created);
}

#[test]
fn unknown_provider_names_in_files() {
    init_logs();
    let path = dump_file("unknown-name");
    save_a_trace(&path);

    let provider = Provider::by_name("Not-Recorded").build().unwrap();
    let trace = TraceSession::builder(Arc::new(ReplayEtw::new()))
        .from_file(&path)
        .enable(provider)
        .build()
        .unwrap();

    // The name can only be checked against the file once it is opened
    assert!(matches!(
        trace.open(),
        Err(TraceError::Enable {
            source: NativeError::ProviderNotFound(_),
            ..
        })
    ));
    std::fs::remove_file(&path).unwrap();
}
