//! Grow the buffers of a running session and watch its statistics
use std::sync::Arc;
use std::time::Duration;

use etwsession::native::replay::{RawEvent, ReplayEtw};
use etwsession::provider::Provider;
use etwsession::schema_locator::SchemaLocator;
use etwsession::trace::{TraceProperties, TraceSession};
use etwsession::{EventRecord, Guid};

const PROVIDER: Guid = Guid::from_u128(0x3c0f6a52_8f1e_4d2b_b3a4_6a1f0e9d7c11);

fn main() {
    env_logger::init();

    let backend = Arc::new(ReplayEtw::new());
    let provider = Provider::by_guid(PROVIDER)
        .add_callback(|_record: &EventRecord, _schema_locator: &SchemaLocator| {
            // A slow consumer
            std::thread::sleep(Duration::from_millis(1));
        })
        .build()
        .unwrap();

    let (trace, handle) = TraceSession::builder(backend.clone())
        .properties(TraceProperties {
            buffer_size: 4,
            min_buffer: 1,
            max_buffer: 2,
            ..Default::default()
        })
        .enable(provider)
        .start_and_process()
        .unwrap();

    backend.inject_all((0..4000).map(|id| RawEvent::new(PROVIDER, id as u16)));
    let stats = trace.query_stats().unwrap();
    println!(
        "before update: {} buffers max, {} events lost",
        stats.max_buffers, stats.events_lost
    );

    let stats = trace
        .update(TraceProperties {
            max_buffer: 64,
            flush_timer: 1,
            ..Default::default()
        })
        .unwrap();
    println!("after update: {} buffers max", stats.max_buffers);

    backend.inject_all((0..4000).map(|id| RawEvent::new(PROVIDER, id as u16)));
    let stats = trace.stop().unwrap();
    handle.join().unwrap().unwrap();
    println!(
        "{} events lost, {} handled out of {}",
        stats.events_lost,
        trace.events_handled(),
        stats.events_total
    );
}
