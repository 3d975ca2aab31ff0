//! Two providers, filters on both sides of the native boundary, and decoding, on the in-process facility
use std::sync::Arc;

use etwsession::native::replay::{PayloadBuilder, RawEvent, ReplayEtw};
use etwsession::native::tdh_types::{Property, TdhInType};
use etwsession::parser::Parser;
use etwsession::provider::{CompareOp, EventFilter, Predicate, Provider};
use etwsession::schema::Schema;
use etwsession::schema_locator::SchemaLocator;
use etwsession::trace::TraceSession;
use etwsession::{EventRecord, Guid};

const FILES: Guid = Guid::from_u128(0x8a1d6f40_5c3e_4b8e_9a52_0d6d2f6c1b01);
const NETWORK: Guid = Guid::from_u128(0x8a1d6f40_5c3e_4b8e_9a52_0d6d2f6c1b02);

fn file_callback(record: &EventRecord, schema_locator: &SchemaLocator) {
    match schema_locator.event_schema(record) {
        Ok(schema) => {
            let parser = Parser::create(record, &schema);
            let path: String = parser.try_parse("Path").unwrap_or_default();
            let size: u64 = parser.try_parse("Size").unwrap_or(0);
            println!(
                "[{}] PID {} wrote {} bytes to {}",
                schema.task_name(),
                record.process_id(),
                size,
                path
            );
        }
        Err(err) => println!("Error {:?}", err),
    }
}

fn network_callback(record: &EventRecord, _schema_locator: &SchemaLocator) {
    println!(
        "network event {} from PID {}",
        record.event_id(),
        record.process_id()
    );
}

fn main() {
    env_logger::init();

    let backend = Arc::new(ReplayEtw::new());
    backend.register_provider_name("Demo-Network", NETWORK);
    backend.register_schema(
        Schema::new(FILES, 1)
            .with_provider_name("Demo-Files")
            .with_task_name("Write")
            .with_property(Property::scalar("Path", TdhInType::InTypeUnicodeString))
            .with_property(Property::scalar("Size", TdhInType::InTypeUInt64)),
    );

    // Only large writes, decoded in-process
    let files = Provider::by_guid(FILES)
        .add_filter(EventFilter::event_ids([1]))
        .add_filter(EventFilter::predicate(Predicate::field(
            "Size",
            CompareOp::Ge,
            4096u64,
        )))
        .add_callback(file_callback)
        .build()
        .unwrap();

    let network = Provider::by_name("Demo-Network")
        .add_filter(EventFilter::process_ids([42]))
        .add_callback(network_callback)
        .build()
        .unwrap();

    let (trace, handle) = TraceSession::builder(backend.clone())
        .named(String::from("replay-demo"))
        .enable(files)
        .enable(network)
        .start_and_process()
        .unwrap();

    let writes = [
        (42, "C:\\small.txt", 12u64),
        (42, "C:\\big.bin", 1 << 20),
        (7, "C:\\log.txt", 8192),
    ];
    for (pid, path, size) in writes {
        backend.inject(
            RawEvent::new(FILES, 1)
                .with_process_id(pid)
                .with_user_data(PayloadBuilder::new().utf16z(path).u64(size).build()),
        );
        backend.inject(RawEvent::new(NETWORK, 10).with_process_id(pid));
    }

    let stats = trace.stop().unwrap();
    handle.join().unwrap().unwrap();
    println!(
        "{} events received, {} handled",
        stats.events_total,
        trace.events_handled()
    );
}
