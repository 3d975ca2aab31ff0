#![cfg(feature = "serde")]

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde_json::json;

use etwsession::native::etw_types::ExtendedDataItem;
use etwsession::native::replay::{PayloadBuilder, RawEvent, ReplayEtw};
use etwsession::native::tdh_types::{Property, PropertyCount, TdhInType, TdhOutType};
use etwsession::provider::{Provider, TraceFlags};
use etwsession::schema::Schema;
use etwsession::schema_locator::SchemaLocator;
use etwsession::trace::TraceSession;
use etwsession::{EventRecord, EventSerializer, EventSerializerOptions, Guid, Sid};

mod utils;
use utils::{init_logs, Collector, TEST_PROVIDER};

const CORRELATION: Guid = Guid::from_u128(0x0f0e0d0c_0b0a_0908_0706_050403020100);

fn rich_schema() -> Schema {
    Schema::new(TEST_PROVIDER, 7)
        .with_provider_name("Test-Provider ")
        .with_task_name("Connect")
        .with_opcode_name("Start")
        .with_property(Property::scalar("Flag", TdhInType::InTypeBoolean))
        .with_property(Property::scalar("Small", TdhInType::InTypeInt8))
        .with_property(Property::scalar("Port", TdhInType::InTypeUInt16))
        .with_property(Property::new(
            "Address",
            TdhInType::InTypeUInt32,
            TdhOutType::OutTypeIpv4,
        ))
        .with_property(Property::scalar("Delta", TdhInType::InTypeInt64))
        .with_property(Property::scalar("Ratio", TdhInType::InTypeDouble))
        .with_property(Property::scalar("Image", TdhInType::InTypeUnicodeString))
        .with_property(Property::scalar("Command", TdhInType::InTypeAnsiString))
        .with_property(Property::scalar("Correlation", TdhInType::InTypeGuid))
        .with_property(Property::scalar("User", TdhInType::InTypeSid))
        .with_property(Property::array(
            "Samples",
            TdhInType::InTypeUInt16,
            PropertyCount::Count(3),
        ))
}

fn rich_event() -> RawEvent {
    let payload = PayloadBuilder::new()
        .bool(true)
        .i8(-3)
        .u16(443)
        .bytes(&Ipv4Addr::new(10, 0, 0, 1).octets())
        .i64(-1_000_000_000_000)
        .f64(0.25)
        .utf16z("C:\\Windows\\notepad.exe")
        .ansiz("notepad readme.txt")
        .guid(CORRELATION)
        .sid(&Sid::new(5, &[18]))
        .u16(1)
        .u16(2)
        .u16(3)
        .build();
    RawEvent::new(TEST_PROVIDER, 7)
        .with_level(4)
        .with_process_id(1234)
        .with_thread_id(5678)
        .with_user_data(payload)
        .with_extended_data(ExtendedDataItem::TsId(1))
}

/// Serialize every event of TEST_PROVIDER with `options`, as a handler would
fn serialize_events(
    schemas: Vec<Schema>,
    events: Vec<RawEvent>,
    options: EventSerializerOptions,
) -> Vec<Result<serde_json::Value, String>> {
    let backend = Arc::new(ReplayEtw::new());
    for schema in schemas {
        backend.register_schema(schema);
    }
    let serialized = Collector::new();

    let serialized_by_handler = serialized.clone();
    let provider = Provider::by_guid(TEST_PROVIDER)
        .trace_flags(TraceFlags::EVENT_ENABLE_PROPERTY_TS_ID)
        .add_callback(move |record: &EventRecord, schema_locator: &SchemaLocator| {
            let schema = schema_locator.event_schema(record).unwrap();
            let ser = EventSerializer::new(record, &schema, options);
            serialized_by_handler.push(serde_json::to_value(ser).map_err(|err| err.to_string()));
        })
        .build()
        .unwrap();

    let (trace, handle) = TraceSession::builder(backend.clone())
        .enable(provider)
        .start_and_process()
        .unwrap();
    backend.inject_all(events);
    trace.stop().unwrap();
    handle.join().unwrap().unwrap();
    serialized.values()
}

#[test]
fn serialize_properties() {
    init_logs();
    let options = EventSerializerOptions {
        include_extended_data: true,
        ..Default::default()
    };
    let values = serialize_events(vec![rich_schema()], vec![rich_event()], options);
    assert_eq!(values.len(), 1);
    let value = values[0].as_ref().unwrap();

    assert_eq!(
        value["Event"],
        json!({
            "Flag": true,
            "Small": -3,
            "Port": 443,
            "Address": "10.0.0.1",
            "Delta": -1_000_000_000_000i64,
            "Ratio": 0.25,
            "Image": "C:\\Windows\\notepad.exe",
            "Command": "notepad readme.txt",
            "Correlation": CORRELATION.to_string(),
            "User": "S-1-5-18",
            "Samples": [1, 2, 3],
        })
    );

    assert_eq!(value["Schema"]["Provider"], "Test-Provider");
    assert_eq!(value["Schema"]["Task"], "Connect");
    assert_eq!(value["Schema"]["Opcode"], "Start");

    let header = &value["Header"];
    assert_eq!(header["ProcessId"], 1234);
    assert_eq!(header["ThreadId"], 5678);
    assert_eq!(header["ProviderId"], TEST_PROVIDER.to_string());
    assert_eq!(header["Descriptor"]["Id"], 7);
    assert_eq!(header["Descriptor"]["Level"], 4);

    assert_eq!(value["Extended"].as_array().map(Vec::len), Some(1));
}

#[test]
fn serialize_without_schema_and_header() {
    init_logs();
    let options = EventSerializerOptions {
        include_schema: false,
        include_header: false,
        ..Default::default()
    };
    let values = serialize_events(vec![rich_schema()], vec![rich_event()], options);
    let value = values[0].as_ref().unwrap();

    let object = value.as_object().unwrap();
    assert!(!object.contains_key("Schema"));
    assert!(!object.contains_key("Header"));
    assert!(!object.contains_key("Extended"));
    assert_eq!(value["Event"]["Port"], 443);
}

fn unsupported_schema() -> Schema {
    Schema::new(TEST_PROVIDER, 8)
        .with_property(Property::scalar("Count", TdhInType::InTypeUInt32))
        .with_property(Property::array(
            "Names",
            TdhInType::InTypeUnicodeString,
            PropertyCount::Count(2),
        ))
}

#[test]
fn unimplemented_properties() {
    init_logs();
    let event = RawEvent::new(TEST_PROVIDER, 8)
        .with_user_data(PayloadBuilder::new().u32(2).utf16z("a").utf16z("b").build());

    let skipped = serialize_events(
        vec![unsupported_schema()],
        vec![event.clone()],
        EventSerializerOptions::default(),
    );
    assert_eq!(skipped[0].as_ref().unwrap()["Event"], json!({ "Count": 2 }));

    let options = EventSerializerOptions {
        fail_unimplemented: true,
        ..Default::default()
    };
    let failed = serialize_events(vec![unsupported_schema()], vec![event], options);
    assert!(failed[0].as_ref().unwrap_err().contains("Names"));
}

#[test]
fn malformed_payloads_are_errors() {
    init_logs();
    // Ends before "Correlation"
    let event = RawEvent::new(TEST_PROVIDER, 7).with_user_data(
        PayloadBuilder::new()
            .bool(false)
            .i8(0)
            .u16(80)
            .u32(0)
            .i64(0)
            .f64(0.0)
            .build(),
    );
    let values = serialize_events(
        vec![rich_schema()],
        vec![event],
        EventSerializerOptions::default(),
    );
    assert_eq!(values.len(), 1);
    assert!(values[0].is_err());
}
