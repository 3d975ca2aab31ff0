//! Trace process exits on the real ETW facility (Windows only, needs an elevated prompt)
use etwsession::native::etw_types::EventRecord;
use etwsession::parser::Parser;
use etwsession::schema_locator::SchemaLocator;

fn process_callback(record: &EventRecord, schema_locator: &SchemaLocator) {
    match schema_locator.event_schema(record) {
        Ok(schema) => {
            if record.event_id() == 2 {
                let parser = Parser::create(record, &schema);
                let process_id: u32 = parser.try_parse("ProcessID").unwrap_or(0);
                let exit_code: u32 = parser.try_parse("ExitCode").unwrap_or(0);
                let image_name: String = parser.try_parse("ImageName").unwrap_or_default();
                println!(
                    "{}: PID: {}, ExitCode: {}, ImageName: {}",
                    schema.provider_name(),
                    process_id,
                    exit_code,
                    image_name
                );
            }
        }
        Err(err) => println!("Error {:?}", err),
    };
}

#[cfg(windows)]
fn main() {
    use std::sync::Arc;
    use std::time::Duration;

    use etwsession::native::win32::Win32Etw;
    use etwsession::provider::Provider;
    use etwsession::trace::TraceSession;

    env_logger::init(); // this is optional. This makes the (rare) error logs of etwsession to be printed to stderr

    let process_provider = Provider::by_guid("22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716") // Microsoft-Windows-Kernel-Process
        .add_callback(process_callback)
        .build()
        .unwrap();

    let (trace, handle) = TraceSession::builder(Arc::new(Win32Etw::new()))
        .named(String::from("MyProvider"))
        .enable(process_provider)
        .start_and_process()
        .unwrap();

    std::thread::sleep(Duration::new(20, 0));
    let stats = trace.stop().unwrap();
    handle.join().unwrap().unwrap();
    println!(
        "{} events handled, {} lost",
        stats.events_handled, stats.events_lost
    );
}

#[cfg(not(windows))]
fn main() {
    let _ = process_callback;
    eprintln!("this demo needs the Windows ETW facility, see the replay_session demo instead");
}
