//! # ETW trace sessions
//! This crate manages trace sessions over Event Tracing for Windows: it attaches providers to a session,
//! filters their events on both sides of the native boundary and decodes event payloads lazily.
//!
//! Its architecture follows [KrabsETW](https://github.com/microsoft/krabsetw/).
//!
//! # What's ETW
//! Event Tracing for Windows (ETW) is an efficient kernel-level tracing facility that lets you log
//! kernel or application-defined events to a log file. You can consume the events in real time or
//! from a log file and use them to debug an application or to determine where performance issues
//! are occurring in the application. [Source]
//!
//! ETW is made out of three components:
//! * Controllers
//! * Providers
//! * Consumers
//!
//! This crate provides the means to start and stop a controller, enable/disable providers and
//! finally to consume the events within our own defined callback.<br/>
//! It is also able to process events from a recorded trace instead of a real-time session.
//!
//! # Native backends
//! A session never calls the OS itself, it drives an [`EtwBackend`](native::EtwBackend):
//! * `native::win32::Win32Etw` (Windows only) talks to the real ETW APIs,
//! * [`native::replay::ReplayEtw`] is an in-process facility that can be fed with events, or with recorded
//!   traces. It runs everywhere, which makes it the backend of choice for tests.
//!
//! # Filtering
//! A provider may carry several [`EventFilter`](provider::EventFilter)s, which must all pass for its
//! handlers to run:
//! * *direct* filters (event ids, process ids, keyword masks, event names, payload conditions) are merged
//!   and handed to the native layer, which drops most non-matching events before they reach this
//!   process. They are checked again in-process, so that a lax native layer does not leak events,
//! * [`Predicate`](provider::Predicate)s are evaluated in-process, and may look at the event payload.
//!
//! # Getting started
//!
//! ```
//! use std::sync::Arc;
//! use etwsession::EventRecord;
//! use etwsession::native::replay::ReplayEtw;
//! use etwsession::schema_locator::SchemaLocator;
//! use etwsession::parser::Parser;
//! use etwsession::provider::{EventFilter, Provider};
//! use etwsession::trace::TraceSession;
//!
//! fn process_callback(record: &EventRecord, schema_locator: &SchemaLocator) {
//!     // Basic event scrutinizing can be done directly from the `EventRecord`
//!     if record.event_id() == 1 {
//!         // More advanced info can be retrieved from the event schema
//!         // (the SchemaLocator caches the schema for a given kind of event, so this call is cheap in case you've already encountered the same event kind previously)
//!         match schema_locator.event_schema(record) {
//!             Err(err) => println!("Error {:?}", err),
//!             Ok(schema) => {
//!                 println!("Received an event from provider {}", schema.provider_name());
//!
//!                 // Finally, properties for a given event can be retrieved using a Parser
//!                 let parser = Parser::create(record, &schema);
//!
//!                 // You'll need type inference to tell etwsession what type you want to parse into
//!                 // In actual code, be sure to correctly handle Err values!
//!                 let process_id: Option<u32> = parser.try_parse("ProcessID").ok();
//!                 let image_name: Option<String> = parser.try_parse("ImageName").ok();
//!                 println!("PID: {:?} ImageName: {:?}", process_id, image_name);
//!             }
//!         }
//!     }
//! }
//!
//! fn main() {
//!     // First we build a Provider
//!     let process_provider = Provider
//!         ::by_guid("22fb2cd6-0e7b-422b-a0c7-2fad1fd0e716") // Microsoft-Windows-Kernel-Process
//!         .add_callback(process_callback)
//!         // .add_callback(process_callback) // it is possible to add multiple callbacks for a given provider
//!         .add_filter(EventFilter::event_ids([1, 2]))
//!         .build()
//!         .unwrap();
//!
//!     // We start a real-time trace session for the previously registered provider
//!     // Callbacks will be run in a separate thread.
//!     let backend = Arc::new(ReplayEtw::new());
//!     let (trace, handle) = TraceSession::builder(backend)
//!         .named(String::from("MyTrace"))
//!         .enable(process_provider)
//!         // .enable(other_provider) // It is possible to enable multiple providers on the same trace.
//!         .start_and_process()       // This call will spawn the thread for you.
//!         .unwrap();
//!
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//!
//!     // We stop the trace
//!     trace.close().unwrap();
//!     handle.join().unwrap().unwrap();
//! }
//! ```
//!
//! [Source]: https://docs.microsoft.com/en-us/windows/win32/etw/about-event-tracing
//!
//! # Log messages
//! etwsession writes log messages using the [`log`](https://docs.rs/log/latest/log/) crate.<br/>
//! In case you want them to be printed to the console, your binary should use one of the various logger implementations. [`env_logger`](https://docs.rs/env_logger/latest/env_logger/) is one of them.<br/>
//! You can have a look at how to use it in the `demos/` folder.

#[cfg(windows)]
#[macro_use]
extern crate memoffset;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate num_derive;
extern crate num_traits;

pub mod native;
pub mod parser;
pub mod property;
pub mod provider;
pub mod schema;
pub mod schema_locator;
#[cfg(feature = "serde")]
pub mod ser;
pub mod trace;
mod traits;
mod utils;

// Convenience re-exports.
pub use crate::native::etw_types::EventRecord;
pub use crate::native::guid::Guid;
pub use crate::native::sid::Sid;
pub use crate::provider::EtwCallback;
pub use crate::schema_locator::SchemaLocator;
#[cfg(feature = "serde")]
pub use crate::ser::{EventSerializer, EventSerializerOptions};
pub use crate::trace::TraceSession;
