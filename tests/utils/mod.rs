#![allow(dead_code)] // every test crate uses a different subset of these helpers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::mpsc::{RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use etwsession::native::replay::{PayloadBuilder, RawEvent};
use etwsession::native::tdh_types::{Property, TdhInType};
use etwsession::schema::Schema;
use etwsession::Guid;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// A provider that only exists in these tests
pub const TEST_PROVIDER: Guid = Guid::from_u128(0x5770385f_c22a_43e0_bf4c_06f5698ffbd9);
pub const OTHER_PROVIDER: Guid = Guid::from_u128(0x1c95126e_7eea_49a9_a3fe_a378b03ddb4d);

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Debug)]
pub enum TestKind {
    /// Test will pass if a success has been notified in the test duration
    ExpectSuccess,
    /// Test will pass if no failure has been notified in the test duration
    ExpectNoFailure,
}

#[derive(Clone, Debug)] // mpsc channels are clone-able to be shared between threads
pub struct StatusNotifier {
    kind: TestKind,
    tx: mpsc::SyncSender<()>,
}

impl StatusNotifier {
    pub fn notify_success(&self) {
        if let TestKind::ExpectSuccess = self.kind {
            self.send();
        }
    }

    pub fn notify_failure(&self) {
        if let TestKind::ExpectNoFailure = self.kind {
            self.send();
        }
    }

    fn send(&self) {
        match self.tx.try_send(()) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => (), // this means we've sent a signal already, we don't care
            Err(TrySendError::Disconnected(_)) => (), // Handlers can outlive the function that started the trace
        }
    }
}

#[derive(Debug)]
pub struct Status {
    notifier: StatusNotifier,
    rx: mpsc::Receiver<()>,
}

impl Status {
    pub fn new(kind: TestKind) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self {
            notifier: StatusNotifier { kind, tx },
            rx,
        }
    }

    pub fn notifier(&self) -> StatusNotifier {
        self.notifier.clone()
    }

    pub fn assert_passed(&self) {
        self.assert_passed_within(TIMEOUT)
    }

    pub fn assert_passed_within(&self, timeout: Duration) {
        match (&self.notifier.kind, self.rx.recv_timeout(timeout)) {
            (TestKind::ExpectSuccess, Ok(())) => (),
            (TestKind::ExpectSuccess, Err(RecvTimeoutError::Timeout)) => {
                panic!("Test did not pass within the allowed timeout")
            }
            (TestKind::ExpectNoFailure, Ok(())) => {
                panic!("Test failed within the allowed timeout")
            }
            (TestKind::ExpectNoFailure, Err(RecvTimeoutError::Timeout)) => (),
            (_, Err(RecvTimeoutError::Disconnected)) => {
                panic!("Should not happen, the sending end has not hung up.")
            }
        }
    }
}

/// Counts handler invocations, shareable with handlers
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Wait until at least `expected` calls have been counted
    pub fn wait_for(&self, expected: usize) {
        wait_until(|| self.get() >= expected);
    }
}

/// Collects values seen by handlers, in dispatch order
#[derive(Clone, Debug, Default)]
pub struct Collector<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone> Collector<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, value: T) {
        self.0.lock().unwrap().push(value);
    }

    pub fn values(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub fn wait_until<F: Fn() -> bool>(condition: F) {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > TIMEOUT {
            panic!("condition not met within {:?}", TIMEOUT);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// The schema of the test events: a `u32` "Value", then a NUL-terminated "Name"
pub fn value_schema(provider: Guid, event_id: u16) -> Schema {
    Schema::new(provider, event_id)
        .with_provider_name("Test-Provider")
        .with_task_name("Test")
        .with_opcode_name("Info")
        .with_property(Property::scalar("Value", TdhInType::InTypeUInt32))
        .with_property(Property::scalar("Name", TdhInType::InTypeUnicodeString))
}

pub fn value_event(provider: Guid, event_id: u16, value: u32, name: &str) -> RawEvent {
    RawEvent::new(provider, event_id)
        .with_level(4)
        .with_user_data(PayloadBuilder::new().u32(value).utf16z(name).build())
}
