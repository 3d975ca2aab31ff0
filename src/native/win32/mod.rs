//! The real ETW facility
//!
//! [`Win32Etw`] drives the native evntrace/tdh/pla APIs. Starting sessions requires the process to be
//! elevated (or a member of the _Performance Log Users_ group).
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use windows::Win32::System::Diagnostics::Etw;

use crate::native::etw_types::{ControlValues, EventRecord};
use crate::native::guid::Guid;
use crate::native::{
    ConsumerHandle, EnableParameters, EtwBackend, NativeError, NativeResult, NativeStats,
    RecordSink, SessionHandle, TraceSource,
};
use crate::provider::filter_set::DirectFilterSet;
use crate::schema::Schema;
use crate::trace::TraceProperties;

mod evntrace;
mod pla;
mod tdh;

use evntrace::{EventTraceLogfile, EventTraceProperties};

struct NativeSession {
    name: String,
}

struct NativeConsumer {
    // Boxed so that the address given as the user context stays put
    sink: Box<Arc<dyn RecordSink>>,
    processing: bool,
    closed: bool,
}

#[derive(Default)]
struct Handles {
    sessions: HashMap<u64, NativeSession>,
    consumers: HashMap<u64, NativeConsumer>,
}

/// The Windows ETW backend
#[derive(Default)]
pub struct Win32Etw {
    handles: Mutex<Handles>,
}

impl std::fmt::Debug for Win32Etw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Win32Etw")
            .field("sessions", &handles.sessions.len())
            .field("consumers", &handles.consumers.len())
            .finish()
    }
}

impl Win32Etw {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_name(&self, session: SessionHandle) -> NativeResult<String> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles
            .sessions
            .get(&session.as_raw())
            .map(|s| s.name.clone())
            .ok_or(NativeError::InvalidHandle)
    }

    fn control(
        &self,
        session: SessionHandle,
        mut properties: EventTraceProperties,
        control: ControlValues,
    ) -> NativeResult<NativeStats> {
        evntrace::control_trace(session.as_raw(), &mut properties, control)
    }
}

impl EtwBackend for Win32Etw {
    fn start_session(
        &self,
        name: &str,
        properties: &TraceProperties,
    ) -> NativeResult<SessionHandle> {
        let mut native = EventTraceProperties::new(name, properties);
        let handle = evntrace::start_trace(&mut native)?;
        log::debug!("started native session {} ({:#x})", name, handle);

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.sessions.insert(
            handle,
            NativeSession {
                name: name.to_string(),
            },
        );
        Ok(SessionHandle::from_raw(handle))
    }

    fn enable_provider(
        &self,
        session: SessionHandle,
        params: &EnableParameters,
    ) -> NativeResult<()> {
        evntrace::enable_trace(
            session.as_raw(),
            Etw::EVENT_CONTROL_CODE_ENABLE_PROVIDER,
            params,
        )
    }

    fn disable_provider(&self, session: SessionHandle, guid: Guid) -> NativeResult<()> {
        let params = EnableParameters {
            guid,
            level: 0,
            any: 0,
            all: 0,
            trace_flags: 0,
            filters: DirectFilterSet::default(),
        };
        evntrace::enable_trace(
            session.as_raw(),
            Etw::EVENT_CONTROL_CODE_DISABLE_PROVIDER,
            &params,
        )
    }

    fn capture_state(
        &self,
        session: SessionHandle,
        params: &EnableParameters,
    ) -> NativeResult<()> {
        evntrace::enable_trace(
            session.as_raw(),
            Etw::EVENT_CONTROL_CODE_CAPTURE_STATE,
            params,
        )
    }

    fn query_session(&self, session: SessionHandle) -> NativeResult<NativeStats> {
        let name = self.session_name(session)?;
        self.control(
            session,
            EventTraceProperties::for_control(&name),
            ControlValues::Query,
        )
    }

    fn update_session(
        &self,
        session: SessionHandle,
        properties: &TraceProperties,
    ) -> NativeResult<NativeStats> {
        let name = self.session_name(session)?;
        self.control(
            session,
            EventTraceProperties::new(&name, properties),
            ControlValues::Update,
        )
    }

    fn stop_session(&self, session: SessionHandle) -> NativeResult<NativeStats> {
        let name = self.session_name(session)?;
        let stats = self.control(
            session,
            EventTraceProperties::for_control(&name),
            ControlValues::Stop,
        )?;
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.sessions.remove(&session.as_raw());
        Ok(stats)
    }

    fn open_consumer(
        &self,
        source: &TraceSource,
        sink: Arc<dyn RecordSink>,
    ) -> NativeResult<ConsumerHandle> {
        let sink = Box::new(sink);
        let context = sink.as_ref() as *const Arc<dyn RecordSink>;
        let logfile = match source {
            TraceSource::Live(name) => EventTraceLogfile::live(name, context),
            TraceSource::File(path) => EventTraceLogfile::file(path, context),
        };

        // The lock is held across OpenTraceW so that a concurrent close cannot see a half-registered consumer
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = evntrace::open_trace(logfile)?;
        handles.consumers.insert(
            handle,
            NativeConsumer {
                sink,
                processing: false,
                closed: false,
            },
        );
        Ok(ConsumerHandle::from_raw(handle))
    }

    fn process(&self, consumer: ConsumerHandle) -> NativeResult<()> {
        {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            match handles.consumers.get_mut(&consumer.as_raw()) {
                Some(c) if !c.closed => c.processing = true,
                Some(_) => return Err(NativeError::Closed),
                None => return Err(NativeError::InvalidHandle),
            }
        }

        let result = evntrace::process_trace(consumer.as_raw());

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let closed = match handles.consumers.get_mut(&consumer.as_raw()) {
            Some(c) => {
                c.processing = false;
                c.closed
            }
            None => false,
        };
        if closed {
            // Dropping the sink is fine now: ProcessTrace will not call the thunk anymore
            handles.consumers.remove(&consumer.as_raw());
        }
        result
    }

    fn close_consumer(&self, consumer: ConsumerHandle) -> NativeResult<()> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let processing = match handles.consumers.get_mut(&consumer.as_raw()) {
            Some(c) if c.closed => return Ok(()),
            Some(c) => {
                c.closed = true;
                c.processing
            }
            None => return Err(NativeError::InvalidHandle),
        };
        evntrace::close_trace(consumer.as_raw())?;
        if !processing {
            handles.consumers.remove(&consumer.as_raw());
        }
        Ok(())
    }

    fn resolve_provider_name(&self, name: &str) -> NativeResult<Guid> {
        pla::provider_guid(name)
    }

    fn event_schema(&self, record: &EventRecord) -> NativeResult<Schema> {
        tdh::schema_from_tdh(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_handles() {
        let etw = Win32Etw::new();
        assert!(matches!(
            etw.query_session(SessionHandle::from_raw(42)),
            Err(NativeError::InvalidHandle)
        ));
        assert!(matches!(
            etw.close_consumer(ConsumerHandle::from_raw(42)),
            Err(NativeError::InvalidHandle)
        ));
        assert!(matches!(
            etw.process(ConsumerHandle::from_raw(42)),
            Err(NativeError::InvalidHandle)
        ));
    }
}
