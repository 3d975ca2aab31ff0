bitflags! {
    /// Optional enrichments requested when enabling a provider
    ///
    /// These are the `EVENT_ENABLE_PROPERTY_*` values of `ENABLE_TRACE_PARAMETERS::EnableProperty`.
    /// Most of them make the native layer attach an [`ExtendedDataItem`](crate::native::etw_types::ExtendedDataItem)
    /// to each record.
    ///
    /// See <https://learn.microsoft.com/en-us/windows/win32/api/evntrace/ns-evntrace-enable_trace_parameters>
    #[derive(Default)]
    pub struct TraceFlags: u32 {
        /// Include the SID of the user that logged the event
        const EVENT_ENABLE_PROPERTY_SID = 0x0000_0001;
        /// Include the terminal session identifier
        const EVENT_ENABLE_PROPERTY_TS_ID = 0x0000_0002;
        /// Include a call stack trace
        const EVENT_ENABLE_PROPERTY_STACK_TRACE = 0x0000_0004;
        const EVENT_ENABLE_PROPERTY_PSM_KEY = 0x0000_0008;
        /// Filter out events whose keyword is 0
        const EVENT_ENABLE_PROPERTY_IGNORE_KEYWORD_0 = 0x0000_0010;
        const EVENT_ENABLE_PROPERTY_PROVIDER_GROUP = 0x0000_0020;
        /// Deliver events whose keyword is 0 even when a keyword mask is set
        const EVENT_ENABLE_PROPERTY_ENABLE_KEYWORD_0 = 0x0000_0040;
        /// Include the process start key
        const EVENT_ENABLE_PROPERTY_PROCESS_START_KEY = 0x0000_0080;
        /// Include an event key
        const EVENT_ENABLE_PROPERTY_EVENT_KEY = 0x0000_0100;
        const EVENT_ENABLE_PROPERTY_EXCLUDE_INPRIVATE = 0x0000_0200;
        const EVENT_ENABLE_PROPERTY_ENABLE_SILOS = 0x0000_0400;
        /// Include the container id
        const EVENT_ENABLE_PROPERTY_SOURCE_CONTAINER_TRACKING = 0x0000_0800;
    }
}

impl TraceFlags {
    /// Whether `raw` asks both to ignore and to deliver keyword-0 events
    pub(crate) fn contradictory(raw: u32) -> bool {
        let flags = TraceFlags::from_bits_truncate(raw);
        flags.contains(
            TraceFlags::EVENT_ENABLE_PROPERTY_IGNORE_KEYWORD_0
                | TraceFlags::EVENT_ENABLE_PROPERTY_ENABLE_KEYWORD_0,
        )
    }
}
