use std::collections::BTreeSet;

use crate::native::etw_types::EventRecord;
use crate::parser::Parser;
use crate::provider::predicate::{compare_field, CompareOp, FieldValue, Predicate};
use crate::provider::ConfigurationError;
use crate::schema::Schema;

/// Maximum number of event ids in a single native filter
///
/// See <https://docs.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_filter_descriptor>
pub const MAX_EVENT_FILTER_EVENT_ID_COUNT: usize = 64;
/// Maximum number of process ids in a single native filter
pub const MAX_EVENT_FILTER_PID_COUNT: usize = 8;
/// System flags are compared on their lower 48 bits only
pub const SYSTEM_FLAGS_MASK_BITS: u32 = 48;
/// Room left for the nul-terminated names of an `EVENT_FILTER_EVENT_NAME` in a 1024-byte filter
pub const MAX_EVENT_NAMES_SIZE: usize = 1024 - 20;
/// Maximum number of conditions of a payload filter (`MAX_PAYLOAD_PREDICATES`)
pub const MAX_PAYLOAD_PREDICATES: usize = 8;

/// How a system-flags mask is compared against the keyword of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchMode {
    /// At least one bit of the mask is set
    Any,
    /// Every bit of the mask is set
    All,
}

/// Specifies how a provider will filter its events
///
/// Every kind but [`EventFilter::Predicate`] is a *direct* filter: they are handed to the native layer, which drops
/// non-matching events before they reach this process. Since native filtering is advisory (some of
/// them are not effective prior to Windows 8.1, [source](https://learn.microsoft.com/en-us/windows/win32/api/evntprov/ns-evntprov-event_filter_descriptor#remarks)),
/// they are checked again in-process.
///
/// [`EventFilter::Predicate`] only exists in-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Filter on the keyword of events
    SystemFlags { mask: u64, mode: MatchMode },
    /// Filter by ETW Event ID, either keeping (`filter_in`) or dropping the listed ids
    EventIds { ids: BTreeSet<u16>, filter_in: bool },
    /// Only keep events emitted by these processes
    ProcessIds(BTreeSet<u32>),
    /// Filter by event name (manifest and TraceLogging events), either keeping (`filter_in`) or
    /// dropping the listed names. Events without a known name never match a name.
    EventNames {
        names: BTreeSet<String>,
        filter_in: bool,
    },
    /// Conditions on the payload of one event, other events are left alone
    Payload(PayloadFilter),
    /// An arbitrary condition, evaluated in-process
    Predicate(Predicate),
}

impl EventFilter {
    pub fn system_flags(mask: u64, mode: MatchMode) -> Self {
        EventFilter::SystemFlags { mask, mode }
    }

    /// Only keep these event ids
    pub fn event_ids<I: IntoIterator<Item = u16>>(ids: I) -> Self {
        EventFilter::EventIds {
            ids: ids.into_iter().collect(),
            filter_in: true,
        }
    }

    /// Drop these event ids
    pub fn excluded_event_ids<I: IntoIterator<Item = u16>>(ids: I) -> Self {
        EventFilter::EventIds {
            ids: ids.into_iter().collect(),
            filter_in: false,
        }
    }

    pub fn process_ids<I: IntoIterator<Item = u32>>(pids: I) -> Self {
        EventFilter::ProcessIds(pids.into_iter().collect())
    }

    /// Only keep the events with these names
    pub fn event_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EventFilter::EventNames {
            names: names.into_iter().map(Into::into).collect(),
            filter_in: true,
        }
    }

    /// Drop the events with these names
    pub fn excluded_event_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EventFilter::EventNames {
            names: names.into_iter().map(Into::into).collect(),
            filter_in: false,
        }
    }

    pub fn predicate(predicate: Predicate) -> Self {
        EventFilter::Predicate(predicate)
    }

    /// Whether the native layer evaluates this filter
    pub fn is_direct(&self) -> bool {
        !matches!(self, EventFilter::Predicate(_))
    }

    /// Check this filter can be compiled and evaluated
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            EventFilter::SystemFlags { mask, .. } => {
                if *mask == 0 || *mask >> SYSTEM_FLAGS_MASK_BITS != 0 {
                    Err(ConfigurationError::InvalidSystemFlagsMask(*mask))
                } else {
                    Ok(())
                }
            }
            EventFilter::EventIds { ids, .. } => match ids.len() {
                0 => Err(ConfigurationError::EmptyEventIds),
                n if n > MAX_EVENT_FILTER_EVENT_ID_COUNT => {
                    Err(ConfigurationError::TooManyEventIds(n))
                }
                _ => Ok(()),
            },
            EventFilter::ProcessIds(pids) => match pids.len() {
                0 => Err(ConfigurationError::EmptyProcessIds),
                n if n > MAX_EVENT_FILTER_PID_COUNT => Err(ConfigurationError::TooManyProcessIds(n)),
                _ => Ok(()),
            },
            EventFilter::EventNames { names, .. } => {
                if names.is_empty() || names.iter().any(String::is_empty) {
                    return Err(ConfigurationError::EmptyEventNames);
                }
                match event_names_size(names) {
                    size if size > MAX_EVENT_NAMES_SIZE => {
                        Err(ConfigurationError::EventNamesTooLarge(size))
                    }
                    _ => Ok(()),
                }
            }
            // Checked when it was built
            EventFilter::Payload(_) => Ok(()),
            EventFilter::Predicate(predicate) => predicate.validate(),
        }
    }

    /// The in-process equivalent of this filter
    pub fn as_predicate(&self) -> Predicate {
        match self {
            EventFilter::SystemFlags {
                mask,
                mode: MatchMode::Any,
            } => Predicate::KeywordAny(*mask),
            EventFilter::SystemFlags {
                mask,
                mode: MatchMode::All,
            } => Predicate::KeywordAll(*mask),
            EventFilter::EventIds {
                ids,
                filter_in: true,
            } => Predicate::EventIdIn(ids.clone()),
            EventFilter::EventIds {
                ids,
                filter_in: false,
            } => Predicate::EventIdIn(ids.clone()).not(),
            EventFilter::ProcessIds(pids) => Predicate::ProcessIdIn(pids.clone()),
            EventFilter::EventNames {
                names,
                filter_in: true,
            } => Predicate::EventNameIn(names.clone()),
            EventFilter::EventNames {
                names,
                filter_in: false,
            } => Predicate::EventNameIn(names.clone()).not(),
            EventFilter::Payload(payload) => payload.as_predicate(),
            EventFilter::Predicate(predicate) => predicate.clone(),
        }
    }
}

impl From<PayloadFilter> for EventFilter {
    fn from(payload: PayloadFilter) -> Self {
        EventFilter::Payload(payload)
    }
}

impl From<Predicate> for EventFilter {
    fn from(predicate: Predicate) -> Self {
        EventFilter::Predicate(predicate)
    }
}

/// Size of the nul-terminated names, as laid out in a native filter
pub(crate) fn event_names_size(names: &BTreeSet<String>) -> usize {
    names.iter().map(|name| name.len() + 1).sum()
}

/// One comparison of a payload filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadCondition {
    pub field: String,
    pub op: CompareOp,
    pub value: FieldValue,
}

impl PayloadCondition {
    fn from_predicate(predicate: &Predicate) -> Result<Self, ConfigurationError> {
        let (field, op, value) = match predicate {
            Predicate::Field { name, op, value } => (name, *op, value),
            other => {
                return Err(ConfigurationError::UnsupportedPayloadFilter(format!(
                    "{:?} is not a field comparison",
                    other
                )))
            }
        };
        predicate.validate()?;

        let supported = match value {
            FieldValue::Unsigned(_) | FieldValue::Signed(_) => !op.is_textual(),
            FieldValue::String(_) => matches!(op, CompareOp::Eq | CompareOp::Ne | CompareOp::Contains),
            FieldValue::Guid(_) => false,
        };
        if !supported {
            return Err(ConfigurationError::UnsupportedPayloadFilter(format!(
                "{:?} on field {:?} with {:?}",
                op, field, value
            )));
        }
        Ok(PayloadCondition {
            field: field.clone(),
            op,
            value: value.clone(),
        })
    }

    fn as_predicate(&self) -> Predicate {
        Predicate::Field {
            name: self.field.clone(),
            op: self.op,
            value: self.value.clone(),
        }
    }
}

/// Field comparisons the native layer evaluates on the payload of one event
///
/// Built from a field predicate, or from an `And` (every condition must hold) or an `Or` (one is enough)
/// of field predicates. Only integer comparisons, and string equality, inequality and containment fit.
/// Records of other events are not affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFilter {
    event_id: u16,
    version: u8,
    conditions: Vec<PayloadCondition>,
    match_any: bool,
}

impl PayloadFilter {
    /// Apply `predicate` to the payload of the events `event_id`
    pub fn new(event_id: u16, predicate: &Predicate) -> Result<Self, ConfigurationError> {
        let (operands, match_any) = match predicate {
            Predicate::And(operands) => (operands.as_slice(), false),
            Predicate::Or(operands) => (operands.as_slice(), true),
            single => (std::slice::from_ref(single), false),
        };
        if operands.is_empty() {
            return Err(ConfigurationError::EmptyCombinator);
        }
        if operands.len() > MAX_PAYLOAD_PREDICATES {
            return Err(ConfigurationError::UnsupportedPayloadFilter(format!(
                "{} conditions, at most {} are supported",
                operands.len(),
                MAX_PAYLOAD_PREDICATES
            )));
        }
        let conditions = operands
            .iter()
            .map(PayloadCondition::from_predicate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PayloadFilter {
            event_id,
            version: 0,
            conditions,
            match_any,
        })
    }

    /// The version of the event, which the native layer needs to find its manifest
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn event_id(&self) -> u16 {
        self.event_id
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn conditions(&self) -> &[PayloadCondition] {
        &self.conditions
    }

    /// Whether one condition is enough (rather than all of them)
    pub fn match_any(&self) -> bool {
        self.match_any
    }

    /// The in-process equivalent: either another event, or matching conditions
    pub fn as_predicate(&self) -> Predicate {
        let conditions: Vec<Predicate> = self.conditions.iter().map(PayloadCondition::as_predicate).collect();
        let matching = if self.match_any {
            Predicate::Or(conditions)
        } else {
            Predicate::And(conditions)
        };
        Predicate::EventIdEquals(self.event_id).not().or(matching)
    }

    /// Evaluate the filter on a record, `schema` being the one of its event if known
    pub(crate) fn accepts(&self, record: &EventRecord, schema: Option<&Schema>) -> bool {
        if record.event_id() != self.event_id {
            return true;
        }
        let schema = match schema {
            Some(schema) => schema,
            None => return false,
        };
        let parser = Parser::create(record, schema);
        let holds = |condition: &PayloadCondition| {
            compare_field(&parser, &condition.field, condition.op, &condition.value).unwrap_or(false)
        };
        if self.match_any {
            self.conditions.iter().any(holds)
        } else {
            self.conditions.iter().all(holds)
        }
    }
}
