//! In-process event predicates
//!
//! A [`Predicate`] is a pure function of a record. It is evaluated on the consumer thread, after the
//! native layer has applied the direct filters, and can express what those cannot: conditions on the
//! decoded payload and arbitrary combinations of conditions.
use once_cell::unsync::OnceCell;
use std::collections::BTreeSet;
use std::convert::TryInto;
use std::sync::Arc;

use crate::native::etw_types::EventRecord;
use crate::native::guid::Guid;
use crate::native::tdh_types::{PropertyInfo, TdhInType};
use crate::parser::Parser;
use crate::provider::ConfigurationError;
use crate::schema::Schema;
use crate::schema_locator::SchemaLocator;

/// Comparison applied between a payload field and a literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Substring match, only for string literals
    Contains,
    StartsWith,
    EndsWith,
}

impl CompareOp {
    pub(crate) fn is_ordering(&self) -> bool {
        matches!(self, CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge)
    }

    pub(crate) fn is_textual(&self) -> bool {
        matches!(
            self,
            CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith
        )
    }

    fn holds<T: PartialOrd + ?Sized>(&self, left: &T, right: &T) -> bool {
        match self {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Contains | CompareOp::StartsWith | CompareOp::EndsWith => false,
        }
    }
}

/// A literal a payload field is compared against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    String(String),
    Guid(Guid),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Unsigned(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Unsigned(value.into())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Signed(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Signed(value.into())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<Guid> for FieldValue {
    fn from(value: Guid) -> Self {
        FieldValue::Guid(value)
    }
}

/// A boolean condition over an event record
///
/// Header predicates only read the event header. [`Predicate::Field`] decodes the payload, using the
/// schema of the event; when the schema is unavailable or the field cannot be decoded as the literal's
/// type, the field predicate is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    EventIdEquals(u16),
    EventIdIn(BTreeSet<u16>),
    ProcessIdEquals(u32),
    ProcessIdIn(BTreeSet<u32>),
    OpcodeEquals(u8),
    /// Level lower or equal (i.e. at least as severe) than this one
    LevelAtMost(u8),
    /// At least one of these keyword bits is set
    KeywordAny(u64),
    /// All of these keyword bits are set
    KeywordAll(u64),
    /// The schema of the event gives it one of these names
    EventNameIn(BTreeSet<String>),
    Field {
        name: String,
        op: CompareOp,
        value: FieldValue,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Shorthand for [`Predicate::Field`]
    pub fn field<V: Into<FieldValue>>(name: &str, op: CompareOp, value: V) -> Self {
        Predicate::Field {
            name: name.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut operands) => {
                operands.push(other);
                Predicate::And(operands)
            }
            this => Predicate::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut operands) => {
                operands.push(other);
                Predicate::Or(operands)
            }
            this => Predicate::Or(vec![this, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Check that this predicate can be evaluated
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Predicate::EventIdIn(ids) if ids.is_empty() => Err(ConfigurationError::EmptyEventIds),
            Predicate::ProcessIdIn(pids) if pids.is_empty() => {
                Err(ConfigurationError::EmptyProcessIds)
            }
            Predicate::EventNameIn(names) => {
                if names.is_empty() || names.iter().any(String::is_empty) {
                    Err(ConfigurationError::EmptyEventNames)
                } else {
                    Ok(())
                }
            }
            Predicate::Field { name, op, value } => {
                if name.is_empty() {
                    return Err(ConfigurationError::EmptyFieldName);
                }
                let compatible = match value {
                    FieldValue::Unsigned(_) | FieldValue::Signed(_) => !op.is_textual(),
                    FieldValue::String(_) => true,
                    FieldValue::Guid(_) => !op.is_textual() && !op.is_ordering(),
                };
                if compatible {
                    Ok(())
                } else {
                    Err(ConfigurationError::IncompatibleOperator {
                        field: name.clone(),
                        op: *op,
                    })
                }
            }
            Predicate::And(operands) | Predicate::Or(operands) => {
                if operands.is_empty() {
                    return Err(ConfigurationError::EmptyCombinator);
                }
                operands.iter().try_for_each(Predicate::validate)
            }
            Predicate::Not(inner) => inner.validate(),
            _ => Ok(()),
        }
    }

    /// Evaluate this predicate against a record
    ///
    /// `And` and `Or` short-circuit, left to right.
    pub fn evaluate(&self, record: &EventRecord, locator: &SchemaLocator) -> bool {
        let context = RecordContext::new(record, locator);
        self.evaluate_in(&context)
    }

    pub(crate) fn evaluate_in(&self, context: &RecordContext) -> bool {
        let record = context.record;
        match self {
            Predicate::EventIdEquals(id) => record.event_id() == *id,
            Predicate::EventIdIn(ids) => ids.contains(&record.event_id()),
            Predicate::ProcessIdEquals(pid) => record.process_id() == *pid,
            Predicate::ProcessIdIn(pids) => pids.contains(&record.process_id()),
            Predicate::OpcodeEquals(opcode) => record.opcode() == *opcode,
            Predicate::LevelAtMost(level) => record.level() <= *level,
            Predicate::KeywordAny(mask) => record.keyword() & mask != 0,
            Predicate::KeywordAll(mask) => record.keyword() & mask == *mask,
            Predicate::EventNameIn(names) => context
                .schema()
                .map_or(false, |schema| names.contains(schema.event_name())),
            Predicate::Field { name, op, value } => match context.schema() {
                Some(schema) => {
                    let parser = Parser::create(record, schema);
                    compare_field(&parser, name, *op, value).unwrap_or(false)
                }
                None => false,
            },
            Predicate::And(operands) => operands.iter().all(|p| p.evaluate_in(context)),
            Predicate::Or(operands) => operands.iter().any(|p| p.evaluate_in(context)),
            Predicate::Not(inner) => !inner.evaluate_in(context),
        }
    }
}

/// A record under evaluation
///
/// The schema is looked up at most once, and only when a field predicate needs it.
pub(crate) struct RecordContext<'a, 'record> {
    record: &'a EventRecord<'record>,
    locator: &'a SchemaLocator,
    schema: OnceCell<Option<Arc<Schema>>>,
}

impl<'a, 'record> RecordContext<'a, 'record> {
    pub(crate) fn new(record: &'a EventRecord<'record>, locator: &'a SchemaLocator) -> Self {
        RecordContext {
            record,
            locator,
            schema: OnceCell::new(),
        }
    }

    pub(crate) fn record(&self) -> &'a EventRecord<'record> {
        self.record
    }

    pub(crate) fn locator(&self) -> &'a SchemaLocator {
        self.locator
    }

    pub(crate) fn schema(&self) -> Option<&Schema> {
        self.schema
            .get_or_init(|| match self.locator.event_schema(self.record) {
                Ok(schema) => Some(schema),
                Err(err) => {
                    log::debug!(
                        "no schema for event {} of {}: {}",
                        self.record.event_id(),
                        self.record.provider_id(),
                        err
                    );
                    None
                }
            })
            .as_deref()
    }
}

fn is_signed(in_type: TdhInType) -> bool {
    matches!(
        in_type,
        TdhInType::InTypeInt8 | TdhInType::InTypeInt16 | TdhInType::InTypeInt32 | TdhInType::InTypeInt64
    )
}

/// Read an integer field, whatever its declared width
fn integer_field(parser: &Parser, name: &str) -> Option<i128> {
    let slice = parser.property_slice(name).ok()?;
    let in_type = match slice.property.info {
        PropertyInfo::Value { in_type, .. } if in_type.is_integer() => in_type,
        _ => return None,
    };
    let buffer = slice.buffer;
    let signed = is_signed(in_type);
    let value = match buffer.len() {
        1 if signed => i128::from(buffer[0] as i8),
        1 => i128::from(buffer[0]),
        2 => {
            let bytes: [u8; 2] = buffer.try_into().ok()?;
            if signed {
                i128::from(i16::from_ne_bytes(bytes))
            } else {
                i128::from(u16::from_ne_bytes(bytes))
            }
        }
        4 => {
            let bytes: [u8; 4] = buffer.try_into().ok()?;
            if signed {
                i128::from(i32::from_ne_bytes(bytes))
            } else {
                i128::from(u32::from_ne_bytes(bytes))
            }
        }
        8 => {
            let bytes: [u8; 8] = buffer.try_into().ok()?;
            if signed {
                i128::from(i64::from_ne_bytes(bytes))
            } else {
                i128::from(u64::from_ne_bytes(bytes))
            }
        }
        _ => return None,
    };
    Some(value)
}

/// Compare a decoded field with a literal, `None` when the field cannot be decoded as the literal's type
pub(crate) fn compare_field(parser: &Parser, name: &str, op: CompareOp, value: &FieldValue) -> Option<bool> {
    match value {
        FieldValue::Unsigned(expected) => {
            let actual = integer_field(parser, name)?;
            Some(op.holds(&actual, &i128::from(*expected)))
        }
        FieldValue::Signed(expected) => {
            let actual = integer_field(parser, name)?;
            Some(op.holds(&actual, &i128::from(*expected)))
        }
        FieldValue::String(expected) => {
            let actual: String = parser.try_parse(name).ok()?;
            let result = match op {
                CompareOp::Contains => actual.contains(expected.as_str()),
                CompareOp::StartsWith => actual.starts_with(expected.as_str()),
                CompareOp::EndsWith => actual.ends_with(expected.as_str()),
                _ => op.holds(actual.as_str(), expected.as_str()),
            };
            Some(result)
        }
        FieldValue::Guid(expected) => {
            let actual: Guid = parser.try_parse(name).ok()?;
            Some(op.holds(&actual, expected))
        }
    }
}
