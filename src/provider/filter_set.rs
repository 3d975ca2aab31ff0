//! Combining the filters of a provider
//!
//! The filters of a provider form a conjunction: a [`FilterChain`]. Because enabling a provider
//! *replaces* whatever filters the native layer had for it, its direct filters are merged into a
//! single [`DirectFilterSet`] handed over in one call.
use std::collections::BTreeSet;

use crate::native::etw_types::EventRecord;
use crate::provider::event_filter::{
    event_names_size, EventFilter, MatchMode, PayloadFilter, MAX_EVENT_FILTER_EVENT_ID_COUNT,
    MAX_EVENT_NAMES_SIZE,
};
use crate::provider::predicate::RecordContext;
use crate::provider::ConfigurationError;
use crate::schema::Schema;

/// The ordered filters of a provider
///
/// A record passes the chain when it passes every filter. Filters are evaluated in attachment order
/// and evaluation stops at the first rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterChain {
    filters: Vec<EventFilter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter, making sure the chain can still be compiled
    pub fn push(&mut self, filter: EventFilter) -> Result<(), ConfigurationError> {
        filter.validate()?;
        self.filters.push(filter);
        if let Err(err) = self.direct_set() {
            self.filters.pop();
            return Err(err);
        }
        Ok(())
    }

    /// A copy of this chain, with one more filter
    pub fn with(&self, filter: EventFilter) -> Result<Self, ConfigurationError> {
        let mut chain = self.clone();
        chain.push(filter)?;
        Ok(chain)
    }

    pub fn filters(&self) -> &[EventFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Merge the direct filters of this chain into what the native layer will evaluate
    ///
    /// The result never rejects a record the conjunction would accept. It may accept more when the
    /// conjunction cannot be expressed with a single descriptor per kind.
    pub fn direct_set(&self) -> Result<DirectFilterSet, ConfigurationError> {
        let mut allowed_ids: Option<BTreeSet<u16>> = None;
        let mut denied_ids = BTreeSet::new();
        let mut all_mask = 0u64;
        let mut any_mask = 0u64;
        let mut pids: Option<BTreeSet<u32>> = None;
        let mut allowed_names: Option<BTreeSet<String>> = None;
        let mut denied_names = BTreeSet::new();
        let mut payloads: Vec<PayloadFilter> = Vec::new();

        for filter in &self.filters {
            match filter {
                EventFilter::EventIds {
                    ids,
                    filter_in: true,
                } => {
                    allowed_ids = Some(match allowed_ids {
                        None => ids.clone(),
                        Some(current) => current.intersection(ids).copied().collect(),
                    });
                }
                EventFilter::EventIds {
                    ids,
                    filter_in: false,
                } => denied_ids.extend(ids.iter().copied()),
                EventFilter::SystemFlags {
                    mask,
                    mode: MatchMode::All,
                } => all_mask |= mask,
                EventFilter::SystemFlags {
                    mask,
                    mode: MatchMode::Any,
                } => any_mask |= mask,
                EventFilter::ProcessIds(list) => {
                    pids = Some(match pids {
                        None => list.clone(),
                        Some(current) => current.intersection(list).copied().collect(),
                    });
                }
                EventFilter::EventNames {
                    names,
                    filter_in: true,
                } => {
                    allowed_names = Some(match allowed_names {
                        None => names.clone(),
                        Some(current) => current.intersection(names).cloned().collect(),
                    });
                }
                EventFilter::EventNames {
                    names,
                    filter_in: false,
                } => denied_names.extend(names.iter().cloned()),
                EventFilter::Payload(payload) => {
                    // Dropping a conjunct only loosens the native side
                    if payloads.iter().any(|kept| kept.event_id() == payload.event_id()) {
                        log::debug!(
                            "a payload filter of event {} is already compiled, this one is only checked in-process",
                            payload.event_id()
                        );
                    } else {
                        payloads.push(payload.clone());
                    }
                }
                EventFilter::Predicate(_) => {}
            }
        }

        let event_ids = match allowed_ids {
            Some(allowed) => {
                let remaining: BTreeSet<u16> = allowed.difference(&denied_ids).copied().collect();
                if remaining.is_empty() {
                    return Err(ConfigurationError::ContradictoryFilters);
                }
                Some(EventIdSet {
                    ids: remaining,
                    filter_in: true,
                })
            }
            None if denied_ids.is_empty() => None,
            None if denied_ids.len() > MAX_EVENT_FILTER_EVENT_ID_COUNT => {
                log::debug!(
                    "{} excluded event ids do not fit a native filter, they will only be checked in-process",
                    denied_ids.len()
                );
                None
            }
            None => Some(EventIdSet {
                ids: denied_ids,
                filter_in: false,
            }),
        };

        // Several "all" masks are one "all" mask. Several "any" masks can only be loosened into their
        // union, and are dropped when an "all" mask is present.
        let system_flags = if all_mask != 0 {
            Some((all_mask, MatchMode::All))
        } else if any_mask != 0 {
            Some((any_mask, MatchMode::Any))
        } else {
            None
        };

        let event_names = match allowed_names {
            Some(allowed) => {
                let remaining: BTreeSet<String> = allowed.difference(&denied_names).cloned().collect();
                if remaining.is_empty() {
                    return Err(ConfigurationError::ContradictoryFilters);
                }
                Some(EventNameSet {
                    names: remaining,
                    filter_in: true,
                })
            }
            None if denied_names.is_empty() => None,
            None if event_names_size(&denied_names) > MAX_EVENT_NAMES_SIZE => {
                log::debug!(
                    "{} excluded event names do not fit a native filter, they will only be checked in-process",
                    denied_names.len()
                );
                None
            }
            None => Some(EventNameSet {
                names: denied_names,
                filter_in: false,
            }),
        };

        let process_ids = match pids {
            Some(pids) if pids.is_empty() => return Err(ConfigurationError::ContradictoryFilters),
            other => other,
        };

        Ok(DirectFilterSet {
            event_ids,
            system_flags,
            process_ids,
            event_names,
            payloads,
        })
    }

    /// Whether a record passes every filter of the chain
    ///
    /// Direct filters are evaluated through their predicate equivalents.
    pub(crate) fn accepts(&self, context: &RecordContext) -> bool {
        self.filters.iter().all(|filter| match filter {
            EventFilter::Predicate(predicate) => predicate.evaluate_in(context),
            direct => direct_accepts(direct, context),
        })
    }
}

fn direct_accepts(filter: &EventFilter, context: &RecordContext) -> bool {
    let record = context.record();
    match filter {
        EventFilter::SystemFlags { mask, mode } => keyword_matches(record.keyword(), *mask, *mode),
        EventFilter::EventIds { ids, filter_in } => ids.contains(&record.event_id()) == *filter_in,
        EventFilter::ProcessIds(pids) => pids.contains(&record.process_id()),
        EventFilter::EventNames { names, filter_in } => {
            name_matches(names, context.schema()) == *filter_in
        }
        // Only decode the payload of the event the filter is about
        EventFilter::Payload(payload) if record.event_id() != payload.event_id() => true,
        EventFilter::Payload(payload) => payload.accepts(record, context.schema()),
        EventFilter::Predicate(_) => true,
    }
}

fn name_matches(names: &BTreeSet<String>, schema: Option<&Schema>) -> bool {
    schema.map_or(false, |schema| names.contains(schema.event_name()))
}

fn keyword_matches(keyword: u64, mask: u64, mode: MatchMode) -> bool {
    match mode {
        MatchMode::Any => keyword & mask != 0,
        MatchMode::All => keyword & mask == mask,
    }
}

/// A merged event-id descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventIdSet {
    pub ids: BTreeSet<u16>,
    pub filter_in: bool,
}

/// A merged event-name descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNameSet {
    pub names: BTreeSet<String>,
    pub filter_in: bool,
}

/// The direct filters of a provider, merged into at most one descriptor per kind
///
/// Payload filters are kept one per event, and are aggregated into a single descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectFilterSet {
    pub event_ids: Option<EventIdSet>,
    pub system_flags: Option<(u64, MatchMode)>,
    pub process_ids: Option<BTreeSet<u32>>,
    pub event_names: Option<EventNameSet>,
    pub payloads: Vec<PayloadFilter>,
}

impl DirectFilterSet {
    pub fn is_empty(&self) -> bool {
        self.event_ids.is_none()
            && self.system_flags.is_none()
            && self.process_ids.is_none()
            && self.event_names.is_none()
            && self.payloads.is_empty()
    }

    /// How many native descriptors this set compiles into
    pub fn descriptor_count(&self) -> usize {
        usize::from(self.event_ids.is_some())
            + usize::from(self.system_flags.is_some())
            + usize::from(self.process_ids.is_some())
            + usize::from(self.event_names.is_some())
            + usize::from(!self.payloads.is_empty())
    }

    /// Evaluate the set the way the native layer does
    ///
    /// `schema` is the schema of the event, if the native layer knows it. Without one, the event has
    /// no name and its payload cannot be checked.
    pub fn accepts(&self, record: &EventRecord, schema: Option<&Schema>) -> bool {
        if let Some(set) = &self.event_names {
            if name_matches(&set.names, schema) != set.filter_in {
                return false;
            }
        }
        if !self
            .payloads
            .iter()
            .all(|payload| payload.accepts(record, schema))
        {
            return false;
        }
        if let Some(set) = &self.event_ids {
            if set.ids.contains(&record.event_id()) != set.filter_in {
                return false;
            }
        }
        if let Some((mask, mode)) = self.system_flags {
            if !keyword_matches(record.keyword(), mask, mode) {
                return false;
            }
        }
        if let Some(pids) = &self.process_ids {
            if !pids.contains(&record.process_id()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::etw_types::EventHeader;
    use crate::native::guid::Guid;
    use crate::native::replay::ReplayEtw;
    use crate::provider::predicate::{CompareOp, Predicate};
    use crate::schema_locator::SchemaLocator;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn record_header(rng: &mut StdRng) -> EventHeader {
        let mut header = EventHeader::new(Guid::from_u128(7), rng.gen_range(0..12));
        header.keyword = rng.gen_range(0..16);
        header.process_id = rng.gen_range(0..6);
        header
    }

    fn random_direct_filter(rng: &mut StdRng) -> EventFilter {
        match rng.gen_range(0..4) {
            0 => EventFilter::event_ids((0..rng.gen_range(1..6)).map(|_| rng.gen_range(0..12))),
            1 => EventFilter::excluded_event_ids((0..rng.gen_range(1..4)).map(|_| rng.gen_range(0..12))),
            2 => EventFilter::system_flags(
                rng.gen_range(1..16),
                if rng.gen_bool(0.5) {
                    MatchMode::Any
                } else {
                    MatchMode::All
                },
            ),
            _ => EventFilter::process_ids((0..rng.gen_range(1..5)).map(|_| rng.gen_range(0..6))),
        }
    }

    #[test]
    fn test_merge() {
        let chain = FilterChain::new()
            .with(EventFilter::event_ids([1, 2, 3]))
            .unwrap()
            .with(EventFilter::event_ids([2, 3, 4]))
            .unwrap()
            .with(EventFilter::excluded_event_ids([3]))
            .unwrap()
            .with(EventFilter::system_flags(0x1, MatchMode::All))
            .unwrap()
            .with(EventFilter::system_flags(0x4, MatchMode::All))
            .unwrap()
            .with(EventFilter::predicate(Predicate::OpcodeEquals(1)))
            .unwrap();

        let set = chain.direct_set().unwrap();
        assert_eq!(
            set.event_ids,
            Some(EventIdSet {
                ids: [2].into_iter().collect(),
                filter_in: true
            })
        );
        assert_eq!(set.system_flags, Some((0x5, MatchMode::All)));
        assert_eq!(set.process_ids, None);
        assert_eq!(set.descriptor_count(), 2);
        assert_eq!(chain.len(), 6);
    }

    #[test]
    fn test_contradictory_filters_are_rejected() {
        let mut chain = FilterChain::new();
        chain.push(EventFilter::event_ids([1, 2])).unwrap();
        assert!(matches!(
            chain.push(EventFilter::event_ids([3])),
            Err(ConfigurationError::ContradictoryFilters)
        ));
        assert!(matches!(
            chain.push(EventFilter::excluded_event_ids([1, 2])),
            Err(ConfigurationError::ContradictoryFilters)
        ));
        // Rejected filters are not kept
        assert_eq!(chain.len(), 1);

        chain.push(EventFilter::process_ids([10])).unwrap();
        assert!(chain.push(EventFilter::process_ids([11])).is_err());
    }

    #[test]
    fn test_predicates_are_not_compiled() {
        let chain = FilterChain::new()
            .with(EventFilter::predicate(Predicate::EventIdEquals(5)))
            .unwrap();
        assert!(chain.direct_set().unwrap().is_empty());
    }

    #[test]
    fn test_event_names_merge() {
        let chain = FilterChain::new()
            .with(EventFilter::event_names(["Start", "Stop", "Info"]))
            .unwrap()
            .with(EventFilter::event_names(["Stop", "Info"]))
            .unwrap()
            .with(EventFilter::excluded_event_names(["Info"]))
            .unwrap();
        let set = chain.direct_set().unwrap();
        assert_eq!(
            set.event_names,
            Some(EventNameSet {
                names: ["Stop".to_string()].into_iter().collect(),
                filter_in: true
            })
        );
        assert_eq!(set.descriptor_count(), 1);

        assert!(matches!(
            chain.with(EventFilter::excluded_event_names(["Stop"])),
            Err(ConfigurationError::ContradictoryFilters)
        ));

        let schema = Schema::new(Guid::from_u128(7), 1).with_event_name("Stop");
        let record = EventRecord::new(EventHeader::new(Guid::from_u128(7), 1), &[], &[]);
        assert!(set.accepts(&record, Some(&schema)));
        // Without a schema, the event has no name
        assert!(!set.accepts(&record, None));
    }

    #[test]
    fn test_one_payload_filter_per_event() {
        let first = PayloadFilter::new(1, &Predicate::field("Value", CompareOp::Eq, 1u32)).unwrap();
        let second = PayloadFilter::new(1, &Predicate::field("Value", CompareOp::Ne, 2u32)).unwrap();
        let other = PayloadFilter::new(2, &Predicate::field("Value", CompareOp::Gt, 3u32)).unwrap();
        let chain = FilterChain::new()
            .with(first.clone().into())
            .unwrap()
            .with(second.into())
            .unwrap()
            .with(other.clone().into())
            .unwrap();

        let set = chain.direct_set().unwrap();
        assert_eq!(set.payloads, vec![first, other]);
        // They are aggregated into one descriptor
        assert_eq!(set.descriptor_count(), 1);
        assert_eq!(chain.len(), 3);
    }

    /// Whatever the direct filters, the merged set accepts everything the chain accepts
    #[test]
    fn test_merged_set_is_never_stricter() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let locator = SchemaLocator::new(Arc::new(ReplayEtw::new()));

        for _ in 0..300 {
            let mut chain = FilterChain::new();
            for _ in 0..rng.gen_range(1..4) {
                // Contradictory combinations are simply not attached
                let _ = chain.push(random_direct_filter(&mut rng));
            }
            let set = chain.direct_set().unwrap();

            for _ in 0..40 {
                let header = record_header(&mut rng);
                let record = EventRecord::new(header, &[], &[]);
                let context = RecordContext::new(&record, &locator);
                if chain.accepts(&context) {
                    assert!(set.accepts(&record, None), "{:?} rejects {:?}", set, header);
                }
            }
        }
    }
}
