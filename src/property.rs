//! ETW Event Property information
//!
//! The `property` module expose the basic structures that represent the `Properties` an Event contains,
//! based on its [`Schema`](crate::schema::Schema). These `Properties` can then be used to parse accordingly their values.
use crate::native::tdh_types::Property;

/// A located property: its metadata and the bytes it spans in the event payload
///
/// `buffer` is always a sub-slice of the record's user buffer.
#[derive(Clone, Copy, Debug)]
pub struct PropertySlice<'property, 'record> {
    /// Property attributes
    pub property: &'property Property,
    /// Buffer with the Property data
    pub buffer: &'record [u8],
}

impl<'property, 'record> PropertySlice<'property, 'record> {
    pub fn name(&self) -> &'property str {
        &self.property.name
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
