use crate::event::RawEvent;

/// Decide whether a parsed event may be masked and persisted.
///
/// An event is eligible when it carries a non-null `user_id`. Anything else
/// about the record is accepted as is; new required-field or value-range checks
/// belong here.
pub fn is_eligible(event: &RawEvent) -> bool {
    event.user_id.is_some()
}
