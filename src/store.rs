use crate::flag::Flag;
use crate::segment::Segment;

/// Read access to the flags and segments currently held by the data store.
///
/// A missing key means the item is unknown, which is not an error: a missing prerequisite fails
/// the prerequisite and a missing segment does not match.
pub trait Store {
    /// Retrieve the flag with key `flag_key`.
    fn flag(&self, flag_key: &str) -> Option<Flag>;

    /// Retrieve the segment with key `segment_key`.
    fn segment(&self, segment_key: &str) -> Option<Segment>;
}
