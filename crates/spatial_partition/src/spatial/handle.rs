//! Partition handles

use slotmap::new_key_type;

new_key_type! {
    /// Stable identifier of one tracked object.
    ///
    /// Generation checked: a handle keeps naming the same object for its
    /// whole lifetime and goes stale once the object is destroyed.
    pub struct PartitionHandle;
}
