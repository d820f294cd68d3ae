//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity of their own; they are embedded by
/// composition inside entities (`Timing` and `LockState` inside a job or a
/// namespace) and compared by their attribute values.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
