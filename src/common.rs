// Shared identifier types used across the crate.

/// Identifier of a replica (originating instance) within a replica set.
/// Zero means "not yet assigned"; the LSN assigner fills it in.
pub type ReplicaId = u32;

/// Log sequence number, monotonically assigned per replica.
pub type Lsn = i64;

/// Sum of all vector clock components. Used to name log files and as a
/// coarse total order over log states.
pub type Signature = i64;

/// Identifier of a two-phase transaction, assigned by the coordinator.
pub type TransactionId = u64;

/// Identifier of the coordinator instance of a two-phase transaction.
pub type CoordinatorId = u32;
