//! Larder - encrypted, self-healing local persistence
//!
//! Typed values are stored per key in a pluggable key-value backend, sealed
//! in versioned AEAD envelopes and rotated into a small ring of backups.
//! Loads never fail: a corrupted primary is recovered from the newest usable
//! backup, and with nothing usable the caller's default is returned.
//!
//! Around storage sit the pieces that keep callers working when the world
//! misbehaves:
//! - [`resilience`]: retry with backoff, circuit breaking, recovery supervision
//! - [`network`]: reachability probing and connectivity subscriptions

pub mod crypto;
pub mod network;
pub mod persistence;
pub mod resilience;
