// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Distinguished error kinds for the store and switch.
//!
//! These mirror the table in the specification's error-handling design: a
//! closed set of named kinds rather than an open-ended `anyhow`-style
//! catch-all. Sentinels (`bucket-does-not-exist`, `bucket-not-empty`) are
//! never folded into this type — callers that care about them get a plain
//! `RemoveOutcome` return value instead, since the spec requires them to be
//! absorbed, not propagated as errors.

use crate::codec::CodecError;
use thiserror::Error;

/// Errors surfaced by the [`crate::channel_store::ChannelStore`] and
/// [`crate::nursery::NurseryStore`].
#[derive(Debug, Error)]
pub enum StoreError {
	/// The store was never initialized (top-level buckets absent).
	#[error("channel store not initialized")]
	NoChanDb,

	/// The node or channel index bucket is missing; enumeration callers
	/// should treat this as "no channels," not a failure.
	#[error("no active channels for this index")]
	NoActiveChannels,

	/// The per-channel delta log bucket does not exist.
	#[error("no past commitment states recorded for this channel")]
	NoPastDeltas,

	/// A specific `update_num` was requested but never written.
	#[error("log entry for update_num {0} not found")]
	LogEntryNotFound(u32),

	/// The underlying embedded store rejected or failed a transaction.
	#[error("storage transaction failed: {0}")]
	Db(#[from] sled::Error),

	/// A stored record could not be decoded, or a value could not be
	/// encoded for storage. Always fatal to the operation.
	#[error("codec error: {0}")]
	Codec(#[from] CodecError),
}

/// Errors surfaced by the [`crate::switch::Switch`] data plane.
#[derive(Debug, Error)]
pub enum SwitchError {
	/// No candidate link had enough bandwidth to carry the payment.
	#[error("insufficient capacity to route {amt} sats")]
	InsufficientCapacity { amt: u64 },

	/// The destination node (or resolved next hop) has no registered link.
	#[error("no link registered for destination")]
	UnknownLink,

	/// The control-plane loop has already shut down.
	#[error("switch is not running")]
	NotRunning,
}

/// Outcome of a bucket-pruning attempt. Never wrapped in `Result`: §7 of the
/// spec calls these pruning sentinels, to be absorbed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
	Removed,
	BucketNotEmpty,
	BucketDoesNotExist,
}
