// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The channel store's domain types: the full persisted record for an
//! open channel, and the lightweight live-scalar snapshot handed to
//! read-only consumers.

use crate::channel_store::elkrem::ElkremState;
use crate::codec::{CompressedPublicKey, Outpoint};

/// An active payment channel and every piece of state needed to produce,
/// revoke, and eventually close it. See `channel_store::mod` for how this
/// is split across the on-disk bucket layout.
#[derive(Debug, Clone)]
pub struct OpenChannel {
	pub remote_node_id: [u8; 32],
	pub chan_id: Outpoint,

	pub capacity: u64,
	pub our_balance: u64,
	pub their_balance: u64,
	pub min_fee_per_kb: u64,

	pub our_commit_key: CompressedPublicKey,
	pub their_commit_key: CompressedPublicKey,
	pub our_commit_tx: Vec<u8>,
	pub our_commit_sig: Vec<u8>,
	pub local_csv_delay: u32,
	pub remote_csv_delay: u32,

	pub funding_outpoint: Outpoint,
	pub our_multisig_key: Vec<u8>,
	pub their_multisig_key: Vec<u8>,
	pub funding_redeem_script: Vec<u8>,

	pub their_current_revocation: CompressedPublicKey,
	pub their_current_revocation_hash: [u8; 32],
	pub elkrem: ElkremState,

	pub our_delivery_script: Vec<u8>,
	pub their_delivery_script: Vec<u8>,

	pub num_updates: u64,
	pub total_sats_sent: u64,
	pub total_sats_received: u64,
	pub total_net_fees: u64,
	pub creation_time: u64,
}

impl OpenChannel {
	/// `our_balance + their_balance <= capacity`, the difference being fees
	/// currently in flight.
	pub fn balances_within_capacity(&self) -> bool {
		self.our_balance.saturating_add(self.their_balance) <= self.capacity
	}
}

/// An immutable, lock-free copy of a channel's frequently-read live
/// scalars. Never itself holds a database handle or a lock — callers that
/// want a snapshot of the in-memory mirror get one of these by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
	pub capacity: u64,
	pub our_balance: u64,
	pub their_balance: u64,
	pub min_fee_per_kb: u64,
	pub num_updates: u64,
	pub total_sats_sent: u64,
	pub total_sats_received: u64,
	pub total_net_fees: u64,
}
