// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Runtime types for Component E: links, payment circuits, and the message
//! shapes the two cooperative loops pass between themselves and to callers.

use std::sync::atomic::{AtomicI64, AtomicU32};

use tokio::sync::{mpsc, oneshot};

use crate::codec::{CompressedPublicKey, Outpoint};
use crate::error::SwitchError;

/// A registered channel the switch can forward HTLCs across. `available_bandwidth`
/// is the only piece of per-link state mutated off the control-plane loop —
/// everything else is set once at registration.
pub struct Link {
	pub chan_point: Outpoint,
	pub remote_node_id: [u8; 32],
	pub available_bandwidth: AtomicI64,
	pub link_chan: mpsc::Sender<PlexPacket>,
}

impl Link {
	pub fn new(
		chan_point: Outpoint, remote_node_id: [u8; 32], capacity: i64,
	) -> (Self, mpsc::Receiver<PlexPacket>) {
		let (tx, rx) = mpsc::channel(LINK_CHANNEL_DEPTH);
		let link = Self {
			chan_point,
			remote_node_id,
			available_bandwidth: AtomicI64::new(capacity),
			link_chan: tx,
		};
		(link, rx)
	}
}

/// Bounded channel depth for a link's inbound packet queue; chosen to absorb
/// a short burst of forwards without unbounded memory growth.
pub const LINK_CHANNEL_DEPTH: usize = 64;

/// A payment circuit installed for the duration of one in-flight multi-hop
/// HTLC: `settle` carries the Settle back towards the originator, `clear`
/// carries the Add onward towards the destination.
pub struct PaymentCircuit {
	pub settle: std::sync::Arc<Link>,
	pub clear: std::sync::Arc<Link>,
	pub ref_count: AtomicU32,
}

/// A locked-in HTLC moving through the switch on a link's inbound channel.
#[derive(Debug, Clone)]
pub enum PlexPacket {
	Add(AddPacket),
	Settle(SettlePacket),
}

#[derive(Debug, Clone)]
pub struct AddPacket {
	pub next_hop: [u8; 20],
	pub redemption_hash: [u8; 32],
	pub amt: u64,
}

#[derive(Debug, Clone)]
pub struct SettlePacket {
	pub redemption_proof: [u8; 32],
	pub amt: u64,
}

/// A request to send a locally originated payment, submitted to the
/// forwarder loop with a reply channel for the outcome.
pub struct SendHtlcRequest {
	pub remote_node_id: [u8; 32],
	pub amt: u64,
	pub reply: oneshot::Sender<Result<(), SwitchError>>,
}

/// Control-plane requests serialized through the network-admin loop.
pub enum AdminRequest {
	RegisterLink {
		chan_point: Outpoint,
		remote_node_id: [u8; 32],
		remote_pubkey: CompressedPublicKey,
		capacity: i64,
		reply: oneshot::Sender<mpsc::Receiver<PlexPacket>>,
	},
	/// `None` unregisters every link for `remote_node_id`; `Some(chan_point)`
	/// removes only that one link.
	UnregisterLink {
		remote_node_id: [u8; 32],
		chan_point: Option<Outpoint>,
		reply: oneshot::Sender<()>,
	},
}

/// Forwarder-loop inputs, multiplexed by [`crate::switch::Switch`]'s data
/// plane `tokio::select!`.
pub enum ForwarderRequest {
	SendHtlc(SendHtlcRequest),
	Plex { chan_point: Outpoint, packet: PlexPacket },
}
