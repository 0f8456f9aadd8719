// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Component E: the in-memory HTLC switch — link registry, onion-derived
//! circuit map, atomic bandwidth accounting, and payment forwarding.
//!
//! Two cooperative tasks own the switch's runtime state between them: a
//! "network admin" loop serializes link registration/teardown so
//! `chan_index`, `interfaces`, and `onion_index` always move together, and
//! an "HTLC forwarder" loop owns the circuit map outright (nothing else
//! ever touches it) and multiplexes outgoing sends, inbound Adds, and
//! inbound Settles one at a time. Callers talk to both over bounded
//! channels and await a reply on a one-shot channel per request, the same
//! request/reply-channel shape the rest of this crate's host process uses
//! for its REST handlers.

pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ripemd::{Digest as _, Ripemd160};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::codec::{CompressedPublicKey, Outpoint};
use crate::error::SwitchError;

pub use types::{
	AddPacket, AdminRequest, ForwarderRequest, Link, PaymentCircuit, PlexPacket, SendHtlcRequest,
	SettlePacket,
};

const ADMIN_CHANNEL_DEPTH: usize = 32;
const FORWARDER_CHANNEL_DEPTH: usize = 256;
const METRICS_TICK: Duration = Duration::from_secs(10);

const STOPPED: i32 = 0;
const RUNNING: i32 = 1;

fn ripemd160(pubkey: &CompressedPublicKey) -> [u8; 20] {
	let digest = Ripemd160::digest(pubkey.encode());
	let mut out = [0u8; 20];
	out.copy_from_slice(&digest);
	out
}

fn circuit_key(redemption_hash: &[u8; 32]) -> [u8; 32] {
	*redemption_hash
}

type ChanIndex = HashMap<Outpoint, Arc<Link>>;
type Interfaces = HashMap<[u8; 32], Vec<Arc<Link>>>;
type OnionIndex = HashMap<[u8; 20], Vec<Arc<Link>>>;

/// Shared state the network-admin loop writes and the HTLC forwarder loop
/// reads. Never the other way around: the forwarder never mutates these,
/// so read and write lock acquisitions never nest across the two tasks.
struct SwitchIndexes {
	chan_index: RwLock<ChanIndex>,
	interfaces: RwLock<Interfaces>,
	onion_index: RwLock<OnionIndex>,
}

impl SwitchIndexes {
	fn new() -> Self {
		Self {
			chan_index: RwLock::new(HashMap::new()),
			interfaces: RwLock::new(HashMap::new()),
			onion_index: RwLock::new(HashMap::new()),
		}
	}

	fn register(&self, link: Arc<Link>, remote_pubkey: CompressedPublicKey) {
		let hash = ripemd160(&remote_pubkey);
		self.chan_index.write().expect("chan_index lock poisoned").insert(link.chan_point, link.clone());
		self.interfaces
			.write()
			.expect("interfaces lock poisoned")
			.entry(link.remote_node_id)
			.or_default()
			.push(link.clone());
		self.onion_index.write().expect("onion_index lock poisoned").entry(hash).or_default().push(link);
	}

	/// Unregisters a single link, or every link for `remote_node_id` if
	/// `chan_point` is `None`. Garbage-collects interface and onion-index
	/// entries that become empty.
	fn unregister(&self, remote_node_id: [u8; 32], chan_point: Option<Outpoint>) {
		let removed: Vec<Arc<Link>> = {
			let mut interfaces = self.interfaces.write().expect("interfaces lock poisoned");
			let Some(links) = interfaces.get_mut(&remote_node_id) else { return };
			let removed = match chan_point {
				Some(cp) => {
					let mut removed = Vec::new();
					links.retain(|l| {
						if l.chan_point == cp {
							removed.push(l.clone());
							false
						} else {
							true
						}
					});
					removed
				},
				None => std::mem::take(links),
			};
			if links.is_empty() {
				interfaces.remove(&remote_node_id);
			}
			removed
		};

		if removed.is_empty() {
			return;
		}

		let mut chan_index = self.chan_index.write().expect("chan_index lock poisoned");
		for link in &removed {
			chan_index.remove(&link.chan_point);
		}
		drop(chan_index);

		let mut onion_index = self.onion_index.write().expect("onion_index lock poisoned");
		onion_index.retain(|_, links| {
			links.retain(|l| !removed.iter().any(|r| r.chan_point == l.chan_point));
			!links.is_empty()
		});
	}

	fn candidates_for(&self, remote_node_id: &[u8; 32]) -> Vec<Arc<Link>> {
		self.interfaces
			.read()
			.expect("interfaces lock poisoned")
			.get(remote_node_id)
			.cloned()
			.unwrap_or_default()
	}

	fn resolve_next_hop(&self, onion_hash: &[u8; 20]) -> Option<Arc<Link>> {
		self.onion_index
			.read()
			.expect("onion_index lock poisoned")
			.get(onion_hash)
			.and_then(|links| links.first().cloned())
	}

	fn link_by_chan_point(&self, chan_point: &Outpoint) -> Option<Arc<Link>> {
		self.chan_index.read().expect("chan_index lock poisoned").get(chan_point).cloned()
	}
}

/// Rolling throughput counters sampled by the 10-second observability
/// ticker and reset on every sample, mirroring the teacher's `IntGauge`.
#[derive(Default)]
struct Counters {
	sats_sent: AtomicU64,
	sats_recv: AtomicU64,
	tx_count: AtomicU64,
}

struct RunningTasks {
	admin: JoinHandle<()>,
	forwarder: JoinHandle<()>,
	shutdown: watch::Sender<bool>,
}

/// Reserves `amt` from `link`'s available bandwidth, failing without
/// mutating anything if the balance is insufficient. A single
/// `fetch_update` call makes the check-then-decrement atomic, closing the
/// TOCTOU window a separate load-then-compare-then-subtract would leave
/// open under concurrent forwards on the same link.
fn try_reserve(link: &Link, amt: u64) -> Result<(), SwitchError> {
	let amt = amt as i64;
	link.available_bandwidth
		.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bal| {
			if bal >= amt {
				Some(bal - amt)
			} else {
				None
			}
		})
		.map(|_| ())
		.map_err(|_| SwitchError::InsufficientCapacity { amt: amt as u64 })
}

fn release(link: &Link, amt: u64) {
	link.available_bandwidth.fetch_add(amt as i64, Ordering::SeqCst);
}

/// A live switch: registered links, installed circuits, and the two
/// background tasks that own them. Idempotent `start`/`stop`, cheap to
/// `Arc` and share across request handlers.
pub struct Switch {
	indexes: Arc<SwitchIndexes>,
	counters: Arc<Counters>,
	admin_tx: mpsc::Sender<AdminRequest>,
	forwarder_tx: mpsc::Sender<ForwarderRequest>,
	admin_rx: AsyncMutex<Option<mpsc::Receiver<AdminRequest>>>,
	forwarder_rx: AsyncMutex<Option<mpsc::Receiver<ForwarderRequest>>>,
	state: AtomicI32,
	running: AsyncMutex<Option<RunningTasks>>,
}

impl Switch {
	pub fn new() -> Self {
		let (admin_tx, admin_rx) = mpsc::channel(ADMIN_CHANNEL_DEPTH);
		let (forwarder_tx, forwarder_rx) = mpsc::channel(FORWARDER_CHANNEL_DEPTH);
		Self {
			indexes: Arc::new(SwitchIndexes::new()),
			counters: Arc::new(Counters::default()),
			admin_tx,
			forwarder_tx,
			admin_rx: AsyncMutex::new(Some(admin_rx)),
			forwarder_rx: AsyncMutex::new(Some(forwarder_rx)),
			state: AtomicI32::new(STOPPED),
			running: AsyncMutex::new(None),
		}
	}

	/// Spawns the network-admin and HTLC-forwarder loops. A second call
	/// while already running is a no-op.
	pub async fn start(&self) {
		if self.state.compare_exchange(STOPPED, RUNNING, Ordering::SeqCst, Ordering::SeqCst).is_err() {
			return;
		}

		let admin_rx = self.admin_rx.lock().await.take().expect("admin loop already taken");
		let forwarder_rx =
			self.forwarder_rx.lock().await.take().expect("forwarder loop already taken");

		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let admin_indexes = self.indexes.clone();
		let admin_shutdown = shutdown_rx.clone();
		let admin = tokio::spawn(network_admin_loop(admin_indexes, admin_rx, admin_shutdown));

		let fwd_indexes = self.indexes.clone();
		let fwd_counters = self.counters.clone();
		let forwarder =
			tokio::spawn(htlc_forwarder_loop(fwd_indexes, fwd_counters, forwarder_rx, shutdown_rx));

		*self.running.lock().await = Some(RunningTasks { admin, forwarder, shutdown: shutdown_tx });
		log::info!("switch started");
	}

	/// Signals both loops to exit and joins them. A second call, or a call
	/// before `start`, is a no-op.
	pub async fn stop(&self) {
		if self.state.compare_exchange(RUNNING, STOPPED, Ordering::SeqCst, Ordering::SeqCst).is_err() {
			return;
		}
		let Some(tasks) = self.running.lock().await.take() else { return };
		let _ = tasks.shutdown.send(true);
		let _ = tasks.admin.await;
		let _ = tasks.forwarder.await;
		log::info!("switch stopped");
	}

	/// Registers a new link for `remote_node_id`/`remote_pubkey` and returns
	/// the receiver the peer-I/O layer should poll for packets the switch
	/// forwards towards it.
	pub async fn register_link(
		&self, chan_point: Outpoint, remote_node_id: [u8; 32], remote_pubkey: CompressedPublicKey,
		capacity: i64,
	) -> Result<mpsc::Receiver<PlexPacket>, SwitchError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.admin_tx
			.send(AdminRequest::RegisterLink {
				chan_point,
				remote_node_id,
				remote_pubkey,
				capacity,
				reply: reply_tx,
			})
			.await
			.map_err(|_| SwitchError::NotRunning)?;
		reply_rx.await.map_err(|_| SwitchError::NotRunning)
	}

	/// Unregisters one link, or every link for `remote_node_id` when
	/// `chan_point` is `None`.
	pub async fn unregister_link(
		&self, remote_node_id: [u8; 32], chan_point: Option<Outpoint>,
	) -> Result<(), SwitchError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.admin_tx
			.send(AdminRequest::UnregisterLink { remote_node_id, chan_point, reply: reply_tx })
			.await
			.map_err(|_| SwitchError::NotRunning)?;
		reply_rx.await.map_err(|_| SwitchError::NotRunning)
	}

	/// Routes a locally originated payment to `remote_node_id`.
	pub async fn send_htlc(&self, remote_node_id: [u8; 32], amt: u64) -> Result<(), SwitchError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.forwarder_tx
			.send(ForwarderRequest::SendHtlc(SendHtlcRequest { remote_node_id, amt, reply: reply_tx }))
			.await
			.map_err(|_| SwitchError::NotRunning)?;
		reply_rx.await.map_err(|_| SwitchError::NotRunning)?
	}

	/// Submits a plex packet (Add or Settle) received from a peer on
	/// `chan_point` into the forwarder loop.
	pub async fn plex(&self, chan_point: Outpoint, packet: PlexPacket) -> Result<(), SwitchError> {
		self.forwarder_tx
			.send(ForwarderRequest::Plex { chan_point, packet })
			.await
			.map_err(|_| SwitchError::NotRunning)
	}

	/// A link's current available bandwidth, for tests and diagnostics.
	pub fn available_bandwidth(&self, chan_point: &Outpoint) -> Option<i64> {
		self.indexes.link_by_chan_point(chan_point).map(|l| l.available_bandwidth.load(Ordering::SeqCst))
	}
}

impl Default for Switch {
	fn default() -> Self {
		Self::new()
	}
}

async fn network_admin_loop(
	indexes: Arc<SwitchIndexes>, mut rx: mpsc::Receiver<AdminRequest>, mut shutdown: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			biased;
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					break;
				}
			},
			req = rx.recv() => {
				let Some(req) = req else { break };
				match req {
					AdminRequest::RegisterLink { chan_point, remote_node_id, remote_pubkey, capacity, reply } => {
						let (link, link_rx) = Link::new(chan_point, remote_node_id, capacity);
						let link = Arc::new(link);
						indexes.register(link, remote_pubkey);
						let _ = reply.send(link_rx);
					},
					AdminRequest::UnregisterLink { remote_node_id, chan_point, reply } => {
						indexes.unregister(remote_node_id, chan_point);
						let _ = reply.send(());
					},
				}
			},
		}
	}
}

async fn htlc_forwarder_loop(
	indexes: Arc<SwitchIndexes>, counters: Arc<Counters>, mut rx: mpsc::Receiver<ForwarderRequest>,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut circuits: HashMap<[u8; 32], PaymentCircuit> = HashMap::new();
	let mut ticker = tokio::time::interval(METRICS_TICK);

	loop {
		tokio::select! {
			biased;
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					break;
				}
			},
			_ = ticker.tick() => {
				report_and_reset(&counters);
			},
			req = rx.recv() => {
				let Some(req) = req else { break };
				handle_forwarder_request(&indexes, &counters, &mut circuits, req).await;
			},
		}
	}
}

fn report_and_reset(counters: &Counters) {
	let sats_sent = counters.sats_sent.swap(0, Ordering::SeqCst);
	let sats_recv = counters.sats_recv.swap(0, Ordering::SeqCst);
	let tx_count = counters.tx_count.swap(0, Ordering::SeqCst);
	let tx_per_sec = tx_count as f64 / METRICS_TICK.as_secs_f64();
	log::info!(
		"switch throughput: sats_sent={} sats_recv={} tx_per_sec={:.2}",
		sats_sent,
		sats_recv,
		tx_per_sec
	);
}

async fn handle_forwarder_request(
	indexes: &SwitchIndexes, counters: &Counters, circuits: &mut HashMap<[u8; 32], PaymentCircuit>,
	req: ForwarderRequest,
) {
	match req {
		ForwarderRequest::SendHtlc(request) => {
			let result = send_htlc(indexes, counters, request.remote_node_id, request.amt).await;
			let _ = request.reply.send(result);
		},
		ForwarderRequest::Plex { chan_point, packet } => match packet {
			PlexPacket::Add(add) => handle_add(indexes, counters, circuits, chan_point, add).await,
			PlexPacket::Settle(settle) => {
				handle_settle(counters, circuits, settle).await;
			},
		},
	}
}

async fn send_htlc(
	indexes: &SwitchIndexes, counters: &Counters, remote_node_id: [u8; 32], amt: u64,
) -> Result<(), SwitchError> {
	let candidates = indexes.candidates_for(&remote_node_id);
	if candidates.is_empty() {
		return Err(SwitchError::UnknownLink);
	}
	let link = candidates
		.into_iter()
		.find(|l| l.available_bandwidth.load(Ordering::SeqCst) >= amt as i64)
		.ok_or(SwitchError::InsufficientCapacity { amt })?;

	try_reserve(&link, amt)?;

	let packet = PlexPacket::Add(AddPacket {
		next_hop: [0u8; 20],
		redemption_hash: Sha256::digest(amt.to_be_bytes()).into(),
		amt,
	});
	if link.link_chan.send(packet).await.is_err() {
		release(&link, amt);
		return Err(SwitchError::UnknownLink);
	}

	counters.sats_sent.fetch_add(amt, Ordering::Relaxed);
	counters.tx_count.fetch_add(1, Ordering::Relaxed);
	Ok(())
}

async fn handle_add(
	indexes: &SwitchIndexes, counters: &Counters, circuits: &mut HashMap<[u8; 32], PaymentCircuit>,
	incoming_chan_point: Outpoint, add: AddPacket,
) {
	let Some(settle_link) = indexes.link_by_chan_point(&incoming_chan_point) else { return };
	let Some(clear_link) = indexes.resolve_next_hop(&add.next_hop) else { return };

	if try_reserve(&clear_link, add.amt).is_err() {
		return;
	}

	let key = circuit_key(&add.redemption_hash);
	circuits.insert(
		key,
		PaymentCircuit {
			settle: settle_link,
			clear: clear_link.clone(),
			ref_count: std::sync::atomic::AtomicU32::new(1),
		},
	);

	let amt = add.amt;
	if clear_link.link_chan.send(PlexPacket::Add(add)).await.is_err() {
		release(&clear_link, amt);
		circuits.remove(&key);
		return;
	}

	counters.tx_count.fetch_add(1, Ordering::Relaxed);
}

async fn handle_settle(
	counters: &Counters, circuits: &mut HashMap<[u8; 32], PaymentCircuit>, settle: SettlePacket,
) {
	let proof_hash: [u8; 32] = Sha256::digest(settle.redemption_proof).into();
	let key = circuit_key(&proof_hash);

	let Some(circuit) = circuits.remove(&key) else {
		// No matching circuit: this payment originated locally.
		counters.sats_sent.fetch_add(settle.amt, Ordering::Relaxed);
		return;
	};

	release(&circuit.settle, settle.amt);
	let _ = circuit.settle.link_chan.send(PlexPacket::Settle(settle)).await;
	counters.tx_count.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn outpoint(byte: u8) -> Outpoint {
		Outpoint { txid: [byte; 32], index: 0 }
	}

	async fn running_switch() -> Switch {
		let switch = Switch::new();
		switch.start().await;
		switch
	}

	#[tokio::test]
	async fn insufficient_capacity_leaves_bandwidth_unchanged_scenario_s6() {
		let switch = running_switch().await;
		let chan_point = outpoint(1);
		let peer = [9u8; 32];
		let _rx = switch
			.register_link(chan_point, peer, CompressedPublicKey([1u8; 33]), 100)
			.await
			.unwrap();

		let result = switch.send_htlc(peer, 150).await;
		assert!(matches!(result, Err(SwitchError::InsufficientCapacity { amt: 150 })));
		assert_eq!(switch.available_bandwidth(&chan_point), Some(100));

		switch.stop().await;
	}

	#[tokio::test]
	async fn unknown_destination_fails_with_unknown_link() {
		let switch = running_switch().await;
		let result = switch.send_htlc([1u8; 32], 10).await;
		assert!(matches!(result, Err(SwitchError::UnknownLink)));
		switch.stop().await;
	}

	#[tokio::test]
	async fn circuit_completes_and_settles_scenario_s7() {
		let switch = running_switch().await;
		let chan_l1 = outpoint(1);
		let chan_l2 = outpoint(2);
		let peer1 = [1u8; 32];
		let peer2 = [2u8; 32];
		let peer2_pubkey = CompressedPublicKey([7u8; 33]);

		let _rx1 =
			switch.register_link(chan_l1, peer1, CompressedPublicKey([1u8; 33]), 1000).await.unwrap();
		let mut rx2 = switch.register_link(chan_l2, peer2, peer2_pubkey, 1000).await.unwrap();

		let next_hop = ripemd160(&peer2_pubkey);
		let proof = [42u8; 32];
		let rhash: [u8; 32] = Sha256::digest(proof).into();

		switch
			.plex(chan_l1, PlexPacket::Add(AddPacket { next_hop, redemption_hash: rhash, amt: 50 }))
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(50)).await;
		let forwarded = rx2.recv().await.unwrap();
		assert!(matches!(forwarded, PlexPacket::Add(_)));
		assert_eq!(switch.available_bandwidth(&chan_l2), Some(950));

		switch
			.plex(
				chan_l2,
				PlexPacket::Settle(SettlePacket { redemption_proof: proof, amt: 50 }),
			)
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(switch.available_bandwidth(&chan_l1), Some(1050));

		switch.stop().await;
	}

	#[tokio::test]
	async fn unregister_purges_all_links_for_peer() {
		let switch = running_switch().await;
		let peer = [3u8; 32];
		let _rx1 =
			switch.register_link(outpoint(5), peer, CompressedPublicKey([1u8; 33]), 100).await.unwrap();
		let _rx2 =
			switch.register_link(outpoint(6), peer, CompressedPublicKey([2u8; 33]), 100).await.unwrap();

		switch.unregister_link(peer, None).await.unwrap();

		let result = switch.send_htlc(peer, 10).await;
		assert!(matches!(result, Err(SwitchError::UnknownLink)));
		switch.stop().await;
	}

	#[tokio::test]
	async fn start_and_stop_are_idempotent() {
		let switch = Switch::new();
		switch.start().await;
		switch.start().await;
		switch.stop().await;
		switch.stop().await;
	}
}
