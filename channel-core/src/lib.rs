// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Persistent channel state core for a Lightning-Network-style payment
//! node: durable per-channel commitment storage, a two-stage nursery for
//! maturing on-chain closure outputs, and an in-memory HTLC switch, all
//! built on one embedded transactional key-value store.
//!
//! - [`kvstore`] — the nested-bucket transactional abstraction everything
//!   else is written against.
//! - [`codec`] — canonical on-disk encodings shared by the stores.
//! - [`channel_store`] — open/closed channel persistence and the
//!   append-only commitment delta log.
//! - [`nursery`] — two-stage maturation of on-chain channel-closure
//!   outputs, indexed by both channel and block height.
//! - [`switch`] — the in-memory HTLC routing and bandwidth-accounting
//!   core.
//! - [`migrations`] — the linear schema-migration registry run on open.
//! - [`error`] — the distinguished error kinds shared across the stores
//!   and the switch.

pub mod channel_store;
pub mod codec;
pub mod error;
pub mod kvstore;
pub mod migrations;
pub mod nursery;
pub mod switch;
