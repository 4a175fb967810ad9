// Copyright (c) 2026 Rialto Contributors. MIT License.
// See LICENSE for details.

//! # Rialto Protocol — Core Library
//!
//! The engine under a peer-to-peer trading client: discover listings on a
//! shared event bus, exchange end-to-end encrypted messages with a trade
//! coordinator, and track every trade's lifecycle locally.
//!
//! Rialto takes a pragmatic stance: Ed25519 for signatures (one keypair
//! signs events and, converted to X25519, encrypts conversations),
//! AES-256-GCM behind a BLAKE3-derived conversation key, and plain signed
//! JSON events for everything on the wire.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of a
//! trading client:
//!
//! - **crypto** — Keys, signatures, and conversation encryption.
//! - **event** — The signed wire event, templates, and filters.
//! - **transport** — Fan-out across N bus endpoints; reconnect, dedup.
//! - **directory** — The live order book built from public listings.
//! - **messenger** — Envelopes, the protocol vocabulary, trade sessions.
//! - **store** — Key-value persistence for snapshots.
//! - **notify** — Structured progress callbacks for the application shell.
//! - **config** — Protocol constants and tuning knobs.
//!
//! ## Design Philosophy
//!
//! 1. Correctness over performance (but we're still fast).
//! 2. A malformed or hostile event is logged and dropped, never fatal.
//! 3. Every state mutation is idempotent — the bus will replay things.
//! 4. If it touches a trade, it has tests. Plural.

pub mod config;
pub mod crypto;
pub mod directory;
pub mod event;
pub mod messenger;
pub mod notify;
pub mod store;
pub mod transport;
