//! # Embus
//!
//! This library provides the request/response (service call) layer of an
//! embedded bus node: typed, non-blocking calls addressed to a specific peer
//! node, answered by a matching response or by a deadline eviction. It targets
//! microcontroller environments with no heap and no threads; all state lives
//! in bounded, statically sized structures.
//!
//! ## Architecture
//!
//! ```text
//!              ┌─────────────┐
//!   inbound ──►│             │── listener_count ──► diagnostics
//!   frames     │    Node     │
//!   + sweep    │  ┌────────┐ │       ┌────────────────┐
//!   ticks      │  │listener│◄┼── Hub ┤ Client (calls) │──► handler
//!              │  │registry│ │       └────────────────┘
//!              │  ├────────┤ │       ┌────────────────┐
//!              │  │pending │◄┼── Hub ┤ Server (serves)│──► handler
//!              │  │ calls  │ │       └────────────────┘
//!              │  └────────┘ │
//!              └──────┬──────┘
//!                     ▼
//!               transport sink
//! ```
//!
//! Components:
//! * _Node_ owns the shared engine state: the listener registry, the
//!   pending-call table, the transport sink, the clock and the data-type
//!   registry. Its [`node::Node::process`] delivers one decoded inbound frame
//!   and [`node::Node::sweep`] evicts expired calls; the host event loop
//!   drives both.
//! * _Hub_ is a shared handle for creating clients and servers.
//! * _Client_ issues calls on one service and delivers each call's single
//!   result (response or timeout) to its bound handler. It occupies a
//!   response-listener slot only while it has calls in flight.
//! * _Server_ answers requests on one service through a user callback, which
//!   may also suppress the response entirely.
//!
//! ## Concurrency model
//!
//! The engine is single-threaded and run-to-completion: `call`, `process` and
//! `sweep` never block, and waiting is expressed by polling
//! (`has_pending_calls`) or by handler invocation on a later tick. All shared
//! state sits behind one blocking mutex generic over
//! `embassy_sync::blocking_mutex::raw::RawMutex`; a multi-threaded host gets
//! the ordering guarantees of the single coarse lock, an interrupt-driven one
//! picks the raw mutex that matches its execution context.
//!
//! User handlers always run with the lock released, so a handler may call back
//! into any part of the API, including placing new calls or re-entering
//! `sweep`.
#![no_std]

pub use embus_core as core;
pub use embus_driver::{frame, link, time};

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod data_types;
pub mod node;
mod pending;
mod registry;
pub mod service;
