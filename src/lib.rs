//! `bgp_speaker` -- an RFC 4271 BGP-4 speaker
//!
//! The crate is organized around the three subsystems that make up a BGP
//! speaker: the wire codec (`message`), the per-peer finite state machine
//! (`fsm`), and the routing-information core (`rib`, `decision`). `peer`,
//! `session`, and `speaker` wire those subsystems together into a running
//! process; `config` and `cli` are the operator-facing surface.

// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod cli;
pub mod config;
pub mod decision;
pub mod fsm;
pub mod message;
pub mod peer;
pub mod rib;
pub mod session;
pub mod speaker;

#[cfg(test)]
pub(crate) mod test_support;

pub use message::{Codec, Error as MessageError, Message};
pub use speaker::Speaker;
