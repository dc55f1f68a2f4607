// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! A controller for remotely driving a fleet of embedded test devices
//! ("drones") over a shared IP multicast channel.
//!
//! A single [`Host`](host::Host) discovers drones on a LAN, assigns subsets
//! of them into named [`Group`](group::Group)s, dispatches typed commands,
//! collects replies, and enforces at-least-once delivery through bounded
//! retransmission.
//!
//! This crate covers the multicast request/response transport and the
//! group-membership protocol. The test-suite interpreter, per-command
//! helpers (`ubus`/`uci`/IP-check wrappers), CLI, configuration file
//! loading, and logging initialization are external collaborators — see
//! `demos/` for an illustration of where this crate's surface meets that
//! code.

pub mod config;
pub mod error;
pub mod group;
pub mod host;
pub mod transport;
mod transport_ifaddr;
pub mod wire;

pub use error::GroupError;
pub use group::Group;
pub use host::Host;
pub use wire::Envelope;

/// A drone's identity, as carried in the `from`/`to` fields of an
/// [`Envelope`].
pub type DroneId = String;

#[cfg(test)]
mod integration_tests;
