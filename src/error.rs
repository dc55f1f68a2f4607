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

//! Error taxonomy surfaced to the suite runner. Transport and codec errors
//! never reach this layer: they are logged and the offending datagram is
//! dropped.

use crate::DroneId;
use std::fmt;

/// The outcome of a drone replying with a terminal `status` whose `code`
/// was non-zero, or with a message this crate does not know how to handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// The drone replied `unsupported`.
    Unsupported,
    /// The drone replied `status` with a non-zero `code`.
    Status {
        code: i64,
        errstr: Option<String>,
    },
    /// The reply didn't look like any known message shape.
    Malformed,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorKind::Unsupported => write!(f, "unknown command"),
            RuntimeErrorKind::Status { code, errstr: Some(s) } => {
                write!(f, "status code {}: {}", code, s)
            }
            RuntimeErrorKind::Status { code, errstr: None } => {
                write!(f, "status code {}", code)
            }
            RuntimeErrorKind::Malformed => write!(f, "malformed reply"),
        }
    }
}

/// Errors raised by [`crate::Group`] operations. This is the only error type
/// that crosses the boundary from the core into the suite runner.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// `assign` could not find enough drones to satisfy `min`.
    #[error("could not find enough drones: needed {min}, found {found}")]
    DroneNotFound { min: usize, found: usize },

    /// One or more drones failed to reply within the deadline.
    #[error("drone(s) unreachable: {drones:?}")]
    DroneNotReachable { drones: Vec<DroneId> },

    /// A drone outside the group's `assigned` set replied with a matching seq.
    #[error("stranger drone replied: {stranger}")]
    DroneConflict { stranger: DroneId },

    /// A drone's reply indicated a runtime failure.
    #[error("drone {drone} runtime error: {kind}")]
    DroneRuntimeError { drone: DroneId, kind: RuntimeErrorKind },

    /// The group has no assigned drones for an operation that requires at
    /// least one (e.g. `request`/`call`).
    #[error("drone group is empty")]
    GroupEmpty,

    /// The underlying transport failed in a way that isn't a simple
    /// "would block" (socket error, oversize payload, etc). Not one of the
    /// four kinds named in `spec.md` §7, but the Python original lets the
    /// equivalent exception propagate uncaught rather than invent a
    /// protocol-layer meaning for it, so we surface it distinctly here too.
    #[error("transport error: {0}")]
    Transport(String),
}
