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

//! The [`Host`]: owns the multicast transport, the host identity, the
//! sequence-number generator, and the registry of live groups.

use crate::config::HostConfig;
use crate::group::Group;
use crate::transport::{MulticastUdpTransport, Transport};
use crate::wire::{self, Envelope};
use crate::DroneId;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub(crate) struct HostInner {
    pub(crate) host_id: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) send_lock: Mutex<()>,
    pub(crate) retransmit_schedule: Vec<Duration>,
    pub(crate) max_datagram: usize,
    pub(crate) idle_interval: Duration,
    groups: Mutex<Vec<Group>>,
}

/// The controller process's single entry point: owns the socket, generates
/// the host identity, and creates/tracks [`Group`]s.
///
/// Cheap to clone: internally an `Arc`, matching the teacher's
/// `Arc`-shared dispatch state (`async-coap`'s `response_tracker.rs`).
#[derive(Clone)]
pub struct Host {
    pub(crate) inner: Arc<HostInner>,
}

fn generate_host_id() -> String {
    let mut rng = rand::thread_rng();
    let bits: u32 = rng.gen_range(0..1 << 24);
    format!("udrone_{:06x}", bits)
}

impl Host {
    /// Opens the multicast transport and constructs a `Host` from an
    /// explicit [`HostConfig`] (no process-wide globals, per `spec.md` §9).
    pub fn new(config: HostConfig) -> io::Result<Self> {
        let address = match config.address {
            Some(a) => a,
            None => {
                let ifname = config.ifname.as_deref().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "HostConfig must specify either `address` or `ifname`",
                    )
                })?;
                crate::transport_ifaddr::local_ip_for_interface(ifname)?
            }
        };

        let transport = MulticastUdpTransport::new(address, config.multicast_addr)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Construct a `Host` over an arbitrary [`Transport`] (used for tests
    /// with a loopback double, and available to callers wanting a custom
    /// datagram back-end).
    pub fn with_transport(config: HostConfig, transport: Arc<dyn Transport>) -> io::Result<Self> {
        let host_id = config.hostid.unwrap_or_else(generate_host_id);
        log::info!("Initializing host with ID {}", host_id);

        Ok(Host {
            inner: Arc::new(HostInner {
                host_id,
                transport,
                send_lock: Mutex::new(()),
                retransmit_schedule: config.retransmit_schedule,
                max_datagram: config.max_datagram,
                idle_interval: config.idle_interval,
                groups: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn host_id(&self) -> &str {
        &self.inner.host_id
    }

    /// Returns a uniformly random sequence number in `[0, 2_000_000_000)`.
    /// Collisions are tolerated: `seq` matching is only one of three
    /// disambiguation keys (`to`, `seq`, `type`).
    pub fn gen_seq(&self) -> u32 {
        rand::thread_rng().gen_range(0..2_000_000_000)
    }

    /// Constructs an envelope with `from = host_id` and hands it to the
    /// transport. No buffering, no retries at this layer.
    pub fn send(&self, to: &str, seq: u32, msg_type: &str, data: Option<serde_json::Value>) -> io::Result<()> {
        let envelope = Envelope::new(self.inner.host_id.clone(), to, msg_type, seq, data);
        let bytes = wire::encode(&envelope, self.inner.max_datagram)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        log::debug!("Sending: {:?}", envelope);
        let _guard = self.inner.send_lock.lock().unwrap();
        self.inner.transport.send(&bytes)
    }

    /// Drains the transport until an envelope satisfies all of: `to ==
    /// host_id`, `from`/`type` present, (if `seq` nonzero) `seq` matches,
    /// (if `type` given) `type` matches. Non-matching envelopes are
    /// discarded.
    pub fn recv(&self, seq: u32, msg_type: Option<&str>) -> io::Result<Option<Envelope>> {
        loop {
            match self.inner.transport.recv_nonblocking()? {
                None => return Ok(None),
                Some(bytes) => match wire::decode(&bytes, self.inner.max_datagram) {
                    Ok(env) => {
                        if env.to == self.inner.host_id
                            && !env.from.is_empty()
                            && !env.msg_type.is_empty()
                            && (seq == 0 || env.seq == seq)
                            && msg_type.map_or(true, |t| env.msg_type == t)
                        {
                            log::debug!("Received: {:?}", env);
                            return Ok(Some(env));
                        }
                        // Non-matching: keep draining.
                    }
                    Err(e) => {
                        log::debug!("Dropping malformed datagram: {}", e);
                    }
                },
            }
        }
    }

    /// Until either `timeout` elapses or `expect` becomes empty: poll up to
    /// remaining time, drain all matching envelopes via `recv`, storing them
    /// into `answers` (latest wins), removing matched drones from `expect`.
    ///
    /// `order`, if given, records the arrival order of first-seen `from`
    /// values (a drone replying more than once keeps its first position).
    /// Used by [`Host::whois`] so callers can apply the tie-break rule
    /// "take them in arrival order" when more candidates answer than needed.
    pub fn recv_until(
        &self,
        answers: &mut HashMap<DroneId, Envelope>,
        seq: u32,
        msg_type: Option<&str>,
        timeout: Duration,
        mut expect: Option<&mut HashSet<DroneId>>,
        mut order: Option<&mut Vec<DroneId>>,
    ) -> io::Result<()> {
        log::debug!(
            "Receiving replies for seq {} for {:?} expecting {:?}",
            seq,
            timeout,
            expect.as_deref()
        );
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }
            if let Some(ref e) = expect {
                if e.is_empty() {
                    break;
                }
            }
            self.inner.transport.poll(timeout - elapsed)?;
            while let Some(env) = self.recv(seq, msg_type)? {
                if let Some(ref mut e) = expect {
                    e.remove(&env.from);
                }
                if let Some(ref mut o) = order {
                    if !answers.contains_key(&env.from) {
                        o.push(env.from.clone());
                    }
                }
                answers.insert(env.from.clone(), env);
            }
        }
        Ok(())
    }

    /// If `seq` is `0`, allocates one via `gen_seq`. For each timeout in
    /// `retransmit_schedule`, `send` then `recv_until`. If `expect` is given
    /// and becomes empty, exits early.
    pub fn call(
        &self,
        to: &str,
        seq: u32,
        msg_type: &str,
        data: Option<serde_json::Value>,
        resp_type: Option<&str>,
        mut expect: Option<&mut HashSet<DroneId>>,
    ) -> io::Result<HashMap<DroneId, Envelope>> {
        let seq = if seq == 0 { self.gen_seq() } else { seq };
        let mut answers = HashMap::new();

        for &timeout in &self.inner.retransmit_schedule {
            self.send(to, seq, msg_type, data.clone())?;
            self.recv_until(&mut answers, seq, resp_type, timeout, expect.as_deref_mut(), None)?;
            if let Some(ref e) = expect {
                if e.is_empty() {
                    break;
                }
            }
        }
        Ok(answers)
    }

    /// Like `call`, but each attempt re-sends individually to every node
    /// still pending. `nodes` is treated as the expect set and mutated.
    pub fn call_multi(
        &self,
        nodes: &mut HashSet<DroneId>,
        seq: u32,
        msg_type: &str,
        data: Option<serde_json::Value>,
        resp_type: Option<&str>,
    ) -> io::Result<HashMap<DroneId, Envelope>> {
        let seq = if seq == 0 { self.gen_seq() } else { seq };
        let mut answers = HashMap::new();

        for &timeout in &self.inner.retransmit_schedule {
            for node in nodes.iter() {
                self.send(node, seq, msg_type, data.clone())?;
            }
            self.recv_until(&mut answers, seq, resp_type, timeout, Some(nodes), None)?;
            if nodes.is_empty() {
                break;
            }
        }
        Ok(answers)
    }

    /// Broadcasts a `!whois`. If `need == 0`, sends a single datagram with
    /// no wait (liveness refresh, used by the keep-alive timer). Otherwise
    /// uses the retransmit schedule and returns as soon as `answers.len() >=
    /// need`.
    ///
    /// Returned in arrival order (first reply first), so a caller that only
    /// wants some of the responders — `Group::assign`'s tie-break rule is
    /// "take them in arrival order" when more candidates answer than needed
    /// — can just take a prefix instead of picking arbitrarily.
    pub fn whois(
        &self,
        group: &str,
        need: usize,
        seq: u32,
        board: Option<&str>,
    ) -> io::Result<Vec<(DroneId, Envelope)>> {
        log::debug!("Group {} needs {} {:?} drones", group, need, board);
        let mut answers = HashMap::new();
        let mut order: Vec<DroneId> = Vec::new();
        let seq = if seq == 0 { self.gen_seq() } else { seq };

        let data = board.map(|b| serde_json::json!({ "board": b }));

        for &timeout in &self.inner.retransmit_schedule {
            self.send(group, seq, "!whois", data.clone())?;
            if need == 0 {
                break;
            }
            self.recv_until(&mut answers, seq, Some("status"), timeout, None, Some(&mut order))?;
            if answers.len() >= need {
                break;
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|id| answers.remove(&id).map(|env| (id, env)))
            .collect())
    }

    /// Wraps `call` with `!reset`.
    pub fn reset(
        &self,
        whom: &str,
        how: Option<&str>,
        expect: Option<&mut HashSet<DroneId>>,
    ) -> io::Result<HashMap<DroneId, Envelope>> {
        let data = how.map(|h| serde_json::json!({ "how": h }));
        self.call(whom, 0, "!reset", data, Some("status"), expect)
    }

    /// Constructs a group whose id is either `label` (if `absolute`) or
    /// `host_id + "_" + label`, and registers it.
    pub fn group(&self, label: impl Into<String>, absolute: bool) -> Group {
        let label = label.into();
        let group_id = if absolute {
            label
        } else {
            format!("{}_{}", self.inner.host_id, label)
        };
        let group = Group::new(self.clone(), group_id, self.inner.idle_interval);
        self.inner.groups.lock().unwrap().push(group.clone());
        group
    }

    /// Resets every registered group and clears the registry.
    pub fn disband(&self, how: Option<&str>) -> Vec<crate::error::GroupError> {
        let groups = std::mem::take(&mut *self.inner.groups.lock().unwrap());
        let mut errors = Vec::new();
        for group in groups {
            if let Err(e) = group.reset(how) {
                errors.push(e);
            }
        }
        errors
    }
}
