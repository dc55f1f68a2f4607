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

//! A named set of drones a [`crate::host::Host`] has assigned, and the
//! high-level `assign`/`request`/`call`/`reset` operations run over it.

use crate::config::DEFAULT_GROUP;
use crate::error::{GroupError, RuntimeErrorKind};
use crate::host::Host;
use crate::wire::{is_control_type, Envelope};
use crate::DroneId;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

enum TimerMsg {
    Reset,
    Stop,
}

struct GroupInner {
    host: Host,
    group_id: String,
    seq: Mutex<u32>,
    assigned: Arc<Mutex<HashSet<DroneId>>>,
    keepalive_tx: Mutex<Option<Sender<TimerMsg>>>,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A named, live subset of the fleet. Cheap to clone (`Arc`-backed), so a
/// [`Host`] can hold the same handle it hands back to callers.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    pub(crate) fn new(host: Host, group_id: String, idle_interval: Duration) -> Self {
        let seq = host.gen_seq();
        let assigned: Arc<Mutex<HashSet<DroneId>>> = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = mpsc::channel::<TimerMsg>();

        let thread_host = host.clone();
        let thread_group_id = group_id.clone();
        let thread_assigned = assigned.clone();
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(idle_interval) {
                Ok(TimerMsg::Reset) => continue,
                Ok(TimerMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    log::debug!("Group {} keep-alive timer triggered", thread_group_id);
                    if !thread_assigned.lock().unwrap().is_empty() {
                        let _ = thread_host.whois(&thread_group_id, 0, 0, None);
                    }
                }
            }
        });

        log::debug!("Group {} created.", group_id);

        Group {
            inner: Arc::new(GroupInner {
                host,
                group_id,
                seq: Mutex::new(seq),
                assigned,
                keepalive_tx: Mutex::new(Some(tx)),
                keepalive_handle: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    /// Seeds `assigned` directly, bypassing `assign`/`!assign`. Only used by
    /// tests that exercise `request`/`call`/`reset` against a pre-established
    /// membership without also driving the assignment handshake.
    #[cfg(test)]
    pub(crate) fn force_assign_for_test(&self, drone: DroneId) {
        self.inner.assigned.lock().unwrap().insert(drone);
    }

    #[cfg(test)]
    pub(crate) fn seq_for_test(&self) -> u32 {
        *self.inner.seq.lock().unwrap()
    }

    /// The drone IDs this group currently believes are its members.
    pub fn assigned(&self) -> HashSet<DroneId> {
        self.inner.assigned.lock().unwrap().clone()
    }

    fn rearm_keepalive(&self) {
        if let Some(tx) = self.inner.keepalive_tx.lock().unwrap().as_ref() {
            let _ = tx.send(TimerMsg::Reset);
        }
    }

    fn stop_keepalive(&self) {
        if let Some(tx) = self.inner.keepalive_tx.lock().unwrap().take() {
            let _ = tx.send(TimerMsg::Stop);
        }
        if let Some(handle) = self.inner.keepalive_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Sends `!assign` to `drones` and returns the subset that accepted
    /// (status `code == 0`), adding them to `assigned` as a side effect.
    fn assign_drones(&self, drones: &HashSet<DroneId>) -> io::Result<HashSet<DroneId>> {
        log::debug!("Assign {:?} to {}", drones, self.inner.group_id);
        let mut nodes = drones.clone();
        let seq = *self.inner.seq.lock().unwrap();
        let data = serde_json::json!({ "group": self.inner.group_id, "seq": seq });
        let responses =
            self.inner
                .host
                .call_multi(&mut nodes, 0, "!assign", Some(data), Some("status"))?;

        let mut assigned_now = HashSet::new();
        let mut assigned = self.inner.assigned.lock().unwrap();
        for (drone_id, response) in responses {
            let code = response
                .data
                .as_ref()
                .and_then(|d| d.get("code"))
                .and_then(|c| c.as_i64())
                .unwrap_or(-1);
            if code == 0 {
                assigned_now.insert(drone_id.clone());
                assigned.insert(drone_id);
            }
        }
        Ok(assigned_now)
    }

    /// Assigns between `min` and `max` drones to this group.
    ///
    /// Returns the full, up-to-date set of members this call contributed to
    /// `assigned` — the union of adopted-existing members and newly
    /// assigned ones (see `SPEC_FULL.md` §4.4 for why this resolves the
    /// original's ambiguous return contract in favor of "what this call
    /// added").
    pub fn assign(&self, min: usize, max: usize, board: &str) -> Result<Vec<DroneId>, GroupError> {
        let max = if max == 0 { min } else { max };
        log::debug!(
            "Assign {}/{} {} drones to {}",
            min,
            max,
            board,
            self.inner.group_id
        );

        let in_group = self
            .inner
            .host
            .whois(&self.inner.group_id, max, 0, Some(board))
            .map_err(transport_err)?;

        if in_group.len() >= min && in_group.len() <= max {
            let mut assigned = self.inner.assigned.lock().unwrap();
            let members: Vec<DroneId> = in_group.into_iter().map(|(id, _)| id).collect();
            for m in &members {
                assigned.insert(m.clone());
            }
            return Ok(members);
        }

        let pool = self
            .inner
            .host
            .whois(DEFAULT_GROUP, max, 0, Some(board))
            .map_err(transport_err)?;
        // `pool` is in arrival order; taking a prefix honors the "take them
        // in arrival order" tie-break when more candidates answered than
        // `max` needs.
        let available: HashSet<DroneId> = pool.into_iter().map(|(id, _)| id).take(max).collect();

        if available.len() < min {
            return Err(GroupError::DroneNotFound {
                min,
                found: available.len(),
            });
        }

        let mut new_members = self.assign_drones(&available).map_err(transport_err)?;

        if new_members.len() < min {
            let deficit = max - new_members.len();
            let pool2 = self
                .inner
                .host
                .whois(DEFAULT_GROUP, deficit, 0, None)
                .map_err(transport_err)?;
            let available2: HashSet<DroneId> =
                pool2.into_iter().map(|(id, _)| id).take(deficit).collect();
            let more = self.assign_drones(&available2).map_err(transport_err)?;
            new_members.extend(more);
        }

        if new_members.len() < min {
            if !new_members.is_empty() {
                let mut rollback = new_members.clone();
                let _ = self.inner.host.call_multi(
                    &mut rollback,
                    0,
                    "!reset",
                    None,
                    Some("status"),
                );
                self.inner.assigned.lock().unwrap().retain(|d| !new_members.contains(d));
            }
            return Err(GroupError::DroneNotFound {
                min,
                found: new_members.len(),
            });
        }

        Ok(new_members.into_iter().collect())
    }

    /// Sends `msg_type` to every assigned drone, alternating send/listen
    /// attempts (odd attempts retransmit, even attempts only drain late
    /// responses — see `spec.md` §4.4's note on why this is not an
    /// off-by-one).
    pub fn request(
        &self,
        msg_type: &str,
        data: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<HashMap<DroneId, Option<Envelope>>, GroupError> {
        let assigned = self.inner.assigned.lock().unwrap().clone();
        if assigned.is_empty() {
            return Err(GroupError::GroupEmpty);
        }

        let seq = if is_control_type(msg_type) {
            self.inner.host.gen_seq()
        } else {
            let mut seq = self.inner.seq.lock().unwrap();
            *seq += 1;
            *seq
        };

        let mut pending = assigned;
        let mut answers: HashMap<DroneId, Option<Envelope>> = HashMap::new();
        let mut attempt: u32 = 0;
        let start = Instant::now();

        self.rearm_keepalive();

        while !pending.is_empty() && start.elapsed() < timeout {
            let mut expect = pending.clone();
            attempt += 1;

            if attempt % 2 == 1 {
                let got = self
                    .inner
                    .host
                    .call(&self.inner.group_id, seq, msg_type, data.clone(), None, Some(&mut expect))
                    .map_err(transport_err)?;
                for (k, v) in got {
                    answers.insert(k, Some(v));
                }
            } else {
                let remaining = timeout.saturating_sub(start.elapsed());
                let step_timeout = remaining.min(Duration::from_secs(10));
                let mut raw = HashMap::new();
                self.inner
                    .host
                    .recv_until(&mut raw, seq, None, step_timeout, Some(&mut expect), None)
                    .map_err(transport_err)?;
                for (k, v) in raw {
                    answers.insert(k, Some(v));
                }
            }

            // Anything still in `expect` after the step timed out so far.
            for drone in &expect {
                answers.entry(drone.clone()).or_insert(None);
            }

            let drones: Vec<DroneId> = answers.keys().cloned().collect();
            for drone in drones {
                let is_accept = answers
                    .get(&drone)
                    .and_then(|a| a.as_ref())
                    .map_or(false, |a| a.msg_type == "accept");
                if is_accept {
                    answers.insert(drone, None); // In progress, keep waiting.
                } else if pending.contains(&drone) && answers.get(&drone).unwrap().is_some() {
                    pending.remove(&drone);
                }
            }

            self.rearm_keepalive();
        }

        Ok(answers)
    }

    /// Thin wrapper over `request` with the error classification from
    /// `spec.md` §4.4/§7.
    pub fn call(
        &self,
        msg_type: &str,
        data: Option<serde_json::Value>,
        timeout: Duration,
        sink: Option<&mut HashMap<DroneId, Option<Envelope>>>,
    ) -> Result<HashMap<DroneId, Option<Envelope>>, GroupError> {
        let res = self.request(msg_type, data, timeout)?;

        // Collect every silent drone at once (the error carries a `Vec`, not
        // a single id) rather than bailing out on the first one a hash map
        // iteration happens to visit.
        let unreachable: Vec<DroneId> = res
            .iter()
            .filter(|(_, answer)| answer.is_none())
            .map(|(drone, _)| drone.clone())
            .collect();
        if !unreachable.is_empty() {
            return Err(GroupError::DroneNotReachable {
                drones: unreachable,
            });
        }

        for (drone, answer) in &res {
            let a = answer.as_ref().expect("filtered out above");
            if !self.inner.assigned.lock().unwrap().contains(drone) {
                return Err(GroupError::DroneConflict {
                    stranger: drone.clone(),
                });
            }
            if a.msg_type == "unsupported" {
                return Err(GroupError::DroneRuntimeError {
                    drone: drone.clone(),
                    kind: RuntimeErrorKind::Unsupported,
                });
            }
            if a.msg_type == "status" {
                let code = a
                    .data
                    .as_ref()
                    .and_then(|d| d.get("code"))
                    .and_then(|c| c.as_i64());
                match code {
                    Some(code) if code > 0 => {
                        let errstr = a
                            .data
                            .as_ref()
                            .and_then(|d| d.get("errstr"))
                            .and_then(|s| s.as_str())
                            .map(String::from);
                        log::error!("drone {} responded with {}: {:?}", drone, code, errstr);
                        return Err(GroupError::DroneRuntimeError {
                            drone: drone.clone(),
                            kind: RuntimeErrorKind::Status { code, errstr },
                        });
                    }
                    Some(_) => {}
                    None => {
                        return Err(GroupError::DroneRuntimeError {
                            drone: drone.clone(),
                            kind: RuntimeErrorKind::Malformed,
                        })
                    }
                }
            }
        }

        if let Some(sink) = sink {
            sink.extend(res.clone());
            Ok(sink.clone())
        } else {
            Ok(res)
        }
    }

    /// Resets every assigned drone, clears `assigned` unconditionally (so
    /// `Host::disband` always leaves an empty group behind, per
    /// `spec.md` §8 invariant 8), and stops the keep-alive timer.
    pub fn reset(&self, how: Option<&str>) -> Result<(), GroupError> {
        let assigned = self.inner.assigned.lock().unwrap().clone();
        let mut not_acked = HashSet::new();
        if !assigned.is_empty() {
            let mut expect = assigned;
            let result = self
                .inner
                .host
                .reset(&self.inner.group_id, how, Some(&mut expect))
                .map_err(transport_err);

            not_acked = expect;
            self.inner.assigned.lock().unwrap().clear();
            self.stop_keepalive();
            result?;
        } else {
            self.stop_keepalive();
        }

        if !not_acked.is_empty() {
            return Err(GroupError::DroneNotReachable {
                drones: not_acked.into_iter().collect(),
            });
        }
        Ok(())
    }
}

fn transport_err(e: io::Error) -> GroupError {
    GroupError::Transport(e.to_string())
}
