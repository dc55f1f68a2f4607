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

//! Scenario tests from `spec.md` §8 (S1-S6) and invariants 1, 3 (control
//! clause), 4, 7 and 8, run against the in-memory
//! [`crate::transport::test_double::LoopbackTransport`] double rather than a
//! real socket. See `DESIGN.md` for why invariant 3's alternating-`request`
//! clause (at most `2*len(retransmit_schedule)` datagrams) isn't covered by
//! an automated test here.

use crate::config::{HostConfig, DEFAULT_GROUP};
use crate::error::GroupError;
use crate::host::Host;
use crate::transport::test_double::LoopbackTransport;
use crate::wire::{self, Envelope};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn fast_host_config() -> HostConfig {
    let mut cfg = HostConfig::new("127.0.0.1".parse().unwrap());
    cfg.hostid = Some("hostA".to_string());
    cfg.retransmit_schedule = vec![
        Duration::from_millis(30),
        Duration::from_millis(30),
        Duration::from_millis(30),
        Duration::from_millis(30),
    ];
    cfg.idle_interval = Duration::from_secs(3600); // keep-alive shouldn't interfere with tests
    cfg.max_datagram = 1400;
    cfg
}

fn make_host() -> (Host, Arc<LoopbackTransport>) {
    let transport = Arc::new(LoopbackTransport::new());
    let host = Host::with_transport(fast_host_config(), transport.clone()).unwrap();
    (host, transport)
}

/// Spawns a background "drone" that watches the outbox and answers
/// datagrams matching `responder`, which receives the decoded outbound
/// envelope and returns the reply envelopes to push (after a small delay).
fn spawn_fake_drone<F>(transport: Arc<LoopbackTransport>, responder: F) -> thread::JoinHandle<()>
where
    F: Fn(&Envelope) -> Vec<(Duration, Envelope)> + Send + 'static,
{
    thread::spawn(move || {
        let mut seen = 0usize;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if std::time::Instant::now() > deadline {
                break;
            }
            let outbox_len = transport.sent_count();
            if outbox_len > seen {
                let batch: Vec<Vec<u8>> = transport.outbox.lock().unwrap()[seen..outbox_len].to_vec();
                seen = outbox_len;
                for raw in batch {
                    if let Ok(env) = wire::decode(&raw, 1400) {
                        for (delay, reply) in responder(&env) {
                            let t = transport.clone();
                            let reply = reply.clone();
                            thread::spawn(move || {
                                thread::sleep(delay);
                                let bytes = wire::encode(&reply, 1400).unwrap();
                                t.push_inbound(bytes);
                            });
                        }
                    }
                }
            }
            thread::sleep(Duration::from_millis(5));
        }
    })
}

#[test]
fn invariant_monotonic_group_seq() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    seed_assigned(&group, &["A"]);

    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "ping" {
            vec![(
                Duration::from_millis(2),
                Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))),
            )]
        } else {
            vec![]
        }
    });

    let before = group.seq_for_test();
    group.call("ping", None, Duration::from_secs(2), None).unwrap();
    let after_one = group.seq_for_test();
    group.call("ping", None, Duration::from_secs(2), None).unwrap();
    let after_two = group.seq_for_test();

    assert!(after_one > before);
    assert!(after_two > after_one);
}

#[test]
fn s1_assign_happy_path() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    let group_id = group.group_id().to_string();

    let responded_assign = Arc::new(AtomicUsize::new(0));
    let responded_assign2 = responded_assign.clone();

    let _drone = spawn_fake_drone(transport.clone(), move |env| {
        if env.msg_type == "!whois" && env.to == DEFAULT_GROUP {
            vec![
                (Duration::from_millis(2), Envelope::new("A", "hostA", "status", env.seq, Some(json!({"board": "generic"})))),
                (Duration::from_millis(2), Envelope::new("B", "hostA", "status", env.seq, Some(json!({"board": "generic"})))),
                (Duration::from_millis(2), Envelope::new("C", "hostA", "status", env.seq, Some(json!({"board": "generic"})))),
            ]
        } else if env.msg_type == "!whois" && env.to == group_id {
            vec![] // no existing members
        } else if env.msg_type == "!assign" {
            // `assign` only asks the first `max` drones out of the pool it
            // queried, taken in arrival order; which two of A/B/C that is
            // depends on the fake drone's reply-thread scheduling (all
            // three fire after the same 2ms delay), so every one of them
            // accepts and the test only needs to assert on the *count*
            // assigned.
            responded_assign2.fetch_add(1, Ordering::SeqCst);
            let drone = env.to.clone();
            vec![(
                Duration::from_millis(2),
                Envelope::new(drone, "hostA", "status", env.seq, Some(json!({"code": 0}))),
            )]
        } else {
            vec![]
        }
    });

    let new_members = group.assign(2, 2, "generic").unwrap();
    let members: std::collections::HashSet<_> = new_members.into_iter().collect();
    assert_eq!(members.len(), 2);
    assert_eq!(group.assigned().len(), 2);
    assert!(responded_assign.load(Ordering::SeqCst) >= 2);
}

#[test]
fn s2_partial_assign_rollback() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    let group_id = group.group_id().to_string();

    // Pool has exactly A and B; A accepts `!assign`, B never answers at all
    // (not even to the deficit round's second `!whois`), so `assign` falls
    // one short and must roll the lone accepted drone back out.
    let _drone = spawn_fake_drone(transport.clone(), move |env| {
        if env.msg_type == "!whois" && env.to == DEFAULT_GROUP {
            vec![
                (Duration::from_millis(2), Envelope::new("A", "hostA", "status", env.seq, None)),
                (Duration::from_millis(2), Envelope::new("B", "hostA", "status", env.seq, None)),
            ]
        } else if env.msg_type == "!whois" && env.to == group_id {
            vec![]
        } else if env.msg_type == "!assign" && env.to == "A" {
            vec![(
                Duration::from_millis(2),
                Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))),
            )]
        } else if env.msg_type == "!reset" && env.to == "A" {
            vec![(
                Duration::from_millis(2),
                Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))),
            )]
        } else {
            vec![]
        }
    });

    let err = group.assign(2, 2, "generic").unwrap_err();
    assert!(matches!(err, GroupError::DroneNotFound { min: 2, found: 1 }));
    assert!(group.assigned().is_empty());
}

#[test]
fn s3_accept_then_status() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    seed_assigned(&group, &["A"]);

    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "ubus" {
            vec![
                (Duration::from_millis(10), Envelope::new("A", "hostA", "accept", env.seq, None)),
                (
                    Duration::from_millis(60),
                    Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))),
                ),
            ]
        } else {
            vec![]
        }
    });

    let res = group
        .call("ubus", Some(json!({"path": "x"})), Duration::from_secs(5), None)
        .unwrap();
    let ans = res.get("A").unwrap().as_ref().unwrap();
    assert_eq!(ans.msg_type, "status");
}

#[test]
fn s4_unsupported() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    seed_assigned(&group, &["A"]);

    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "weird" {
            vec![(Duration::from_millis(5), Envelope::new("A", "hostA", "unsupported", env.seq, None))]
        } else {
            vec![]
        }
    });

    let err = group.call("weird", None, Duration::from_secs(2), None).unwrap_err();
    match err {
        GroupError::DroneRuntimeError { drone, .. } => assert_eq!(drone, "A"),
        other => panic!("expected DroneRuntimeError, got {:?}", other),
    }
}

#[test]
fn s5_stranger() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    seed_assigned(&group, &["A"]);

    // Both the assigned drone `A` and the stranger `Z` answer, so `A` being
    // silent is never the reason the call fails: the only possible outcome
    // is `DroneConflict` on `Z`.
    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "ubus" {
            vec![
                (Duration::from_millis(5), Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0})))),
                (Duration::from_millis(5), Envelope::new("Z", "hostA", "status", env.seq, Some(json!({"code": 0})))),
            ]
        } else {
            vec![]
        }
    });

    let err = group.call("ubus", None, Duration::from_secs(1), None).unwrap_err();
    match err {
        GroupError::DroneConflict { stranger } => assert_eq!(stranger, "Z"),
        other => panic!("expected DroneConflict, got {:?}", other),
    }
}

#[test]
fn s6_total_timeout() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    seed_assigned(&group, &["A", "B"]);

    // Only A ever responds; B stays silent.
    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "ubus" && env.to != "B" {
            vec![(Duration::from_millis(5), Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))))]
        } else {
            vec![]
        }
    });

    let err = group.call("ubus", None, Duration::from_millis(500), None).unwrap_err();
    match err {
        GroupError::DroneNotReachable { drones } => assert!(drones.contains(&"B".to_string())),
        other => panic!("expected DroneNotReachable, got {:?}", other),
    }
}

#[test]
fn disband_clears_assigned() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    seed_assigned(&group, &["A"]);

    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "!reset" {
            vec![(Duration::from_millis(2), Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))))]
        } else {
            vec![]
        }
    });

    let errs = host.disband(None);
    assert!(errs.is_empty());
    assert!(group.assigned().is_empty());
}

/// Invariant 3 ("control" clause): a direct `Host::call` to a target that
/// never replies must not emit more than `len(retransmit_schedule)`
/// datagrams — one send per schedule entry, no more.
///
/// The alternating-`request` clause of this invariant (at most
/// `2*len(retransmit_schedule)` datagrams per logical call) is not covered
/// here: `Group::request`'s even (listen-only) attempts cap their wait at
/// `min(10s, remaining)` (`src/group.rs`), so driving a second odd
/// (retransmitting) attempt requires a pending request to sit idle for
/// multiple seconds — impractical for a fast, deterministic unit test. See
/// `DESIGN.md` for the reasoning that substitutes for an automated check
/// there.
#[test]
fn invariant_retransmission_bound_for_unresponsive_target() {
    let (host, transport) = make_host();
    let mut expect: std::collections::HashSet<String> = ["A".to_string()].into_iter().collect();

    // No fake drone is spawned: "A" never answers "ping".
    let _ = host
        .call("A", 0, "ping", None, Some("status"), Some(&mut expect))
        .unwrap();

    assert_eq!(transport.sent_count(), 4); // == len(retransmit_schedule) from fast_host_config
}

/// Invariant 4: if every expected drone replies during attempt 1, no
/// further datagrams are sent for that request.
#[test]
fn invariant_early_exit_no_further_datagrams_once_satisfied() {
    let (host, transport) = make_host();
    let group = host.group("g", false);
    seed_assigned(&group, &["A"]);

    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "ubus" {
            vec![(Duration::from_millis(2), Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))))]
        } else {
            vec![]
        }
    });

    group.call("ubus", None, Duration::from_secs(2), None).unwrap();

    // The reply lands inside attempt 1's first schedule step, so `pending`
    // (and the shared `expect` set threaded into `Host::call`) empties
    // before a second datagram would go out.
    assert_eq!(transport.sent_count(), 1);
}

/// Invariant 7: firing the keep-alive timer never mutates `assigned` and
/// never affects the outcome of a concurrently pending `request`.
#[test]
fn invariant_keepalive_does_not_mutate_assigned_or_pending_request() {
    let transport = Arc::new(LoopbackTransport::new());
    let mut cfg = fast_host_config();
    cfg.idle_interval = Duration::from_millis(20); // fires several times during the call below
    let host = Host::with_transport(cfg, transport.clone()).unwrap();
    let group = host.group("g", false);
    seed_assigned(&group, &["A"]);

    let _drone = spawn_fake_drone(transport.clone(), |env| {
        if env.msg_type == "ubus" {
            vec![(Duration::from_millis(120), Envelope::new("A", "hostA", "status", env.seq, Some(json!({"code": 0}))))]
        } else {
            vec![]
        }
    });

    let res = group
        .call("ubus", None, Duration::from_secs(2), None)
        .unwrap();
    assert_eq!(res.get("A").unwrap().as_ref().unwrap().msg_type, "status");
    assert_eq!(group.assigned(), ["A".to_string()].into_iter().collect());

    // Confirm the timer actually fired (a liveness `!whois` with no `data`
    // went out) while the 120ms-delayed reply was still outstanding, rather
    // than trivially passing because it never ran.
    let sent = transport.outbox.lock().unwrap().clone();
    let saw_keepalive_whois = sent.iter().any(|raw| {
        wire::decode(raw, 1400)
            .map(|env| env.msg_type == "!whois" && env.data.is_none())
            .unwrap_or(false)
    });
    assert!(
        saw_keepalive_whois,
        "expected at least one keep-alive !whois while the request was pending"
    );
}

/// Test helper: directly seed a group's assigned set without going through
/// `assign`, for tests that only care about `request`/`call` behavior.
fn seed_assigned(group: &crate::group::Group, drones: &[&str]) {
    for d in drones {
        group.force_assign_for_test(d.to_string());
    }
}
