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

//! Illustrates the suite-runner/core boundary described in `spec.md` §6:
//! a suite interpreter (out of scope for this crate) builds a `Host`,
//! carves out a `Group`, assigns drones to it, and runs a couple of
//! commands, mirroring the shape of `qa.py`'s `run_test` in
//! `examples/original_source/controller/qa.py` without reimplementing the
//! declarative test-file format or the per-command helpers
//! (`checkip.py`/`uci.py`), both of which stay out of this crate.

use dronehost::config::HostConfig;
use dronehost::host::Host;
use serde_json::json;
use std::time::Duration;

fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = HostConfig::new("192.168.1.1".parse().unwrap());
    let host = Host::new(config)?;
    log::info!("host {} up, waiting for drones", host.host_id());

    let group = host.group("lan", false);

    match group.assign(1, 2, "generic") {
        Ok(members) => log::info!("assigned {:?} to {}", members, group.group_id()),
        Err(e) => {
            log::error!("could not assign drones: {}", e);
            return Ok(());
        }
    }

    // A `checkip`-style command helper (out of scope) would build this
    // payload itself; here we inline it to keep the demo self-contained.
    match group.call(
        "ubus",
        Some(json!({"path": "network.interface.lan", "method": "dump"})),
        Duration::from_secs(10),
        None,
    ) {
        Ok(answers) => {
            for (drone, answer) in answers {
                log::info!("{}: {:?}", drone, answer);
            }
        }
        Err(e) => log::error!("command failed: {}", e),
    }

    if let Err(e) = group.reset(None) {
        log::warn!("reset incomplete: {}", e);
    }

    Ok(())
}
