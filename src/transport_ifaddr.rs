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

//! Resolves a local interface name to its IPv4 address, for the case where
//! [`crate::config::HostConfig::ifname`] is given instead of an explicit
//! address. Mirrors `get_ip_address` in
//! `examples/original_source/udronerc/dronehost.py`, which uses the
//! `SIOCGIFADDR` `ioctl`; used only once, at `Host` construction time.

use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;

const SIOCGIFADDR: libc::c_ulong = 0x8915;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_addr: libc::sockaddr,
}

/// Looks up the IPv4 address assigned to `interface` via `SIOCGIFADDR`.
pub fn local_ip_for_interface(interface: &str) -> io::Result<Ipv4Addr> {
    let name = CString::new(interface)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name has a NUL byte"))?;
    let name_bytes = name.as_bytes_with_nul();
    if name_bytes.len() > libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    let mut ifr: IfReq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let rv = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCGIFADDR, &mut ifr as *mut IfReq) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }

    let sockaddr_in = unsafe { &*(&ifr.ifr_addr as *const libc::sockaddr as *const libc::sockaddr_in) };
    let ip = u32::from_be(sockaddr_in.sin_addr.s_addr);
    Ok(Ipv4Addr::from(ip))
}
