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

//! Non-blocking multicast UDP transport. A [`Transport`] is the only thing
//! in this crate that touches a socket; everything above it deals in
//! [`crate::wire::Envelope`]s.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Something that can send datagrams to a fixed multicast destination and
/// drain inbound datagrams without blocking. Implemented by
/// [`MulticastUdpTransport`] for real use, and by a loopback double in tests.
pub trait Transport: Send + Sync {
    /// Fire-and-forget send to the configured multicast destination.
    fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Block up to `timeout` waiting for inbound traffic to become readable.
    /// Returns promptly (without error) if the wait times out.
    fn poll(&self, timeout: Duration) -> io::Result<()>;

    /// Drain one inbound datagram if one is available, else `Ok(None)`.
    /// Any error other than "would block" is fatal and propagated.
    fn recv_nonblocking(&self) -> io::Result<Option<Vec<u8>>>;
}

/// A non-blocking multicast UDP socket bound to an ephemeral local port,
/// with its outbound multicast interface pinned to `local_addr`.
pub struct MulticastUdpTransport {
    socket: Socket,
    dest: SocketAddr,
}

impl MulticastUdpTransport {
    /// Opens a datagram socket, binds it to an ephemeral local port, pins
    /// the outbound multicast interface to `local_addr`, and puts the
    /// socket in non-blocking mode.
    pub fn new(local_addr: Ipv4Addr, dest: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SockAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into();
        socket.bind(&bind_addr)?;
        socket.set_multicast_if_v4(&local_addr)?;
        socket.set_nonblocking(true)?;

        Ok(MulticastUdpTransport { socket, dest })
    }
}

impl Transport for MulticastUdpTransport {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let addr: SockAddr = self.dest.into();
        self.socket.send_to(payload, &addr)?;
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> io::Result<()> {
        // A failed readiness wait is not fatal: the subsequent
        // `recv_nonblocking` will simply find nothing available.
        let _ = wait_readable(&self.socket, timeout);
        Ok(())
    }

    fn recv_nonblocking(&self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = [std::mem::MaybeUninit::new(0u8); 65536];
        match self.socket.recv(&mut buf) {
            Ok(len) => {
                let bytes: Vec<u8> = buf[..len].iter().map(|b| unsafe { b.assume_init() }).collect();
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Sleep until `socket` is readable or `timeout` elapses, using a `poll(2)`
/// style wait via `socket2`'s no-extra-dependency escape hatch: we just fall
/// back to `mio`-free polling by trying `recv` won't work here (we don't
/// want to consume a datagram just to probe readiness), so we use the
/// platform poll primitive that `socket2` exposes through raw fds.
fn wait_readable(socket: &Socket, timeout: Duration) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;

    let rv = unsafe { libc::poll(&mut pollfd as *mut _, 1, millis) };
    if rv < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rv > 0)
}

/// An in-memory loopback transport used for deterministic unit tests: sends
/// are appended to an outbox the test can inspect, and the test can push
/// datagrams into the inbox to be drained by `recv_nonblocking`.
#[cfg(test)]
pub mod test_double {
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    pub struct LoopbackTransport {
        pub outbox: Mutex<Vec<Vec<u8>>>,
        pub inbox: Mutex<VecDeque<Vec<u8>>>,
    }

    impl LoopbackTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_inbound(&self, bytes: Vec<u8>) {
            self.inbox.lock().unwrap().push_back(bytes);
        }

        pub fn sent_count(&self) -> usize {
            self.outbox.lock().unwrap().len()
        }
    }

    impl Transport for LoopbackTransport {
        fn send(&self, payload: &[u8]) -> io::Result<()> {
            self.outbox.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        fn poll(&self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn recv_nonblocking(&self) -> io::Result<Option<Vec<u8>>> {
            Ok(self.inbox.lock().unwrap().pop_front())
        }
    }
}
