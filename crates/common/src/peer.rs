// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// A remote blob server.
///
/// Identity is the `(address, tcp_port)` pair; the node id reported by
/// peer discovery is carried along but does not participate in equality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub address: IpAddr,
    pub tcp_port: u16,
    pub node_id: Option<String>,
}

impl Peer {
    pub fn new(address: IpAddr, tcp_port: u16) -> Self {
        Self {
            address,
            tcp_port,
            node_id: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.tcp_port == other.tcp_port
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.tcp_port.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.tcp_port)
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for Peer {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peer_identity_ignores_node_id() {
        let mut a: Peer = "127.0.0.1:3333".parse().unwrap();
        let b: Peer = "127.0.0.1:3333".parse().unwrap();
        a.node_id = Some("ab".repeat(48));
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_peer_display_round_trip() {
        let peer: Peer = "10.0.0.2:4444".parse().unwrap();
        assert_eq!(peer.to_string().parse::<Peer>().unwrap(), peer);
    }
}
