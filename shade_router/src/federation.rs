// Peer routers and this router's advertised role.
//
// A router with no enabled peers relays both messages and transfers. Once
// enabled peers are configured it becomes message-only, unless its own
// address/port appears among them (it is then one of the federation's
// transfer routers itself).
//
// Peers are probed periodically with a plain TCP connect under a deadline.
// Clients asking for routers get the reachable peers, or this router alone
// when none answer. Advertising itself turns a message-only router into a
// transfer router for good, since the clients it just redirected to itself
// will upload and download through it.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use shade_protocol::RouterInfo;
use tracing::{debug, info, warn};

use crate::config::{PeerConfig, RouterConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    MessageOnly,
    MessageAndTransfer,
}

impl Role {
    pub fn relays_transfers(self) -> bool {
        self == Role::MessageAndTransfer
    }
}

/// Decide the role from the configured peers.
pub fn role_for(config: &RouterConfig) -> Role {
    let mut enabled = config.routers.iter().filter(|p| p.enabled).peekable();
    if enabled.peek().is_none() {
        return Role::MessageAndTransfer;
    }
    if enabled.any(|p| p.address == config.address && p.port == config.port) {
        Role::MessageAndTransfer
    } else {
        Role::MessageOnly
    }
}

struct Peer {
    config: PeerConfig,
    reachable: bool,
}

pub struct Federation {
    transfers: AtomicBool,
    local: RouterInfo,
    peers: RwLock<Vec<Peer>>,
}

impl Federation {
    pub fn new(config: &RouterConfig) -> Self {
        let peers = config
            .routers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| Peer {
                config: p.clone(),
                reachable: false,
            })
            .collect();
        Self {
            transfers: AtomicBool::new(role_for(config).relays_transfers()),
            local: RouterInfo {
                name: config.name.clone(),
                address: config.address.clone(),
                port: config.port,
                password: config.password.clone(),
            },
            peers: RwLock::new(peers),
        }
    }

    pub fn role(&self) -> Role {
        if self.transfers.load(Ordering::SeqCst) {
            Role::MessageAndTransfer
        } else {
            Role::MessageOnly
        }
    }

    /// Routers to advertise to clients.
    pub fn routers(&self) -> Vec<RouterInfo> {
        let reachable: Vec<RouterInfo> = self
            .peers
            .read()
            .iter()
            .filter(|p| p.reachable)
            .map(|p| RouterInfo {
                name: p.config.name.clone(),
                address: p.config.address.clone(),
                port: p.config.port,
                password: p.config.password.clone(),
            })
            .collect();
        if reachable.is_empty() {
            if !self.transfers.swap(true, Ordering::SeqCst) {
                info!("no peer router reachable; relaying transfers here");
            }
            vec![self.local.clone()]
        } else {
            reachable
        }
    }

    /// Connect to every peer and record which ones answered. The peer list
    /// lock is not held while connecting.
    pub fn probe(&self, timeout: Duration) {
        let targets: Vec<(String, u16)> = self
            .peers
            .read()
            .iter()
            .map(|p| (p.config.address.clone(), p.config.port))
            .collect();
        let results: Vec<bool> = targets
            .iter()
            .map(|(address, port)| probe_one(address, *port, timeout))
            .collect();

        let mut peers = self.peers.write();
        for (peer, reachable) in peers.iter_mut().zip(results) {
            if peer.reachable != reachable {
                debug!(peer = %peer.config.name, reachable, "peer status changed");
            }
            peer.reachable = reachable;
        }
    }
}

fn probe_one(address: &str, port: u16, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match (address, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            warn!(address, port, "cannot resolve peer: {e}");
            return false;
        }
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
}
