//! In-process transport for tests and local simulations.
//!
//! A [`MemoryNetwork`] is a shared switchboard. Each [`MemoryTransport`] is a
//! named machine on it; listening on a port registers `"<name>:<port>"`.
//! Connects complete at once unless [`MemoryNetwork::hold_connects`] makes
//! them wait for the listener to accept.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{ConnectionHandle, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Dialer,
    Listener,
}

#[derive(Debug)]
struct Link {
    dialer: String,
    listener: String,
    to_listener: VecDeque<Vec<u8>>,
    to_dialer: VecDeque<Vec<u8>>,
    accepted: bool,
    closed: bool,
}

impl Link {
    fn inbox(&mut self, side: Side) -> &mut VecDeque<Vec<u8>> {
        match side {
            Side::Dialer => &mut self.to_dialer,
            Side::Listener => &mut self.to_listener,
        }
    }

    fn outbox(&mut self, side: Side) -> &mut VecDeque<Vec<u8>> {
        match side {
            Side::Dialer => &mut self.to_listener,
            Side::Listener => &mut self.to_dialer,
        }
    }

    fn peer(&self, side: Side) -> &str {
        match side {
            Side::Dialer => &self.listener,
            Side::Listener => &self.dialer,
        }
    }
}

#[derive(Debug, Default)]
struct Hub {
    links: HashMap<u64, Link>,
    listeners: HashMap<String, VecDeque<u64>>,
    next_link: u64,
    hold_connects: bool,
}

/// Shared in-memory switchboard.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a machine called `host` to the network.
    pub fn transport(&self, host: &str) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            host: host.to_string(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Keep new connections pending until the listener accepts them.
    pub fn hold_connects(&self, hold: bool) {
        self.hub.borrow_mut().hold_connects = hold;
    }

    /// Bytes sent over links touching `host` that nobody has received yet.
    pub fn in_flight(&self, host: &str) -> usize {
        let hub = self.hub.borrow();
        hub.links
            .values()
            .filter(|l| l.dialer == host || l.listener == host)
            .flat_map(|l| l.to_listener.iter().chain(&l.to_dialer))
            .map(Vec::len)
            .sum()
    }

    /// Cut every link touching `host`, as if its cable was pulled.
    pub fn sever(&self, host: &str) {
        let mut hub = self.hub.borrow_mut();
        for link in hub.links.values_mut() {
            if link.dialer == host || link.listener == host {
                link.closed = true;
            }
        }
    }
}

/// One machine on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    host: String,
    handles: HashMap<ConnectionHandle, (u64, Side)>,
    next_handle: u64,
}

impl MemoryTransport {
    /// Name of this machine.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn issue(&mut self, link: u64, side: Side) -> ConnectionHandle {
        let handle = ConnectionHandle(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle, (link, side));
        handle
    }

    fn lookup(&self, handle: ConnectionHandle) -> Result<(u64, Side), TransportError> {
        self.handles
            .get(&handle)
            .copied()
            .ok_or(TransportError::UnknownHandle(handle))
    }
}

impl Transport for MemoryTransport {
    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        let address = format!("{}:{port}", self.host);
        self.network
            .hub
            .borrow_mut()
            .listeners
            .entry(address)
            .or_default();
        Ok(())
    }

    fn connect(&mut self, address: &str) -> Result<ConnectionHandle, TransportError> {
        let link_id = {
            let mut hub = self.network.hub.borrow_mut();
            let Some((listener, _)) = address.rsplit_once(':') else {
                return Err(TransportError::ConnectionFailed {
                    address: address.to_string(),
                    reason: "address must be host:port".to_string(),
                });
            };
            let listener = listener.to_string();
            if !hub.listeners.contains_key(address) {
                return Err(TransportError::ConnectionFailed {
                    address: address.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            let id = hub.next_link;
            hub.next_link += 1;
            hub.links.insert(
                id,
                Link {
                    dialer: self.host.clone(),
                    listener,
                    to_listener: VecDeque::new(),
                    to_dialer: VecDeque::new(),
                    accepted: false,
                    closed: false,
                },
            );
            if let Some(pending) = hub.listeners.get_mut(address) {
                pending.push_back(id);
            }
            id
        };
        Ok(self.issue(link_id, Side::Dialer))
    }

    fn is_connected(&mut self, handle: ConnectionHandle) -> Result<bool, TransportError> {
        let (link_id, _) = self.lookup(handle)?;
        let hub = self.network.hub.borrow();
        match hub.links.get(&link_id) {
            Some(link) if link.closed && !link.accepted => Err(TransportError::ConnectionFailed {
                address: link.listener.clone(),
                reason: "connection reset".to_string(),
            }),
            Some(link) => Ok(link.accepted || !hub.hold_connects),
            None => Err(TransportError::ConnectionLost(handle)),
        }
    }

    fn accept(&mut self) -> Result<Option<ConnectionHandle>, TransportError> {
        let next = {
            let mut hub = self.network.hub.borrow_mut();
            let prefix = format!("{}:", self.host);
            let next = hub
                .listeners
                .iter_mut()
                .filter(|(addr, _)| addr.starts_with(&prefix))
                .find_map(|(_, pending)| pending.pop_front());
            if let Some(link) = next.and_then(|id| hub.links.get_mut(&id)) {
                link.accepted = true;
            }
            next
        };
        Ok(next.map(|link| self.issue(link, Side::Listener)))
    }

    fn send(&mut self, handle: ConnectionHandle, bytes: &[u8]) -> Result<(), TransportError> {
        let (link_id, side) = self.lookup(handle)?;
        let mut hub = self.network.hub.borrow_mut();
        match hub.links.get_mut(&link_id) {
            Some(link) if !link.closed => {
                link.outbox(side).push_back(bytes.to_vec());
                Ok(())
            }
            _ => Err(TransportError::ConnectionLost(handle)),
        }
    }

    fn receive(&mut self, handle: ConnectionHandle) -> Result<Vec<u8>, TransportError> {
        let (link_id, side) = self.lookup(handle)?;
        let mut hub = self.network.hub.borrow_mut();
        let Some(link) = hub.links.get_mut(&link_id) else {
            return Err(TransportError::ConnectionLost(handle));
        };
        let inbox = link.inbox(side);
        if !inbox.is_empty() {
            return Ok(inbox.drain(..).flatten().collect());
        }
        if link.closed {
            Err(TransportError::ConnectionLost(handle))
        } else {
            Err(TransportError::WouldBlock)
        }
    }

    fn backlog(&self, handle: ConnectionHandle) -> usize {
        let Some((link_id, side)) = self.handles.get(&handle).copied() else {
            return 0;
        };
        let mut hub = self.network.hub.borrow_mut();
        hub.links
            .get_mut(&link_id)
            .map_or(0, |link| link.outbox(side).iter().map(Vec::len).sum())
    }

    fn close(&mut self, handle: ConnectionHandle) {
        if let Some((link_id, _)) = self.handles.remove(&handle) {
            if let Some(link) = self.network.hub.borrow_mut().links.get_mut(&link_id) {
                link.closed = true;
            }
        }
    }

    fn peer_address(&self, handle: ConnectionHandle) -> Option<String> {
        let (link_id, side) = self.handles.get(&handle).copied()?;
        let hub = self.network.hub.borrow();
        hub.links.get(&link_id).map(|link| link.peer(side).to_string())
    }
}
