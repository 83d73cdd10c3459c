//! Minimal address manager: remembers peer-gossiped addresses and answers
//! `getaddr` with a bounded random sample.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::seq::SliceRandom;

use crate::message::NetAddress;

/// Upper bound on remembered addresses.
const MAX_ADDRESSES: usize = 2500;

/// Addresses returned per `getaddr`.
const SAMPLE_SIZE: usize = 1000;

#[derive(Default)]
pub struct AddrMan {
    addrs: HashMap<SocketAddr, (u32, NetAddress)>,
}

impl AddrMan {
    pub fn new() -> Self {
        Self { addrs: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Remember an address, keeping the freshest timestamp.
    pub fn insert(&mut self, time: u32, addr: NetAddress) {
        if self.addrs.len() >= MAX_ADDRESSES && !self.addrs.contains_key(&addr.socket()) {
            return;
        }
        let entry = self.addrs.entry(addr.socket()).or_insert((time, addr));
        if time > entry.0 {
            entry.0 = time;
            entry.1 = addr;
        }
    }

    /// Random sample for a `getaddr` reply.
    pub fn sample(&self) -> Vec<(u32, NetAddress)> {
        let mut all: Vec<(u32, NetAddress)> = self.addrs.values().copied().collect();
        all.shuffle(&mut rand::thread_rng());
        all.truncate(SAMPLE_SIZE);
        all
    }
}
