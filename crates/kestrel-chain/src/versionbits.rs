//! BIP9 versionbits deployment tracking.
//!
//! Deployment state advances only at retarget-window boundaries; a per-
//! deployment cache keyed by the window's last ancestor keeps the walk
//! bounded. Blocks signal by setting the deployment bit under the 001
//! top-bits template.

use std::collections::HashMap;

use kestrel_core::hash::Hash256;
use kestrel_core::params::{Deployment, NetworkParams};

use crate::difficulty::median_time;
use crate::entry::ChainEntry;

/// State of a deployment as of some window boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

/// Top three version bits that mark a versionbits-style block version.
pub const VERSIONBITS_TOP_MASK: u32 = 0xe000_0000;
pub const VERSIONBITS_TOP_BITS: u32 = 0x2000_0000;

/// Whether a block version signals for a deployment bit.
pub fn signals(version: i32, bit: u8) -> bool {
    let version = version as u32;
    version & VERSIONBITS_TOP_MASK == VERSIONBITS_TOP_BITS && version & (1 << bit) != 0
}

/// Read access to the header index required by the state walk.
pub trait HeaderView {
    fn get_header(&mut self, hash: &Hash256) -> Option<ChainEntry>;
}

/// Versionbits state machine with a per-deployment boundary cache.
#[derive(Default)]
pub struct VersionBits {
    cache: HashMap<(u8, Hash256), ThresholdState>,
}

impl VersionBits {
    pub fn new() -> Self {
        Self { cache: HashMap::new() }
    }

    /// Deployment state for a block whose parent is `parent`.
    pub fn state(
        &mut self,
        view: &mut impl HeaderView,
        params: &NetworkParams,
        deployment: &Deployment,
        parent: Option<&ChainEntry>,
    ) -> ThresholdState {
        if deployment.start_time == Deployment::ALWAYS_ACTIVE {
            return ThresholdState::Active;
        }
        let window = params.retarget_interval;

        // Step back to the last window boundary at or below the parent.
        let Some(parent) = parent else {
            return ThresholdState::Defined;
        };
        let mut boundary = {
            let back = (parent.height + 1) % window;
            match ancestor(view, parent, parent.height - back) {
                Some(entry) => entry,
                None => return ThresholdState::Defined,
            }
        };

        // Walk boundaries backwards until a cached state or Defined region.
        let mut pending: Vec<ChainEntry> = Vec::new();
        let mut state = loop {
            let key = (deployment.bit, boundary.hash());
            if let Some(state) = self.cache.get(&key) {
                break *state;
            }
            if median_past(view, &boundary) < deployment.start_time {
                self.cache.insert(key, ThresholdState::Defined);
                break ThresholdState::Defined;
            }
            if boundary.height < window {
                break ThresholdState::Defined;
            }
            pending.push(boundary.clone());
            boundary = match ancestor(view, &boundary, boundary.height - window) {
                Some(entry) => entry,
                None => break ThresholdState::Defined,
            };
        };

        // Replay forward, applying one transition per window.
        while let Some(entry) = pending.pop() {
            state = match state {
                ThresholdState::Defined => {
                    if median_past(view, &entry) >= deployment.timeout {
                        ThresholdState::Failed
                    } else if median_past(view, &entry) >= deployment.start_time {
                        ThresholdState::Started
                    } else {
                        ThresholdState::Defined
                    }
                }
                ThresholdState::Started => {
                    if median_past(view, &entry) >= deployment.timeout {
                        ThresholdState::Failed
                    } else if count_signals(view, &entry, deployment.bit, window)
                        >= params.versionbits_threshold
                    {
                        ThresholdState::LockedIn
                    } else {
                        ThresholdState::Started
                    }
                }
                ThresholdState::LockedIn => ThresholdState::Active,
                terminal => terminal,
            };
            self.cache.insert((deployment.bit, entry.hash()), state);
        }
        state
    }
}

fn ancestor(
    view: &mut impl HeaderView,
    entry: &ChainEntry,
    height: u32,
) -> Option<ChainEntry> {
    let mut current = entry.clone();
    while current.height > height {
        current = view.get_header(&current.header.prev)?;
    }
    Some(current)
}

fn median_past(view: &mut impl HeaderView, entry: &ChainEntry) -> u64 {
    let mut times = Vec::with_capacity(kestrel_core::constants::MEDIAN_TIME_SPAN);
    let mut current = entry.clone();
    loop {
        times.push(current.header.time);
        if times.len() == kestrel_core::constants::MEDIAN_TIME_SPAN || current.height == 0 {
            break;
        }
        match view.get_header(&current.header.prev) {
            Some(parent) => current = parent,
            None => break,
        }
    }
    median_time(&times)
}

/// Count signalling blocks in the window ending at `boundary`.
fn count_signals(
    view: &mut impl HeaderView,
    boundary: &ChainEntry,
    bit: u8,
    window: u32,
) -> u32 {
    let mut count = 0;
    let mut current = boundary.clone();
    for _ in 0..window {
        if signals(current.header.version, bit) {
            count += 1;
        }
        if current.height == 0 {
            break;
        }
        match view.get_header(&current.header.prev) {
            Some(parent) => current = parent,
            None => break,
        }
    }
    count
}
