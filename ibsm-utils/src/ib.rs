//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fmt::Write;

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

// Highest LID usable for unicast traffic.
pub const LID_UCAST_END: u16 = 0xBFFF;
// Size of the linear forwarding table buffer (one entry per unicast LID).
pub const LFT_SIZE: usize = LID_UCAST_END as usize + 1;
// LFT/hop-table sentinel meaning "no route to this LID".
pub const NO_PATH: u8 = 0xFF;
// Maximum number of hops in a directed-route path.
pub const DR_PATH_HOPS_MAX: usize = 64;

// Represents a 64-bit node, port or system image GUID.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Guid(pub u64);

// Represents a 16-bit Local IDentifier.
//
// LID 0 is reserved and never owned by a port; `Lid` is therefore only
// considered routable when it falls within `1..=LID_UCAST_END`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Lid(pub u16);

// IBA node types.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum NodeType {
    Ca = 1,
    Switch = 2,
    Router = 3,
}

// IBA port logical states.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum LinkState {
    #[default]
    Down = 1,
    Init = 2,
    Armed = 3,
    Active = 4,
}

// IBA link widths.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum LinkWidth {
    Width1x = 1,
    #[default]
    Width4x = 2,
    Width8x = 4,
    Width12x = 8,
}

// IBA link speeds.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum LinkSpeed {
    #[default]
    Sdr = 1,
    Ddr = 2,
    Qdr = 4,
}

// IBA MTU values.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    #[default]
    Mtu2048 = 4,
    Mtu4096 = 5,
}

// Subnet Manager states as carried in the SMInfo attribute.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum SmState {
    NotActive = 0,
    #[default]
    Discovering = 1,
    Standby = 2,
    Master = 3,
}

// Represents a directed-route path: the ordered list of egress port
// numbers the SM traverses to reach a node, starting from its local port.
//
// Entry 0 is always 0 (the local "hop"), matching the initial-path
// convention of directed-route SMPs.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct DrPath(Vec<u8>);

// ===== impl Guid =====

impl Guid {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for Guid {
    fn from(guid: u64) -> Guid {
        Guid(guid)
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// ===== impl Lid =====

impl Lid {
    pub fn is_valid(&self) -> bool {
        self.0 >= 1 && self.0 <= LID_UCAST_END
    }
}

impl From<u16> for Lid {
    fn from(lid: u16) -> Lid {
        Lid(lid)
    }
}

impl std::fmt::Display for Lid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ===== impl NodeType =====

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Ca => write!(f, "CA"),
            NodeType::Switch => write!(f, "SW"),
            NodeType::Router => write!(f, "RT"),
        }
    }
}

// ===== impl LinkState =====

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Down => write!(f, "DOWN"),
            LinkState::Init => write!(f, "INIT"),
            LinkState::Armed => write!(f, "ARMED"),
            LinkState::Active => write!(f, "ACTIVE"),
        }
    }
}

// ===== impl DrPath =====

impl DrPath {
    // The zero-hop path addressing the SM's own port.
    pub fn local() -> DrPath {
        DrPath(vec![0])
    }

    // Number of hops (excluding the local entry).
    pub fn hop_count(&self) -> usize {
        self.0.len() - 1
    }

    // Returns a path extended by one egress port, or `None` once the
    // 64-hop directed-route limit would be exceeded.
    pub fn extended(&self, port_num: u8) -> Option<DrPath> {
        if self.hop_count() == DR_PATH_HOPS_MAX {
            return None;
        }
        let mut path = self.0.clone();
        path.push(port_num);
        Some(DrPath(path))
    }

    pub fn hops(&self) -> &[u8] {
        &self.0[1..]
    }
}

impl std::fmt::Display for DrPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        for hop in self.hops() {
            write!(&mut s, "{},", hop)?;
        }
        write!(f, "[{}]", s.trim_end_matches(','))
    }
}

// ===== global functions =====

// Number of LIDs owned by a port with the given LMC.
pub fn lids_per_port(lmc: u8) -> u16 {
    1 << lmc
}
