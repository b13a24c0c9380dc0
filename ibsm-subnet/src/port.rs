//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bitflags::bitflags;
use derive_new::new;
use ibsm_utils::ib::{
    DrPath, Guid, Lid, LinkSpeed, LinkState, LinkWidth, Mtu, lids_per_port,
};

use crate::subnet::NodeIndex;

bitflags! {
    // Health qualifiers of a physical port.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortFlags: u8 {
        // Administratively or heuristically excluded from routing.
        const FAULTY = 0x01;
        // Running below its nominal width/speed; avoided when
        // `avoid_throttled_links` is configured.
        const THROTTLED = 0x02;
    }
}

// A physical port: one per hardware port, including switch management
// port 0.
//
// The remote end is recorded as a stable (node index, port number) pair
// and revalidated on access; it is never a long-lived object reference.
#[derive(Debug)]
pub struct PhysPort {
    pub port_num: u8,
    pub port_guid: Guid,
    pub link_state: LinkState,
    pub link_width: LinkWidth,
    pub link_speed: LinkSpeed,
    pub mtu: Mtu,
    // How the SM reaches this port from its bound port.
    pub dr_path: DrPath,
    // Peer physical port, or None for an edge port facing a CA or an
    // unprobed link.
    pub remote: Option<(NodeIndex, u8)>,
    pub flags: PortFlags,
    pub discovery_count: u32,
}

// A logical endport owning a LID range.
//
// Exactly one exists per CA/router interface and one per switch
// (port 0).
#[derive(Debug)]
#[derive(new)]
pub struct Port {
    pub port_guid: Guid,
    // Owning node and physical port number.
    pub node_idx: NodeIndex,
    pub port_num: u8,
    #[new(default)]
    pub base_lid: Lid,
    #[new(default)]
    pub lmc: u8,
    // Set when the port was first seen during the current sweep; drives
    // the Trap 64 notices once the subnet is up.
    #[new(value = "true")]
    pub is_new: bool,
    #[new(default)]
    pub discovery_count: u32,
}

// ===== impl PhysPort =====

impl PhysPort {
    pub fn new(port_num: u8, port_guid: Guid) -> PhysPort {
        PhysPort {
            port_num,
            port_guid,
            link_state: LinkState::default(),
            link_width: LinkWidth::default(),
            link_speed: LinkSpeed::default(),
            mtu: Mtu::default(),
            dr_path: DrPath::local(),
            remote: None,
            flags: PortFlags::empty(),
            discovery_count: 0,
        }
    }
}

// ===== impl Port =====

impl Port {
    // The inclusive LID range `[base, base + 2^lmc - 1]` owned by this
    // endport, or None before LID assignment.
    pub fn lid_range(&self) -> Option<(Lid, Lid)> {
        if !self.base_lid.is_valid() {
            return None;
        }
        let min = self.base_lid;
        let max = Lid(min.0 + lids_per_port(self.lmc) - 1);
        Some((min, max))
    }
}
