//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::{Guid, NodeType};
use smallvec::SmallVec;

use crate::port::PhysPort;
use crate::subnet::{PortIndex, SwitchIndex};

// A fabric node: CA, router or switch.
//
// The physical port array is indexed by port number; entry 0 is the
// management port for switches and unused for CAs/routers, matching the
// IBA numbering.
#[derive(Debug)]
pub struct Node {
    pub guid: Guid,
    // System image GUID: equal across nodes of one chassis.
    pub sys_guid: Guid,
    pub node_type: NodeType,
    pub num_ports: u8,
    pub description: String,
    pub physp: Vec<PhysPort>,
    // Set for switches only.
    pub switch_idx: Option<SwitchIndex>,
    // Endports hosted by this node (one per CA/router interface, port 0
    // for switches).
    pub endports: SmallVec<[PortIndex; 2]>,
    pub discovery_count: u32,
}

// ===== impl Node =====

impl Node {
    pub fn new(guid: Guid, node_type: NodeType, num_ports: u8) -> Node {
        let physp = (0..=num_ports)
            .map(|port_num| PhysPort::new(port_num, Guid::default()))
            .collect();
        Node {
            guid,
            sys_guid: guid,
            node_type,
            num_ports,
            description: String::new(),
            physp,
            switch_idx: None,
            endports: SmallVec::new(),
            discovery_count: 0,
        }
    }

    pub fn is_switch(&self) -> bool {
        self.node_type == NodeType::Switch
    }

    pub fn physp(&self, port_num: u8) -> Option<&PhysPort> {
        self.physp.get(port_num as usize)
    }

    pub fn physp_mut(&mut self, port_num: u8) -> Option<&mut PhysPort> {
        self.physp.get_mut(port_num as usize)
    }

    // Iterates over the data ports (skipping management port 0).
    pub fn data_ports(&self) -> impl Iterator<Item = &PhysPort> {
        self.physp.iter().skip(1)
    }
}
