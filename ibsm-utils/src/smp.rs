//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::Bytes;
use derive_new::new;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::ib::{Guid, Lid, LinkSpeed, LinkState, LinkWidth, Mtu, NodeType, SmState};

// Entries per LinearForwardingTable block.
pub const LFT_BLOCK_SIZE: usize = 64;

// Subnet management attribute identifiers.
//
// Only the attributes the routing core consumes appear here; wire
// encoding and the remaining management classes live with the transport
// collaborator.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum SmpAttr {
    NodeInfo = 0x0011,
    SwitchInfo = 0x0012,
    PortInfo = 0x0015,
    PKeyTable = 0x0016,
    LinFwdTbl = 0x0019,
    SmInfo = 0x0020,
}

// Subnet management methods.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SmpMethod {
    Get,
    Set,
}

// SMInfo Set attribute modifiers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum SmInfoAttrMod {
    Handover = 1,
    Acknowledge = 2,
    Disable = 3,
    Standby = 4,
    Discover = 5,
}

// Pre-decoded NodeInfo attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct NodeInfoAttr {
    pub node_type: NodeType,
    pub num_ports: u8,
    pub sys_guid: Guid,
    pub node_guid: Guid,
    pub port_guid: Guid,
    // Port the SMP entered through, as reported by the node itself.
    pub local_port_num: u8,
}

// Pre-decoded SwitchInfo attribute.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct SwitchInfoAttr {
    // Number of entries the linear forwarding table supports.
    pub lin_cap: u16,
    // Top of the configured linear forwarding table.
    pub lin_top: u16,
    // PortStateChange: set by the switch on any port state transition,
    // cleared by writing SwitchInfo.
    pub state_change: bool,
    pub life_state: u8,
}

// Pre-decoded PortInfo attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct PortInfoAttr {
    pub port_guid: Guid,
    pub base_lid: Lid,
    pub lmc: u8,
    pub link_state: LinkState,
    pub neighbor_mtu: Mtu,
    pub link_width_active: LinkWidth,
    pub link_speed_active: LinkSpeed,
    pub master_sm_lid: Lid,
}

// Pre-decoded SMInfo attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct SmInfoAttr {
    pub guid: Guid,
    pub act_count: u32,
    pub priority: u8,
    pub sm_state: SmState,
}

// Typed SMP payloads exchanged with the transport collaborator.
//
// The request issuer is oblivious to these; only the sweep phases and
// the discovery logic interpret them.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SmpPayload {
    None,
    NodeInfo(NodeInfoAttr),
    SwitchInfo(SwitchInfoAttr),
    PortInfo(PortInfoAttr),
    SmInfo(SmInfoAttr),
    // One 64-entry LFT block; the block index travels in the attribute
    // modifier.
    LftBlock(Bytes),
    // Pre-validated partition keys for one PKeyTable block.
    PKeyBlock(Vec<u16>),
}

// ===== impl SmInfoAttr =====

impl SmInfoAttr {
    // Mastership precedence: higher priority wins, lower GUID breaks
    // ties.
    pub fn is_higher_than(&self, other: &SmInfoAttr) -> bool {
        (self.priority, std::cmp::Reverse(self.guid))
            > (other.priority, std::cmp::Reverse(other.guid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sm_precedence() {
        let a = SmInfoAttr::new(Guid(1), 0, 10, SmState::Discovering);
        let b = SmInfoAttr::new(Guid(2), 0, 10, SmState::Discovering);
        let c = SmInfoAttr::new(Guid(3), 0, 12, SmState::Discovering);
        assert!(a.is_higher_than(&b));
        assert!(!b.is_higher_than(&a));
        assert!(c.is_higher_than(&a));
    }
}
