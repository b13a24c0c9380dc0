//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use generational_arena::Index;
use ibsm_utils::ib::{Guid, Lid, LinkState, NO_PATH, NodeType, lids_per_port};
use tracing::warn;

use crate::error::Error;
use crate::node::Node;
use crate::port::{Port, PortFlags};
use crate::switch::{PathSpread, Switch};

pub type NodeIndex = Index;
pub type SwitchIndex = Index;
pub type PortIndex = Index;

#[derive(Debug)]
pub struct Arena<T>(generational_arena::Arena<T>);

// The discovered fabric: nodes, switches and endports in arenas, with
// GUID lookup trees and the LID-to-port vector.
//
// All iteration helpers walk the GUID trees so that every traversal of
// the model is deterministic.
#[derive(Debug, Default)]
pub struct Subnet {
    pub nodes: Arena<Node>,
    pub switches: Arena<Switch>,
    pub ports: Arena<Port>,
    node_guid_tree: BTreeMap<Guid, NodeIndex>,
    sw_guid_tree: BTreeMap<Guid, SwitchIndex>,
    port_guid_tree: BTreeMap<Guid, PortIndex>,
    // lid -> owning endport; one entry per LID of the owning port's
    // range.
    lid_table: Vec<Option<PortIndex>>,
    pub max_lid: Lid,
}

// ===== impl Arena =====

impl<T> Default for Arena<T> {
    fn default() -> Arena<T> {
        Arena(Default::default())
    }
}

impl<T> std::ops::Index<Index> for Arena<T> {
    type Output = T;

    fn index(&self, index: Index) -> &Self::Output {
        &self.0[index]
    }
}

impl<T> std::ops::IndexMut<Index> for Arena<T> {
    fn index_mut(&mut self, index: Index) -> &mut Self::Output {
        &mut self.0[index]
    }
}

impl<T> Arena<T> {
    pub fn get(&self, index: Index) -> Option<&T> {
        self.0.get(index)
    }

    pub fn get_mut(&mut self, index: Index) -> Option<&mut T> {
        self.0.get_mut(index)
    }

    pub fn get2_mut(
        &mut self,
        a: Index,
        b: Index,
    ) -> (Option<&mut T>, Option<&mut T>) {
        self.0.get2_mut(a, b)
    }
}

// ===== impl Subnet =====

impl Subnet {
    // ===== insertion and lookup =====

    pub fn insert_node(
        &mut self,
        guid: Guid,
        node_type: NodeType,
        num_ports: u8,
    ) -> NodeIndex {
        let node_idx = self.nodes.0.insert(Node::new(guid, node_type, num_ports));
        self.node_guid_tree.insert(guid, node_idx);

        // Switches get their routing state and their port-0 endport up
        // front; CA/router endports are created per discovered port.
        if node_type == NodeType::Switch {
            let sw_idx = self
                .switches
                .0
                .insert(Switch::new(node_idx, guid, num_ports));
            self.sw_guid_tree.insert(guid, sw_idx);
            self.nodes[node_idx].switch_idx = Some(sw_idx);
        }

        node_idx
    }

    pub fn insert_port(
        &mut self,
        port_guid: Guid,
        node_idx: NodeIndex,
        port_num: u8,
    ) -> PortIndex {
        let port_idx = self
            .ports
            .0
            .insert(Port::new(port_guid, node_idx, port_num));
        self.port_guid_tree.insert(port_guid, port_idx);
        self.nodes[node_idx].endports.push(port_idx);
        port_idx
    }

    pub fn node_by_guid(&self, guid: Guid) -> Option<(NodeIndex, &Node)> {
        self.node_guid_tree
            .get(&guid)
            .copied()
            .map(|node_idx| (node_idx, &self.nodes[node_idx]))
    }

    pub fn switch_by_guid(&self, guid: Guid) -> Option<(SwitchIndex, &Switch)> {
        self.sw_guid_tree
            .get(&guid)
            .copied()
            .map(|sw_idx| (sw_idx, &self.switches[sw_idx]))
    }

    pub fn port_by_guid(&self, guid: Guid) -> Option<(PortIndex, &Port)> {
        self.port_guid_tree
            .get(&guid)
            .copied()
            .map(|port_idx| (port_idx, &self.ports[port_idx]))
    }

    // ===== deterministic iteration =====

    pub fn node_indexes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.node_guid_tree.values().copied()
    }

    pub fn switch_indexes(&self) -> impl Iterator<Item = SwitchIndex> + '_ {
        self.sw_guid_tree.values().copied()
    }

    pub fn port_indexes(&self) -> impl Iterator<Item = PortIndex> + '_ {
        self.port_guid_tree.values().copied()
    }

    pub fn num_switches(&self) -> usize {
        self.sw_guid_tree.len()
    }

    // ===== links =====

    // Records a bidirectional link between two physical ports.
    pub fn link(
        &mut self,
        a_idx: NodeIndex,
        a_port: u8,
        b_idx: NodeIndex,
        b_port: u8,
    ) -> Result<(), Error> {
        let (a, b) = self.nodes.get2_mut(a_idx, b_idx);
        let a = a.ok_or(Error::NodeGuidNotFound(Guid::default()))?;
        let b = b.ok_or(Error::NodeGuidNotFound(Guid::default()))?;
        let a_guid = a.guid;
        let b_guid = b.guid;
        a.physp_mut(a_port)
            .ok_or(Error::InvalidPortNum(a_guid, a_port))?
            .remote = Some((b_idx, b_port));
        b.physp_mut(b_port)
            .ok_or(Error::InvalidPortNum(b_guid, b_port))?
            .remote = Some((a_idx, a_port));
        Ok(())
    }

    // Resolves the remote end of a physical port, revalidating the
    // stored indexes.
    pub fn remote_of(
        &self,
        node_idx: NodeIndex,
        port_num: u8,
    ) -> Option<(NodeIndex, u8)> {
        let (remote_idx, remote_port) = self
            .nodes
            .get(node_idx)?
            .physp(port_num)?
            .remote?;
        let remote = self.nodes.get(remote_idx)?;
        remote.physp(remote_port)?;
        Some((remote_idx, remote_port))
    }

    // A link is healthy iff both endpoints resolve and neither is
    // marked faulty (nor throttled, when throttled links are avoided).
    pub fn link_is_healthy(
        &self,
        node_idx: NodeIndex,
        port_num: u8,
        avoid_throttled: bool,
    ) -> bool {
        let Some(node) = self.nodes.get(node_idx) else {
            return false;
        };
        let Some(physp) = node.physp(port_num) else {
            return false;
        };
        let Some((remote_idx, remote_port)) = physp.remote else {
            return false;
        };
        let Some(remote) = self
            .nodes
            .get(remote_idx)
            .and_then(|remote| remote.physp(remote_port))
        else {
            return false;
        };
        if physp.flags.contains(PortFlags::FAULTY)
            || remote.flags.contains(PortFlags::FAULTY)
        {
            return false;
        }
        if avoid_throttled
            && (physp.flags.contains(PortFlags::THROTTLED)
                || remote.flags.contains(PortFlags::THROTTLED))
        {
            return false;
        }
        true
    }

    // ===== LID table =====

    pub fn clear_lid_table(&mut self) {
        self.lid_table.clear();
        self.max_lid = Lid(0);
    }

    // Registers an endport's LID range in the lid table.
    //
    // A conflicting claim is reported and leaves the previous owner in
    // place; discovery reacts by scheduling a reassignment.
    pub fn assign_lid(
        &mut self,
        port_idx: PortIndex,
        base_lid: Lid,
        lmc: u8,
    ) -> Result<(), Error> {
        if !base_lid.is_valid() {
            return Err(Error::LidOutOfRange(base_lid));
        }
        let top = base_lid.0 + lids_per_port(lmc) - 1;
        if !Lid(top).is_valid() {
            return Err(Error::LidOutOfRange(Lid(top)));
        }

        if self.lid_table.len() <= top as usize {
            self.lid_table.resize(top as usize + 1, None);
        }
        for lid in base_lid.0..=top {
            let entry = &mut self.lid_table[lid as usize];
            if let Some(owner_idx) = *entry
                && owner_idx != port_idx
            {
                let owner = self.ports[owner_idx].port_guid;
                let claimer = self.ports[port_idx].port_guid;
                return Err(Error::LidConflict(Lid(lid), owner, claimer));
            }
            *entry = Some(port_idx);
        }

        let port = &mut self.ports[port_idx];
        port.base_lid = base_lid;
        port.lmc = lmc;
        if Lid(top) > self.max_lid {
            self.max_lid = Lid(top);
        }
        Ok(())
    }

    pub fn port_by_lid(&self, lid: Lid) -> Option<PortIndex> {
        self.lid_table.get(lid.0 as usize).copied().flatten()
    }

    // Base LID of a node's management endport (switches) or of its only
    // endport (CAs with a single active port).
    pub fn node_base_lid(&self, node_idx: NodeIndex) -> Option<Lid> {
        let node = self.nodes.get(node_idx)?;
        let mut endports = node
            .endports
            .iter()
            .map(|&port_idx| &self.ports[port_idx]);
        let port = if node.is_switch() {
            endports.find(|port| port.port_num == 0)?
        } else {
            endports.next()?
        };
        Some(port.base_lid).filter(|lid| lid.is_valid())
    }

    pub fn switch_base_lid(&self, sw_idx: SwitchIndex) -> Option<Lid> {
        let sw = self.switches.get(sw_idx)?;
        self.node_base_lid(sw.node_idx)
    }

    // ===== discovery bookkeeping =====

    pub fn reset_discovery_counts(&mut self) {
        for (_, node) in self.nodes.0.iter_mut() {
            node.discovery_count = 0;
            for physp in node.physp.iter_mut() {
                physp.discovery_count = 0;
            }
        }
        for (_, port) in self.ports.0.iter_mut() {
            port.discovery_count = 0;
        }
        for (_, sw) in self.switches.0.iter_mut() {
            sw.discovery_count = 0;
        }
    }

    // Drops every discovered object. Used when the SM's own port went
    // down and all remote state is stale.
    pub fn clear(&mut self) {
        *self = Subnet::default();
        warn!("subnet model dropped, awaiting rediscovery");
    }

    // ===== routing helpers =====

    // Recommends the egress port on `sw_idx` for `lid`.
    //
    // The hop matrix only tracks switch LIDs, so a LID owned by a
    // CA/router endport is first resolved to the switch fronting it: a
    // CA hanging directly off this switch short-circuits to the edge
    // port, anything else routes toward the fronting switch's base LID.
    pub fn recommend_path(
        &self,
        sw_idx: SwitchIndex,
        lid: Lid,
        ignore_existing: bool,
        spread: Option<&mut PathSpread>,
    ) -> u8 {
        let sw = &self.switches[sw_idx];
        let Some(port_idx) = self.port_by_lid(lid) else {
            return NO_PATH;
        };
        let port = &self.ports[port_idx];
        let dest_node = &self.nodes[port.node_idx];

        let via_lid = if dest_node.is_switch() {
            if dest_node.switch_idx == Some(sw_idx) {
                return 0;
            }
            match self.node_base_lid(port.node_idx) {
                Some(lid) => lid,
                None => return NO_PATH,
            }
        } else {
            let Some((remote_idx, remote_port)) =
                self.remote_of(port.node_idx, port.port_num)
            else {
                return NO_PATH;
            };
            // Destination hangs directly off this switch.
            if remote_idx == sw.node_idx {
                return remote_port;
            }
            match self.node_base_lid(remote_idx) {
                Some(lid) => lid,
                None => return NO_PATH,
            }
        };

        let nodes = &self.nodes;
        let node = &nodes[sw.node_idx];
        sw.recommend_path(lid, via_lid, ignore_existing, spread, |port_num| {
            let (remote_idx, _) = node.physp(port_num)?.remote?;
            let remote = nodes.get(remote_idx)?;
            Some((remote.sys_guid, remote.guid))
        })
    }

    // Marks every port of every switch as up; test topologies use this
    // to skip the link-training phases.
    pub fn activate_all_links(&mut self) {
        for (_, node) in self.nodes.0.iter_mut() {
            for physp in node.physp.iter_mut() {
                if physp.remote.is_some() {
                    physp.link_state = LinkState::Active;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lid_assignment() {
        let mut subnet = Subnet::default();
        let node_idx = subnet.insert_node(Guid(1), NodeType::Ca, 1);
        let port_idx = subnet.insert_port(Guid(0x11), node_idx, 1);

        subnet.assign_lid(port_idx, Lid(4), 1).unwrap();
        assert_eq!(subnet.port_by_lid(Lid(4)), Some(port_idx));
        assert_eq!(subnet.port_by_lid(Lid(5)), Some(port_idx));
        assert_eq!(subnet.port_by_lid(Lid(6)), None);
        assert_eq!(subnet.max_lid, Lid(5));

        // A second port claiming an owned LID must be rejected.
        let other_idx = subnet.insert_port(Guid(0x12), node_idx, 1);
        assert!(matches!(
            subnet.assign_lid(other_idx, Lid(5), 0),
            Err(Error::LidConflict(..))
        ));
    }

    #[test]
    fn link_health() {
        let mut subnet = Subnet::default();
        let a = subnet.insert_node(Guid(1), NodeType::Switch, 4);
        let b = subnet.insert_node(Guid(2), NodeType::Switch, 4);
        subnet.link(a, 1, b, 3).unwrap();

        assert_eq!(subnet.remote_of(a, 1), Some((b, 3)));
        assert_eq!(subnet.remote_of(b, 3), Some((a, 1)));
        assert!(subnet.link_is_healthy(a, 1, false));

        subnet.nodes[b]
            .physp_mut(3)
            .unwrap()
            .flags
            .insert(PortFlags::FAULTY);
        assert!(!subnet.link_is_healthy(a, 1, false));
    }
}
