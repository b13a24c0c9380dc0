//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Shared topology builders for the routing engine tests.

#![allow(dead_code)]

use ibsm_subnet::{NodeIndex, Subnet};
use ibsm_utils::ib::{Guid, Lid, NO_PATH, NodeType};

// Distinguishes port GUIDs from node GUIDs in the fixtures.
const PORT_GUID_BASE: u64 = 0x1000_0000;

pub fn add_switch(
    subnet: &mut Subnet,
    guid: u64,
    num_ports: u8,
    lid: u16,
) -> NodeIndex {
    let node_idx = subnet.insert_node(Guid(guid), NodeType::Switch, num_ports);
    let port_idx =
        subnet.insert_port(Guid(PORT_GUID_BASE + guid), node_idx, 0);
    subnet.assign_lid(port_idx, Lid(lid), 0).unwrap();
    node_idx
}

pub fn add_ca(
    subnet: &mut Subnet,
    guid: u64,
    lid: u16,
    lmc: u8,
    sw_idx: NodeIndex,
    sw_port: u8,
) -> NodeIndex {
    let node_idx = subnet.insert_node(Guid(guid), NodeType::Ca, 1);
    let port_idx =
        subnet.insert_port(Guid(PORT_GUID_BASE + guid), node_idx, 1);
    subnet.assign_lid(port_idx, Lid(lid), lmc).unwrap();
    subnet.link(node_idx, 1, sw_idx, sw_port).unwrap();
    node_idx
}

pub fn link(
    subnet: &mut Subnet,
    a_idx: NodeIndex,
    a_port: u8,
    b_idx: NodeIndex,
    b_port: u8,
) {
    subnet.link(a_idx, a_port, b_idx, b_port).unwrap();
}

// Follows the new-LFT entries from `start` toward `lid`, returning the
// number of hops to the owning port, or None if the walk dead-ends or
// exceeds the 64-hop bound.
pub fn lft_walk(subnet: &Subnet, start: NodeIndex, lid: Lid) -> Option<usize> {
    let owner_idx = subnet.port_by_lid(lid)?;
    let owner_node_idx = subnet.ports[owner_idx].node_idx;

    let mut node_idx = start;
    for hops in 0..=64usize {
        let node = &subnet.nodes[node_idx];
        if node_idx == owner_node_idx {
            return Some(hops);
        }
        let sw_idx = node.switch_idx?;
        let egress = subnet.switches[sw_idx].new_lft_get(lid);
        if egress == NO_PATH {
            return None;
        }
        if egress == 0 {
            // Management port: the LID must belong to this switch.
            return (node_idx == owner_node_idx).then_some(hops);
        }
        let (remote_idx, _) = subnet.remote_of(node_idx, egress)?;
        node_idx = remote_idx;
    }
    None
}

// Asserts that every switch reaches every assigned LID via the new-LFT
// buffers.
pub fn assert_full_reachability(subnet: &Subnet) {
    for sw_idx in subnet.switch_indexes().collect::<Vec<_>>() {
        let node_idx = subnet.switches[sw_idx].node_idx;
        for lid in 1..=subnet.max_lid.0 {
            let lid = Lid(lid);
            if subnet.port_by_lid(lid).is_none() {
                continue;
            }
            assert!(
                lft_walk(subnet, node_idx, lid).is_some(),
                "switch {} cannot reach LID {}",
                subnet.switches[sw_idx].guid,
                lid
            );
        }
    }
}

// Snapshot of every switch's new-LFT buffer, for determinism checks.
pub fn lft_snapshot(subnet: &Subnet) -> Vec<(u64, Vec<u8>)> {
    subnet
        .switch_indexes()
        .map(|sw_idx| {
            let sw = &subnet.switches[sw_idx];
            let table = (0..=subnet.max_lid.0)
                .map(|lid| sw.new_lft_get(Lid(lid)))
                .collect();
            (sw.guid.0, table)
        })
        .collect()
}
