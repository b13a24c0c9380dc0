//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use std::collections::BTreeMap;

use common::{add_ca, add_switch, assert_full_reachability, lft_snapshot, link};
use ibsm_routing::ftree::FTreeEngine;
use ibsm_routing::route_subnet;
use ibsm_subnet::Subnet;
use ibsm_utils::config::SmConfig;
use ibsm_utils::ib::{Guid, Lid};

// 4-ary 2-tree: two spines, four leaves, two CAs per leaf.
//
// Leaf ports: 1-2 down to the CAs, 3 up to spine 1, 4 up to spine 2.
// Spine ports: 1-4 down to the leaves.
fn fat_tree() -> Subnet {
    let mut subnet = Subnet::default();

    let spine1 = add_switch(&mut subnet, 0x51, 4, 1);
    let spine2 = add_switch(&mut subnet, 0x52, 4, 2);

    let mut ca_lid = 10;
    for leaf_pos in 0..4u64 {
        let leaf =
            add_switch(&mut subnet, 0x10 + leaf_pos, 4, 3 + leaf_pos as u16);
        link(&mut subnet, leaf, 3, spine1, 1 + leaf_pos as u8);
        link(&mut subnet, leaf, 4, spine2, 1 + leaf_pos as u8);
        for ca_pos in 0..2u64 {
            add_ca(
                &mut subnet,
                0x100 + leaf_pos * 2 + ca_pos,
                ca_lid,
                0,
                leaf,
                1 + ca_pos as u8,
            );
            ca_lid += 1;
        }
    }

    subnet.activate_all_links();
    subnet
}

#[test]
fn routes_fat_tree_without_fallback() {
    let mut subnet = fat_tree();
    let config = SmConfig::default();
    let mut engine = FTreeEngine::default();

    let summary = route_subnet(&mut subnet, &config, &mut engine);
    assert!(!summary.used_fallback, "fat-tree engine fell back to minhop");

    assert_full_reachability(&subnet);
}

// Load balance law: with two CAs per leaf and two spines, every spine
// serves exactly two CA LIDs through each of its four down ports, and
// every leaf pushes exactly three remote CAs through each of its two up
// ports.
#[test]
fn counters_balance_exactly() {
    let mut subnet = fat_tree();
    let config = SmConfig::default();
    let mut engine = FTreeEngine::default();
    route_subnet(&mut subnet, &config, &mut engine);

    let ca_lids = (10..18).map(Lid).collect::<Vec<_>>();

    for spine_guid in [0x51, 0x52] {
        let (_, spine) = subnet.switch_by_guid(Guid(spine_guid)).unwrap();
        let mut per_port: BTreeMap<u8, usize> = BTreeMap::new();
        for &lid in &ca_lids {
            let egress = spine.new_lft_get(lid);
            *per_port.entry(egress).or_default() += 1;
        }
        assert_eq!(per_port.len(), 4, "spine must use all four down ports");
        assert!(
            per_port.values().all(|&count| count == 2),
            "uneven spine load: {:?}",
            per_port
        );
    }

    for leaf_pos in 0..4u64 {
        let (_, leaf) = subnet.switch_by_guid(Guid(0x10 + leaf_pos)).unwrap();
        let mut per_up_port: BTreeMap<u8, usize> = BTreeMap::new();
        for &lid in &ca_lids {
            let egress = leaf.new_lft_get(lid);
            if egress == 3 || egress == 4 {
                *per_up_port.entry(egress).or_default() += 1;
            }
        }
        // Six remote CAs, split three per up port.
        assert_eq!(per_up_port, maplit::btreemap! { 3 => 3, 4 => 3 });
    }
}

#[test]
fn lmc_rejected() {
    let mut subnet = fat_tree();
    let mut config = SmConfig::default();
    config.lmc = 1;
    let mut engine = FTreeEngine::default();

    let summary = route_subnet(&mut subnet, &config, &mut engine);
    assert!(summary.used_fallback, "LMC > 0 must fall back to minhop");
}

#[test]
fn ca_to_ca_link_rejected() {
    let mut subnet = fat_tree();
    let ca_a = subnet.insert_node(Guid(0x900), ibsm_utils::ib::NodeType::Ca, 2);
    let ca_b = subnet.insert_node(Guid(0x901), ibsm_utils::ib::NodeType::Ca, 2);
    subnet.insert_port(Guid(0x1900), ca_a, 1);
    subnet.insert_port(Guid(0x1901), ca_b, 1);
    subnet.link(ca_a, 2, ca_b, 2).unwrap();

    let config = SmConfig::default();
    let mut engine = FTreeEngine::default();
    let summary = route_subnet(&mut subnet, &config, &mut engine);
    assert!(summary.used_fallback);
}

#[test]
fn routing_is_deterministic() {
    let config = SmConfig::default();

    let mut first = fat_tree();
    route_subnet(&mut first, &config, &mut FTreeEngine::default());
    let mut second = fat_tree();
    route_subnet(&mut second, &config, &mut FTreeEngine::default());

    assert_eq!(lft_snapshot(&first), lft_snapshot(&second));
}
