//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, VecDeque};
use std::io::Write;

use ibsm_subnet::{NodeIndex, Subnet, SwitchIndex};
use itertools::Itertools;
use ibsm_utils::config::SmConfig;
use ibsm_utils::ib::{Guid, Lid, NO_PATH, NodeType};

use crate::RoutingEngine;
use crate::debug::Debug;
use crate::error::Error;

// Tree depth limits: a k-ary-n-tree of fewer than 2 or more than 8
// levels is rejected.
const MIN_RANK: u8 = 2;
const MAX_RANK: u8 = 8;
// Tuple digits: one rank byte plus one digit per level.
const TUPLE_LEN: usize = MAX_RANK as usize + 1;
const RANK_UNASSIGNED: u8 = 0xFF;

// A switch index within one level of the tree. Byte 0 holds the
// switch's rank, bytes 1..=rank the per-level digits; an all-0xFF
// tuple is unassigned.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Tuple([u8; TUPLE_LEN]);

#[derive(Debug)]
struct FtreePort {
    port_num: u8,
    remote_port_num: u8,
    // Up-going routes through this port (tracked on the lower-rank
    // side of the link).
    counter_up: u32,
    // Down-going routes through this port (tracked on the higher-rank
    // side of the link).
    counter_down: u32,
}

// All parallel links between one switch and one remote switch or CA.
#[derive(Debug)]
struct PortGroup {
    remote_guid: Guid,
    remote_base_lid: Lid,
    remote: RemoteEnd,
    // Remote switch tuple at sorting time; groups are ordered by it.
    remote_tuple: Tuple,
    ports: Vec<FtreePort>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RemoteEnd {
    Switch(usize),
    Ca(usize),
}

#[derive(Debug)]
struct FtreeSw {
    sw_idx: SwitchIndex,
    node_idx: NodeIndex,
    guid: Guid,
    base_lid: Lid,
    rank: u8,
    tuple: Tuple,
    up_groups: Vec<PortGroup>,
    down_groups: Vec<PortGroup>,
}

#[derive(Debug)]
struct FtreeCa {
    node_idx: NodeIndex,
    guid: Guid,
    description: String,
}

// The fat-tree view of the fabric, rebuilt from the subnet model on
// every routing pass.
#[derive(Debug, Default)]
struct FtreeFabric {
    sws: Vec<FtreeSw>,
    sw_by_guid: BTreeMap<Guid, usize>,
    sw_by_tuple: BTreeMap<Tuple, usize>,
    cas: Vec<FtreeCa>,
    // Leaf switches sorted by tuple; destination CAs are processed in
    // this order.
    leaf_switches: Vec<usize>,
    max_cas_per_leaf: usize,
    tree_rank: u8,
}

// Topology-aware engine for k-ary-n-trees.
#[derive(Debug, Default)]
pub struct FTreeEngine {
    fabric: Option<FtreeFabric>,
}

// ===== impl Tuple =====

impl Tuple {
    fn unassigned() -> Tuple {
        Tuple([RANK_UNASSIGNED; TUPLE_LEN])
    }

    fn is_assigned(&self) -> bool {
        self.0[0] != RANK_UNASSIGNED
    }

    // First tuple of a level: [rank].0.0...0.
    fn first(rank: u8) -> Tuple {
        let mut tuple = Tuple::unassigned();
        tuple.0[0] = rank;
        for digit in tuple.0[1..=rank as usize].iter_mut() {
            *digit = 0;
        }
        tuple
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_assigned() {
            return write!(f, "index-not-assigned");
        }
        let digits =
            self.0[1..=self.0[0] as usize].iter().join(".");
        write!(f, "{}.{}", self.0[0], digits)
    }
}

// ===== impl FtreeFabric =====

impl FtreeFabric {
    fn leaf_rank(&self) -> u8 {
        self.tree_rank - 1
    }

    // Allocates the next free tuple one level up or down from
    // `from_tuple`.
    fn new_tuple(&self, from_tuple: Tuple, down: bool) -> Option<Tuple> {
        let mut tuple = from_tuple;
        let var_index = if down {
            tuple.0[0] += 1;
            from_tuple.0[0] as usize + 1
        } else {
            tuple.0[0] -= 1;
            from_tuple.0[0] as usize
        };

        (0..RANK_UNASSIGNED).map(|digit| {
            let mut candidate = tuple;
            candidate.0[var_index] = digit;
            candidate
        })
        .find(|candidate| !self.sw_by_tuple.contains_key(candidate))
    }

    fn assign_tuple(&mut self, sw: usize, tuple: Tuple) {
        self.sws[sw].tuple = tuple;
        self.sw_by_tuple.insert(tuple, sw);
    }
}

// ===== impl FTreeEngine =====

impl RoutingEngine for FTreeEngine {
    fn name(&self) -> &'static str {
        "ftree"
    }

    // Builds and validates the fat-tree view of the fabric. The hop
    // tables themselves are filled during routing, together with the
    // LFTs.
    fn build_hop_matrices(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error> {
        self.fabric = None;
        let fabric = construct_fabric(subnet, config)?;
        self.fabric = Some(fabric);
        Ok(())
    }

    fn build_ucast_tables(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error> {
        let Some(fabric) = self.fabric.as_mut() else {
            return Err(Error::Unsupported);
        };

        route_to_cas(fabric, subnet);
        route_to_switches(fabric, subnet);

        if let Some(dir) = &config.dump_files_dir
            && let Err(error) =
                dump_ca_order(fabric, &dir.join("opensm-ftree-ca-order.dump"))
        {
            error.log();
        }

        Ok(())
    }
}

// ===== helper functions =====

// Builds the fat-tree fabric view: populate, rank, index, validate.
fn construct_fabric(
    subnet: &Subnet,
    config: &SmConfig,
) -> Result<FtreeFabric, Error> {
    if config.lmc > 0 {
        return Err(Error::LmcNotSupported(config.lmc));
    }
    if subnet.num_switches() < 2 {
        return Err(Error::NotFatTree("fewer than two switches"));
    }

    let mut fabric = FtreeFabric::default();

    // Populate switches and CAs in GUID order.
    for sw_idx in subnet.switch_indexes() {
        let sw = &subnet.switches[sw_idx];
        let Some(base_lid) = subnet.switch_base_lid(sw_idx) else {
            return Err(Error::NotFatTree("switch without a LID"));
        };
        fabric.sw_by_guid.insert(sw.guid, fabric.sws.len());
        fabric.sws.push(FtreeSw {
            sw_idx,
            node_idx: sw.node_idx,
            guid: sw.guid,
            base_lid,
            rank: RANK_UNASSIGNED,
            tuple: Tuple::unassigned(),
            up_groups: Vec::new(),
            down_groups: Vec::new(),
        });
    }
    for node_idx in subnet.node_indexes() {
        let node = &subnet.nodes[node_idx];
        if node.node_type == NodeType::Ca {
            fabric.cas.push(FtreeCa {
                node_idx,
                guid: node.guid,
                description: node.description.clone(),
            });
        }
    }
    if fabric.cas.len() < 2 {
        return Err(Error::NotFatTree("fewer than two CAs"));
    }

    perform_ranking(&mut fabric, subnet, config)?;
    populate_port_groups(&mut fabric, subnet, config)?;
    make_indexing(&mut fabric);
    validate_topology(&fabric)?;

    Ok(fabric)
}

// Ranks every switch: BFS from each CA-attached switch taking minimum
// depth, then inversion so rank 0 is the top of the tree.
fn perform_ranking(
    fabric: &mut FtreeFabric,
    subnet: &Subnet,
    config: &SmConfig,
) -> Result<(), Error> {
    for ca_pos in 0..fabric.cas.len() {
        let node_idx = fabric.cas[ca_pos].node_idx;
        let node = &subnet.nodes[node_idx];
        for physp in node.data_ports() {
            if !subnet.link_is_healthy(
                node_idx,
                physp.port_num,
                config.avoid_throttled_links,
            ) {
                continue;
            }
            let Some((remote_idx, _)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            let remote = &subnet.nodes[remote_idx];
            match remote.node_type {
                NodeType::Ca => {
                    return Err(Error::CaCaLink(node.guid, remote.guid));
                }
                NodeType::Router => continue,
                NodeType::Switch => (),
            }

            let sw = fabric.sw_by_guid[&remote.guid];
            if fabric.sws[sw].rank == 0 {
                continue;
            }
            rank_from_switch(fabric, subnet, config, sw);
        }
    }

    let max_rank = fabric
        .sws
        .iter()
        .map(|sw| sw.rank)
        .max()
        .unwrap_or(RANK_UNASSIGNED);
    if max_rank == RANK_UNASSIGNED {
        return Err(Error::NotFatTree("switch not reachable from any CA"));
    }
    fabric.tree_rank = max_rank + 1;

    // Reverse the ranking so that roots get rank 0.
    for sw in fabric.sws.iter_mut() {
        if sw.rank == RANK_UNASSIGNED {
            return Err(Error::NotFatTree("switch not reachable from any CA"));
        }
        sw.rank = fabric.tree_rank - sw.rank - 1;
    }
    for sw in &fabric.sws {
        Debug::FtreeRankAssigned(sw.guid, sw.rank).log();
    }

    if fabric.tree_rank < MIN_RANK || fabric.tree_rank > MAX_RANK {
        return Err(Error::RankBounds(fabric.tree_rank));
    }

    Ok(())
}

// BFS from one CA-attached switch, keeping the minimal rank seen.
fn rank_from_switch(
    fabric: &mut FtreeFabric,
    subnet: &Subnet,
    config: &SmConfig,
    start: usize,
) {
    fabric.sws[start].rank = 0;
    let mut bfs = VecDeque::from([start]);

    while let Some(sw) = bfs.pop_front() {
        let node_idx = fabric.sws[sw].node_idx;
        let rank = fabric.sws[sw].rank;
        let node = &subnet.nodes[node_idx];
        for physp in node.data_ports() {
            if !subnet.link_is_healthy(
                node_idx,
                physp.port_num,
                config.avoid_throttled_links,
            ) {
                continue;
            }
            let Some((remote_idx, _)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            let remote = &subnet.nodes[remote_idx];
            if remote.node_type != NodeType::Switch {
                continue;
            }
            let remote_sw = fabric.sw_by_guid[&remote.guid];
            let remote_rank = fabric.sws[remote_sw].rank;
            if remote_rank != RANK_UNASSIGNED && remote_rank <= rank + 1 {
                continue;
            }
            fabric.sws[remote_sw].rank = rank + 1;
            bfs.push_back(remote_sw);
        }
    }
}

// Groups every switch's parallel links by remote node.
fn populate_port_groups(
    fabric: &mut FtreeFabric,
    subnet: &Subnet,
    config: &SmConfig,
) -> Result<(), Error> {
    let ca_by_guid = fabric
        .cas
        .iter()
        .enumerate()
        .map(|(ca, entry)| (entry.guid, ca))
        .collect::<BTreeMap<_, _>>();

    for sw in 0..fabric.sws.len() {
        let node_idx = fabric.sws[sw].node_idx;
        let rank = fabric.sws[sw].rank;
        let node = &subnet.nodes[node_idx];

        for physp in node.data_ports() {
            if !subnet.link_is_healthy(
                node_idx,
                physp.port_num,
                config.avoid_throttled_links,
            ) {
                continue;
            }
            let Some((remote_idx, remote_port)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            let remote = &subnet.nodes[remote_idx];

            let (remote_end, remote_base_lid, down) = match remote.node_type {
                NodeType::Router => continue,
                NodeType::Ca => {
                    if rank != fabric.leaf_rank() {
                        return Err(Error::NotFatTree(
                            "CA attached above the leaf level",
                        ));
                    }
                    let ca = ca_by_guid[&remote.guid];
                    let remote_lid = subnet
                        .node_base_lid(remote_idx)
                        .unwrap_or(Lid(0));
                    (RemoteEnd::Ca(ca), remote_lid, true)
                }
                NodeType::Switch => {
                    let remote_sw = fabric.sw_by_guid[&remote.guid];
                    let remote_rank = fabric.sws[remote_sw].rank;
                    if rank.abs_diff(remote_rank) != 1 {
                        return Err(Error::NotFatTree(
                            "link between non-adjacent ranks",
                        ));
                    }
                    let remote_lid = fabric.sws[remote_sw].base_lid;
                    (RemoteEnd::Switch(remote_sw), remote_lid, remote_rank > rank)
                }
            };

            let groups = if down {
                &mut fabric.sws[sw].down_groups
            } else {
                &mut fabric.sws[sw].up_groups
            };
            let group_pos = match groups
                .iter()
                .position(|group| group.remote_guid == remote.guid)
            {
                Some(group_pos) => group_pos,
                None => {
                    groups.push(PortGroup {
                        remote_guid: remote.guid,
                        remote_base_lid,
                        remote: remote_end,
                        remote_tuple: Tuple::unassigned(),
                        ports: Vec::new(),
                    });
                    groups.len() - 1
                }
            };
            groups[group_pos].ports.push(FtreePort {
                port_num: physp.port_num,
                remote_port_num: remote_port,
                counter_up: 0,
                counter_down: 0,
            });
        }
    }

    Ok(())
}

// Assigns a tuple index to every switch by BFS from one leaf, then
// sorts port groups and the leaf array by tuple.
fn make_indexing(fabric: &mut FtreeFabric) {
    let Some(start) = fabric
        .sws
        .iter()
        .position(|sw| sw.rank == fabric.leaf_rank())
    else {
        return;
    };
    fabric.assign_tuple(start, Tuple::first(fabric.leaf_rank()));
    let mut bfs = VecDeque::from([start]);

    while let Some(sw) = bfs.pop_front() {
        if fabric.sws[sw].rank == fabric.leaf_rank() {
            fabric.leaf_switches.push(sw);
            fabric.max_cas_per_leaf = fabric
                .max_cas_per_leaf
                .max(fabric.sws[sw].down_groups.len());
        } else {
            // Non-leaf: every down group points at another switch.
            for i in 0..fabric.sws[sw].down_groups.len() {
                let RemoteEnd::Switch(remote_sw) =
                    fabric.sws[sw].down_groups[i].remote
                else {
                    continue;
                };
                if fabric.sws[remote_sw].tuple.is_assigned() {
                    continue;
                }
                let from = fabric.sws[sw].tuple;
                if let Some(tuple) = fabric.new_tuple(from, true) {
                    fabric.assign_tuple(remote_sw, tuple);
                    bfs.push_back(remote_sw);
                }
            }
            sort_groups_by_remote_tuple(fabric, sw, true);
        }

        if fabric.sws[sw].rank != 0 {
            for i in 0..fabric.sws[sw].up_groups.len() {
                let RemoteEnd::Switch(remote_sw) =
                    fabric.sws[sw].up_groups[i].remote
                else {
                    continue;
                };
                if fabric.sws[remote_sw].tuple.is_assigned() {
                    continue;
                }
                let from = fabric.sws[sw].tuple;
                if let Some(tuple) = fabric.new_tuple(from, false) {
                    fabric.assign_tuple(remote_sw, tuple);
                    bfs.push_back(remote_sw);
                }
            }
            sort_groups_by_remote_tuple(fabric, sw, false);
        }
    }

    let sws = &fabric.sws;
    fabric.leaf_switches.sort_by_key(|&sw| sws[sw].tuple);
}

fn sort_groups_by_remote_tuple(fabric: &mut FtreeFabric, sw: usize, down: bool) {
    let tuples = {
        let groups = if down {
            &fabric.sws[sw].down_groups
        } else {
            &fabric.sws[sw].up_groups
        };
        groups
            .iter()
            .map(|group| match group.remote {
                RemoteEnd::Switch(remote_sw) => fabric.sws[remote_sw].tuple,
                RemoteEnd::Ca(..) => Tuple::unassigned(),
            })
            .collect::<Vec<_>>()
    };
    let groups = if down {
        &mut fabric.sws[sw].down_groups
    } else {
        &mut fabric.sws[sw].up_groups
    };
    for (group, tuple) in groups.iter_mut().zip(tuples) {
        group.remote_tuple = tuple;
    }
    groups.sort_by_key(|group| group.remote_tuple);
}

// All switches of equal rank must agree on port-group counts and group
// widths; leaves may have fewer CAs.
fn validate_topology(fabric: &FtreeFabric) -> Result<(), Error> {
    let mut reference: Vec<Option<usize>> =
        vec![None; fabric.tree_rank as usize];

    for (sw, entry) in fabric.sws.iter().enumerate() {
        let rank = entry.rank;
        let Some(reference_sw) = reference[rank as usize] else {
            reference[rank as usize] = Some(sw);
            continue;
        };
        let reference_sw = &fabric.sws[reference_sw];

        if reference_sw.up_groups.len() != entry.up_groups.len() {
            return Err(Error::RankAsymmetry(rank));
        }
        if rank != fabric.leaf_rank()
            && reference_sw.down_groups.len() != entry.down_groups.len()
        {
            return Err(Error::RankAsymmetry(rank));
        }
        if let Some(ref_group) = reference_sw.up_groups.first()
            && entry
                .up_groups
                .iter()
                .any(|group| group.ports.len() != ref_group.ports.len())
        {
            return Err(Error::RankAsymmetry(rank));
        }
        if rank != fabric.leaf_rank()
            && let Some(ref_group) = reference_sw.down_groups.first()
            && entry
                .down_groups
                .iter()
                .any(|group| group.ports.len() != ref_group.ports.len())
        {
            return Err(Error::RankAsymmetry(rank));
        }
    }

    Ok(())
}

// Routes every CA LID: per leaf switch in tuple order, per attached CA
// in port order, then balances the missing CAs with dummy passes.
fn route_to_cas(fabric: &mut FtreeFabric, subnet: &mut Subnet) {
    for leaf_pos in 0..fabric.leaf_switches.len() {
        let sw = fabric.leaf_switches[leaf_pos];

        for group_pos in 0..fabric.sws[sw].down_groups.len() {
            let (target_lid, port_num) = {
                let group = &fabric.sws[sw].down_groups[group_pos];
                (group.remote_base_lid, group.ports[0].port_num)
            };
            if !target_lid.is_valid() {
                continue;
            }

            // Local route to the attached CA, plus the terminal hop in
            // the hop table.
            let sw_idx = fabric.sws[sw].sw_idx;
            set_lft(subnet, sw_idx, target_lid, port_num);
            set_hops(subnet, sw_idx, target_lid, port_num, 1);

            route_downgoing_by_going_up(
                fabric,
                subnet,
                sw,
                None,
                target_lid,
                fabric.tree_rank,
                true,
                true,
            );
        }

        // Balance the load as if the leaf were fully populated.
        let missing =
            fabric.max_cas_per_leaf - fabric.sws[sw].down_groups.len();
        for _ in 0..missing {
            route_downgoing_by_going_up(
                fabric,
                subnet,
                sw,
                None,
                Lid(0),
                0,
                false,
                true,
            );
        }
    }
}

// Routes every switch LID. Switch destinations behave like secondary
// CA paths: tables are written, counters are not.
fn route_to_switches(fabric: &mut FtreeFabric, subnet: &mut Subnet) {
    for sw in 0..fabric.sws.len() {
        let sw_idx = fabric.sws[sw].sw_idx;
        let target_lid = fabric.sws[sw].base_lid;
        let target_rank = fabric.sws[sw].rank;
        set_lft(subnet, sw_idx, target_lid, 0);
        set_hops(subnet, sw_idx, target_lid, 0, 0);

        route_downgoing_by_going_up(
            fabric,
            subnet,
            sw,
            None,
            target_lid,
            target_rank,
            true,
            false,
        );
    }
}

// Ascends from `sw` toward the roots: pick the up-port with the lowest
// counter_down for the main path, then descend into every subtree that
// does not contain the destination.
fn route_downgoing_by_going_up(
    fabric: &mut FtreeFabric,
    subnet: &mut Subnet,
    sw: usize,
    prev_sw: Option<usize>,
    target_lid: Lid,
    target_rank: u8,
    is_real_lid: bool,
    is_main_path: bool,
) {
    // Descend into sibling subtrees first.
    if fabric.sws[sw].rank != fabric.leaf_rank() {
        let highest = fabric.sws[sw].rank;
        route_upgoing_by_going_down(
            fabric,
            subnet,
            sw,
            prev_sw,
            target_lid,
            target_rank,
            is_real_lid,
            is_main_path,
            highest,
        );
    }

    if fabric.sws[sw].rank == 0 {
        return;
    }

    // Least loaded (counter_down) port over all up groups, scanning in
    // tuple order.
    let mut min_pos: Option<(usize, usize)> = None;
    let mut min_load = u32::MAX;
    for (group_pos, group) in fabric.sws[sw].up_groups.iter().enumerate() {
        for (port_pos, port) in group.ports.iter().enumerate() {
            if port.counter_down < min_load {
                min_load = port.counter_down;
                min_pos = Some((group_pos, port_pos));
            }
        }
    }
    let Some((min_group_pos, min_port_pos)) = min_pos else {
        return;
    };

    if is_main_path {
        let (remote_sw, remote_port_num, remote_ports) = {
            let group = &mut fabric.sws[sw].up_groups[min_group_pos];
            group.ports[min_port_pos].counter_down += 1;
            let RemoteEnd::Switch(remote_sw) = group.remote else {
                return;
            };
            let remote_ports = group
                .ports
                .iter()
                .map(|port| port.remote_port_num)
                .collect::<Vec<_>>();
            (remote_sw, group.ports[min_port_pos].remote_port_num, remote_ports)
        };

        if is_real_lid {
            let remote_sw_idx = fabric.sws[remote_sw].sw_idx;
            set_lft(subnet, remote_sw_idx, target_lid, remote_port_num);
            let hops = target_rank - fabric.sws[remote_sw].rank;
            for port_num in remote_ports {
                set_hops(subnet, remote_sw_idx, target_lid, port_num, hops);
            }
        }

        route_downgoing_by_going_up(
            fabric,
            subnet,
            remote_sw,
            Some(sw),
            target_lid,
            target_rank,
            is_real_lid,
            is_main_path,
        );
    }

    if !is_real_lid {
        return;
    }

    // Secondary paths: configure every not-yet-routed upper switch
    // through the first port of its group, without touching counters.
    for group_pos in 0..fabric.sws[sw].up_groups.len() {
        let (remote_sw, remote_port_num, remote_ports) = {
            let group = &fabric.sws[sw].up_groups[group_pos];
            let RemoteEnd::Switch(remote_sw) = group.remote else {
                continue;
            };
            let remote_ports = group
                .ports
                .iter()
                .map(|port| port.remote_port_num)
                .collect::<Vec<_>>();
            (remote_sw, group.ports[0].remote_port_num, remote_ports)
        };

        let remote_sw_idx = fabric.sws[remote_sw].sw_idx;
        if subnet.switches[remote_sw_idx].new_lft_get(target_lid) != NO_PATH {
            continue;
        }

        set_lft(subnet, remote_sw_idx, target_lid, remote_port_num);
        let hops = target_rank - fabric.sws[remote_sw].rank;
        for port_num in remote_ports {
            set_hops(subnet, remote_sw_idx, target_lid, port_num, hops);
        }

        route_downgoing_by_going_up(
            fabric,
            subnet,
            remote_sw,
            Some(sw),
            target_lid,
            target_rank,
            true,
            false,
        );
    }
}

// Descends from `sw` into every subtree that does not already reach
// the destination, picking the port with the lowest counter_up per
// group.
fn route_upgoing_by_going_down(
    fabric: &mut FtreeFabric,
    subnet: &mut Subnet,
    sw: usize,
    prev_sw: Option<usize>,
    target_lid: Lid,
    target_rank: u8,
    is_real_lid: bool,
    is_main_path: bool,
    highest_rank_in_route: u8,
) {
    let prev_base_lid = prev_sw.map(|prev| fabric.sws[prev].base_lid);

    for group_pos in 0..fabric.sws[sw].down_groups.len() {
        let (remote_sw, remote_base_lid) = {
            let group = &fabric.sws[sw].down_groups[group_pos];
            let RemoteEnd::Switch(remote_sw) = group.remote else {
                continue;
            };
            (remote_sw, group.remote_base_lid)
        };

        // Skip the subtree we just came up from.
        if prev_base_lid == Some(remote_base_lid) {
            continue;
        }

        // A switch already holding hops toward the target was routed on
        // the way up; descending into it again would close a loop.
        let remote_sw_idx = fabric.sws[remote_sw].sw_idx;
        if is_real_lid
            && subnet.switches[remote_sw_idx].least_hops(target_lid) != NO_PATH
        {
            continue;
        }

        // Secondary descent stops at switches that were already
        // configured for this destination.
        if is_real_lid
            && !is_main_path
            && subnet.switches[remote_sw_idx].new_lft_get(target_lid)
                != NO_PATH
        {
            continue;
        }

        // Least loaded (counter_up) port of the group.
        let min_port_pos = {
            let group = &fabric.sws[sw].down_groups[group_pos];
            let mut min_pos = 0;
            for (port_pos, port) in group.ports.iter().enumerate() {
                if port.counter_up
                    < group.ports[min_pos].counter_up
                {
                    min_pos = port_pos;
                }
            }
            min_pos
        };

        if is_real_lid {
            let (remote_port_num, remote_ports) = {
                let group = &fabric.sws[sw].down_groups[group_pos];
                (
                    group.ports[min_port_pos].remote_port_num,
                    group
                        .ports
                        .iter()
                        .map(|port| port.remote_port_num)
                        .collect::<Vec<_>>(),
                )
            };
            set_lft(subnet, remote_sw_idx, target_lid, remote_port_num);
            let hops = (target_rank - highest_rank_in_route)
                + (fabric.sws[remote_sw].rank - highest_rank_in_route);
            for port_num in remote_ports {
                set_hops(subnet, remote_sw_idx, target_lid, port_num, hops);
            }
        }

        if is_main_path {
            fabric.sws[sw].down_groups[group_pos].ports[min_port_pos]
                .counter_up += 1;
        }

        if fabric.sws[remote_sw].rank != fabric.leaf_rank() {
            route_upgoing_by_going_down(
                fabric,
                subnet,
                remote_sw,
                None,
                target_lid,
                target_rank,
                is_real_lid,
                is_main_path,
                highest_rank_in_route,
            );
        }
    }
}

fn set_lft(subnet: &mut Subnet, sw_idx: SwitchIndex, lid: Lid, port_num: u8) {
    if let Err(error) = subnet.switches[sw_idx].set_new_lft(lid, port_num) {
        error.log();
    }
}

fn set_hops(
    subnet: &mut Subnet,
    sw_idx: SwitchIndex,
    lid: Lid,
    port_num: u8,
    hops: u8,
) {
    if let Err(error) = subnet.switches[sw_idx].set_hops(lid, port_num, hops) {
        error.log();
    }
}

// The CA ordering used for routing, one line per leaf slot.
fn dump_ca_order(
    fabric: &FtreeFabric,
    path: &std::path::Path,
) -> Result<(), Error> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);

    for &sw in &fabric.leaf_switches {
        let groups = &fabric.sws[sw].down_groups;
        for group in groups {
            let RemoteEnd::Ca(ca) = group.remote else {
                continue;
            };
            writeln!(
                file,
                "0x{:x}\t{}",
                group.remote_base_lid.0, fabric.cas[ca].description,
            )?;
        }
        for _ in groups.len()..fabric.max_cas_per_leaf {
            writeln!(file, "0xFFFF\tDUMMY")?;
        }
    }

    Ok(())
}
