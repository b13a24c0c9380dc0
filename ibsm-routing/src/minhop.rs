//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_subnet::switch::PathSpread;
use ibsm_subnet::{Subnet, SwitchIndex};
use ibsm_utils::config::SmConfig;
use ibsm_utils::ib::{Lid, NO_PATH};
use tracing::warn;

use crate::RoutingEngine;
use crate::debug::Debug;
use crate::error::Error;

// Baseline engine: min-hop matrices plus least-loaded port selection.
// Also serves as the fallback whenever a topology-aware engine fails.
#[derive(Debug, Default)]
pub struct MinHopEngine;

// ===== impl MinHopEngine =====

impl RoutingEngine for MinHopEngine {
    fn name(&self) -> &'static str {
        "minhop"
    }

    fn build_hop_matrices(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error> {
        build_hop_matrices(subnet, config);
        Ok(())
    }

    fn build_ucast_tables(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error> {
        build_ucast_tables(subnet, config);
        Ok(())
    }
}

// ===== global functions =====

// Builds every switch's hop-count matrix by iterative relaxation.
//
// Hop 0/1: each switch knows its own LID at distance 0 and its switch
// neighbors at distance 1. Then, for at most |switches| - 1 passes,
// every switch absorbs the least-hop rows of its healthy neighbors;
// the loop stops early once a pass makes no change.
pub fn build_hop_matrices(subnet: &mut Subnet, config: &SmConfig) -> usize {
    let sw_idxs = subnet.switch_indexes().collect::<Vec<_>>();

    // Seed hop counts for each switch's own LID and its direct switch
    // neighbors.
    for &sw_idx in &sw_idxs {
        let Some(own_lid) = subnet.switch_base_lid(sw_idx) else {
            continue;
        };
        let node_idx = subnet.switches[sw_idx].node_idx;
        let num_ports = subnet.switches[sw_idx].num_ports;
        if let Err(error) = subnet.switches[sw_idx].set_hops(own_lid, 0, 0) {
            error.log();
            continue;
        }

        for port_num in 1..=num_ports {
            let Some((remote_idx, remote_port)) =
                subnet.remote_of(node_idx, port_num)
            else {
                continue;
            };
            if remote_idx == node_idx {
                continue;
            }
            let Some(remote_sw_idx) = subnet.nodes[remote_idx].switch_idx
            else {
                continue;
            };
            let Some(remote_lid) = subnet.node_base_lid(remote_idx) else {
                continue;
            };
            if let Err(error) =
                subnet.switches[sw_idx].set_hops(remote_lid, port_num, 1)
            {
                error.log();
            }
            if let Err(error) = subnet.switches[remote_sw_idx].set_hops(
                own_lid,
                remote_port,
                1,
            ) {
                error.log();
            }
        }
    }

    // Destination rows and the inter-switch adjacency, fixed for the
    // whole relaxation.
    let dest_lids = sw_idxs
        .iter()
        .filter_map(|&sw_idx| subnet.switch_base_lid(sw_idx))
        .collect::<Vec<_>>();
    let adjacency = inter_switch_links(subnet, &sw_idxs, config);

    let mut passes = 0;
    let iteration_max = subnet.num_switches().saturating_sub(1);
    let mut some_hop_count_set = true;
    while some_hop_count_set && passes < iteration_max {
        some_hop_count_set = false;
        passes += 1;

        for &(sw_idx, port_num, remote_sw_idx) in &adjacency {
            let remote_least = dest_lids
                .iter()
                .map(|&lid| subnet.switches[remote_sw_idx].least_hops(lid))
                .collect::<Vec<_>>();

            let sw = &mut subnet.switches[sw_idx];
            for (&lid, &least) in dest_lids.iter().zip(remote_least.iter()) {
                if least == NO_PATH {
                    continue;
                }
                let hops = least + 1;
                if hops < sw.hop_count(lid, port_num) {
                    if let Err(error) = sw.set_hops(lid, port_num, hops) {
                        error.log();
                        continue;
                    }
                    some_hop_count_set = true;
                }
            }
        }
    }

    Debug::HopMatricesDone(passes).log();
    passes
}

// Fills every switch's new-LFT buffer from the hop matrices, spreading
// load with the port profiles.
pub fn build_ucast_tables(subnet: &mut Subnet, config: &SmConfig) {
    let sw_idxs = subnet.switch_indexes().collect::<Vec<_>>();
    let port_idxs = subnet.port_indexes().collect::<Vec<_>>();

    for &sw_idx in &sw_idxs {
        for &port_idx in &port_idxs {
            let port = &subnet.ports[port_idx];
            let node_idx = port.node_idx;
            let Some((min_lid, max_lid)) = port.lid_range() else {
                warn!(port_guid = %port.port_guid,
                    "port has no LID, skipping route setup");
                continue;
            };
            let dest_is_switch = subnet.nodes[node_idx].is_switch();
            let counted =
                !dest_is_switch || config.port_profile_switch_nodes;

            // The spreading state covers one destination port's whole
            // LID range.
            let mut spread =
                (max_lid > min_lid).then(PathSpread::default);

            for lid in min_lid.0..=max_lid.0 {
                let lid = Lid(lid);
                let egress = subnet.recommend_path(
                    sw_idx,
                    lid,
                    config.ignore_existing_lfts,
                    spread.as_mut(),
                );
                if egress == NO_PATH {
                    Debug::UnreachableLid(subnet.switches[sw_idx].guid, lid)
                        .log();
                    continue;
                }
                let sw = &mut subnet.switches[sw_idx];
                if let Err(error) = sw.set_new_lft(lid, egress) {
                    error.log();
                    continue;
                }
                if counted {
                    sw.count_path(egress);
                }
            }
        }
    }
}

// ===== helper functions =====

// Healthy switch-to-switch links as (switch, egress port, remote
// switch) triples, in deterministic switch/port order.
fn inter_switch_links(
    subnet: &Subnet,
    sw_idxs: &[SwitchIndex],
    config: &SmConfig,
) -> Vec<(SwitchIndex, u8, SwitchIndex)> {
    let mut links = Vec::new();
    for &sw_idx in sw_idxs {
        let node_idx = subnet.switches[sw_idx].node_idx;
        let num_ports = subnet.switches[sw_idx].num_ports;
        for port_num in 1..=num_ports {
            let Some((remote_idx, _)) = subnet.remote_of(node_idx, port_num)
            else {
                continue;
            };
            if remote_idx == node_idx {
                continue;
            }
            let Some(remote_sw_idx) = subnet.nodes[remote_idx].switch_idx
            else {
                continue;
            };
            if !subnet.link_is_healthy(
                node_idx,
                port_num,
                config.avoid_throttled_links,
            ) {
                continue;
            }
            links.push((sw_idx, port_num, remote_sw_idx));
        }
    }
    links
}
