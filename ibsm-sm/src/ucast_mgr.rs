//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bytes::Bytes;
use ibsm_utils::smp::{SmpAttr, SmpMethod, SmpPayload, SwitchInfoAttr};
use tracing::info;

use crate::debug::Debug;
use crate::instance::Sm;
use crate::request::RequestContext;
use crate::state_mgr::Signal;

// Outcome of the unicast table phase.
#[derive(Debug)]
pub enum Outcome {
    Signal(Signal),
    // The fabric is inconsistent under default routing; the sweep must
    // restart from discovery.
    Abort,
}

// ===== global functions =====

// Runs the routing engine over the subnet and installs the resulting
// forwarding tables: per switch, a SwitchInfo update when the table top
// changed, then one SubnSet(LinearForwardingTable) per 64-entry block
// that differs from the installed table.
pub fn process(sm: &mut Sm) -> Outcome {
    let mut config = sm.config.clone();
    config.ignore_existing_lfts = sm.state.ignore_existing_lfts;

    let summary = {
        let mut subnet = sm.subnet.write().unwrap();
        if subnet.num_switches() == 0 {
            return Outcome::Signal(Signal::Done);
        }
        ibsm_routing::route_subnet(&mut subnet, &config, sm.engine.as_mut())
    };

    info!(engine = %summary.engine, fallback = %summary.used_fallback,
        "unicast tables computed on all switches");

    if summary.unreachable > 0 {
        // Some LID became unreachable mid-sweep (e.g. a link died after
        // discovery); rediscover rather than installing stale routes.
        sm.state.subnet_initialization_error = true;
        sm.state.errors_this_sweep += summary.unreachable;
        return Outcome::Abort;
    }

    let any_change = set_fwd_tables(sm);

    // The installed tables were honored once; subsequent passes balance
    // from scratch.
    sm.state.ignore_existing_lfts = false;

    if any_change {
        Outcome::Signal(Signal::DonePending)
    } else {
        Outcome::Signal(Signal::Done)
    }
}

// ===== helper functions =====

fn set_fwd_tables(sm: &mut Sm) -> bool {
    let mut any_change = false;

    let requests = {
        let mut subnet = sm.subnet.write().unwrap();
        let max_lid = subnet.max_lid;
        let sw_idxs = subnet.switch_indexes().collect::<Vec<_>>();

        let mut requests = Vec::new();
        for sw_idx in sw_idxs {
            let node_idx = subnet.switches[sw_idx].node_idx;
            let dr_path = subnet.nodes[node_idx]
                .physp(0)
                .map(|physp| physp.dr_path.clone());
            let Some(dr_path) = dr_path else {
                continue;
            };
            let guid = subnet.switches[sw_idx].guid;

            // Raise the top of the linear forwarding table first.
            let si = subnet.switches[sw_idx].switch_info;
            if si.lin_top != max_lid.0 {
                let new_si = SwitchInfoAttr {
                    lin_top: max_lid.0,
                    state_change: false,
                    ..si
                };
                subnet.switches[sw_idx].switch_info = new_si;
                requests.push((
                    dr_path.clone(),
                    SmpAttr::SwitchInfo,
                    0u32,
                    SmpPayload::SwitchInfo(new_si),
                    RequestContext::SwitchInfoTop { node_guid: guid },
                ));
            }

            for block_id in 0..subnet.switches[sw_idx].num_blocks() {
                let differs = {
                    let sw = &subnet.switches[sw_idx];
                    sw.new_lft_block(block_id) != sw.lft_block(block_id)
                };
                if !differs {
                    continue;
                }
                let block = subnet.switches[sw_idx]
                    .new_lft_block(block_id)
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default();
                // Mirror optimistically so this sweep's dumps and diffs
                // see the outgoing table.
                subnet.switches[sw_idx].set_lft_block(block_id, &block);
                Debug::LftBlockSent(guid, block_id as u32).log();
                requests.push((
                    dr_path.clone(),
                    SmpAttr::LinFwdTbl,
                    block_id as u32,
                    SmpPayload::LftBlock(block),
                    RequestContext::LftBlock {
                        node_guid: guid,
                        block_id: block_id as u32,
                    },
                ));
            }
        }
        requests
    };

    for (dr_path, attr, attr_mod, payload, context) in requests {
        match sm.requester.request(
            dr_path,
            SmpMethod::Set,
            attr,
            attr_mod,
            payload,
            context,
        ) {
            Ok(()) => any_change = true,
            Err(error) => error.log(),
        }
    }

    any_change
}
