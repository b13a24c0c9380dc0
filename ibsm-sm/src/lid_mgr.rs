//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_subnet::{PortIndex, Subnet};
use ibsm_utils::ib::{Guid, LID_UCAST_END, Lid, lids_per_port};
use ibsm_utils::smp::{PortInfoAttr, SmpAttr, SmpMethod, SmpPayload};

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Sm;
use crate::request::RequestContext;
use crate::state_mgr::Signal;

// ===== global functions =====

// Assigns (and programs) the SM port's own LID first, so the SM is
// addressable before the rest of the subnet comes up.
pub fn set_sm_lid(sm: &mut Sm) -> Signal {
    let port_guid = sm.state.port_guid;
    program_ports(sm, |subnet, port_idx| {
        subnet.ports[port_idx].port_guid == port_guid
    })
}

// Walks every endport in GUID order and assigns LID ranges to the ones
// that lack a valid, conflict-free claim. Ports holding a valid range
// keep it, making assignment stable across sweeps.
pub fn set_subnet_lids(sm: &mut Sm) -> Signal {
    let port_guid = sm.state.port_guid;
    program_ports(sm, |subnet, port_idx| {
        subnet.ports[port_idx].port_guid != port_guid
    })
}

// The port acknowledged its new LID range; the table entry was written
// optimistically at assignment time.
pub fn on_lid_set_confirmed(sm: &mut Sm, port_guid: Guid) {
    let subnet = sm.subnet.read().unwrap();
    if let Some((_, port)) = subnet.port_by_guid(port_guid) {
        Debug::LidAssigned(port_guid, port.base_lid).log();
    }
}

// ===== helper functions =====

fn program_ports(
    sm: &mut Sm,
    filter: impl Fn(&Subnet, PortIndex) -> bool,
) -> Signal {
    let lmc = sm.config.lmc;
    let mut queued = false;

    let updates = {
        let mut subnet = sm.subnet.write().unwrap();
        let port_idxs = subnet.port_indexes().collect::<Vec<_>>();

        let mut updates = Vec::new();
        for port_idx in port_idxs {
            if !filter(&subnet, port_idx) {
                continue;
            }
            let port = &subnet.ports[port_idx];
            let node_idx = port.node_idx;
            let port_num = port.port_num;
            let is_switch = subnet.nodes[node_idx].is_switch();
            // Switch management ports always own a single LID.
            let port_lmc = if is_switch { 0 } else { lmc };

            let current = port.base_lid;
            let keep = current.is_valid()
                && port.lmc == port_lmc
                && subnet.port_by_lid(current) == Some(port_idx);
            if keep {
                continue;
            }

            let Some(base_lid) = find_free_range(&subnet, port_lmc) else {
                Error::LidSpaceExhausted.log();
                sm.state.subnet_initialization_error = true;
                continue;
            };
            match subnet.assign_lid(port_idx, base_lid, port_lmc) {
                Ok(()) => {
                    let port = &subnet.ports[port_idx];
                    Debug::LidAssigned(port.port_guid, base_lid).log();
                    let dr_path = subnet.nodes[node_idx]
                        .physp(port_num)
                        .map(|physp| physp.dr_path.clone());
                    updates.push((
                        port.port_guid,
                        port_num,
                        base_lid,
                        port_lmc,
                        dr_path,
                    ));
                }
                Err(error) => {
                    error.log();
                    sm.state.subnet_initialization_error = true;
                }
            }
        }
        updates
    };

    for (port_guid, port_num, base_lid, port_lmc, dr_path) in updates {
        let Some(dr_path) = dr_path else {
            continue;
        };
        let payload = SmpPayload::PortInfo(PortInfoAttr::new(
            port_guid,
            base_lid,
            port_lmc,
            Default::default(),
            Default::default(),
            Default::default(),
            Default::default(),
            Lid(0),
        ));
        match sm.requester.request(
            dr_path,
            SmpMethod::Set,
            SmpAttr::PortInfo,
            port_num as u32,
            payload,
            RequestContext::LidSet { port_guid },
        ) {
            Ok(()) => queued = true,
            Err(error) => error.log(),
        }
    }

    if queued { Signal::DonePending } else { Signal::Done }
}

// First LID range of 2^lmc free consecutive entries, aligned to the
// range size.
fn find_free_range(subnet: &Subnet, lmc: u8) -> Option<Lid> {
    let step = lids_per_port(lmc);
    let mut base = 1u16;
    // Align the base to the range size (LID 0 stays reserved).
    if lmc > 0 {
        base = step;
    }

    while (base as u32) + (step as u32) - 1 <= LID_UCAST_END as u32 {
        let range_free = (base..base + step)
            .all(|lid| subnet.port_by_lid(Lid(lid)).is_none());
        if range_free {
            return Some(Lid(base));
        }
        base = base.checked_add(step)?;
    }
    None
}
