//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::{Lid, LinkState};
use ibsm_utils::smp::{PortInfoAttr, SmpAttr, SmpMethod, SmpPayload};

use crate::instance::Sm;
use crate::request::RequestContext;
use crate::state_mgr::Signal;

// ===== global functions =====

// Walks every linked physical port and pushes it toward the requested
// state: None aligns port attributes (MTU negotiation) without a state
// change, Some(Armed) transitions INIT links, Some(Active) transitions
// ARMED links.
//
// LFT installation on a switch always completes before this phase runs
// for its ports, preserving the table-before-ARMED ordering guarantee.
pub fn process(sm: &mut Sm, target: Option<LinkState>) -> Signal {
    let mut queued = false;

    let updates = {
        let subnet = sm.subnet.read().unwrap();

        let mut updates = Vec::new();
        for node_idx in subnet.node_indexes() {
            let node = &subnet.nodes[node_idx];
            for physp in node.data_ports() {
                let Some((remote_idx, remote_port)) =
                    subnet.remote_of(node_idx, physp.port_num)
                else {
                    continue;
                };

                let (new_state, new_mtu) = match target {
                    // Attribute alignment: both ends of a link must
                    // agree on the neighbor MTU.
                    None => {
                        let remote_mtu = subnet.nodes[remote_idx]
                            .physp(remote_port)
                            .map(|remote| remote.mtu)
                            .unwrap_or_default();
                        let common = physp.mtu.min(remote_mtu);
                        if physp.mtu == common {
                            continue;
                        }
                        (physp.link_state, common)
                    }
                    Some(LinkState::Armed) => {
                        if physp.link_state != LinkState::Init {
                            continue;
                        }
                        (LinkState::Armed, physp.mtu)
                    }
                    Some(LinkState::Active) => {
                        if physp.link_state != LinkState::Armed {
                            continue;
                        }
                        (LinkState::Active, physp.mtu)
                    }
                    Some(..) => continue,
                };

                // Switch ports are addressed through the management
                // port's path; CA ports carry their own.
                let dr_path = if node.is_switch() {
                    match node.physp(0) {
                        Some(physp0) => physp0.dr_path.clone(),
                        None => continue,
                    }
                } else {
                    physp.dr_path.clone()
                };
                updates.push((
                    node.guid,
                    physp.port_num,
                    physp.port_guid,
                    dr_path,
                    new_state,
                    new_mtu,
                    physp.link_width,
                    physp.link_speed,
                ));
            }
        }
        updates
    };

    for (node_guid, port_num, port_guid, dr_path, state, mtu, width, speed) in
        updates
    {
        let payload = SmpPayload::PortInfo(PortInfoAttr::new(
            port_guid,
            Lid(0),
            0,
            state,
            mtu,
            width,
            speed,
            Lid(0),
        ));
        match sm.requester.request(
            dr_path,
            SmpMethod::Set,
            SmpAttr::PortInfo,
            port_num as u32,
            payload,
            RequestContext::LinkState {
                node_guid,
                port_num,
                state,
            },
        ) {
            Ok(()) => queued = true,
            Err(error) => error.log(),
        }
    }

    if queued { Signal::DonePending } else { Signal::Done }
}
