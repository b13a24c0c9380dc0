//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::{DrPath, Guid, Lid, LinkState, NodeType};
use ibsm_utils::smp::{
    NodeInfoAttr, PortInfoAttr, SmpAttr, SmpMethod, SmpPayload, SwitchInfoAttr,
};
use tracing::warn;

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Sm;
use crate::request::RequestContext;
use crate::state_mgr::Signal;

// ===== sweep entry points =====

// Light sweep: SwitchInfo Get to every known switch, plus one
// diagnostic PortInfo Get per port whose remote end is unknown. Any
// change in the responses forces a heavy sweep.
pub fn sweep_light_start(sm: &mut Sm) -> Signal {
    Debug::SweepLightStart.log();
    let mut queued = false;

    let probes = {
        let subnet = sm.subnet.read().unwrap();

        let mut probes = Vec::new();
        for sw_idx in subnet.switch_indexes() {
            let sw = &subnet.switches[sw_idx];
            let node = &subnet.nodes[sw.node_idx];
            let Some(dr_path) =
                node.physp(0).map(|physp| physp.dr_path.clone())
            else {
                continue;
            };

            probes.push((
                dr_path.clone(),
                SmpAttr::SwitchInfo,
                0,
                RequestContext::SwitchInfo {
                    node_guid: node.guid,
                    light: true,
                },
            ));

            // Unknown remote: probe once more, diagnostically.
            for physp in node.data_ports() {
                if physp.remote.is_none()
                    && physp.link_state >= LinkState::Init
                {
                    probes.push((
                        dr_path.clone(),
                        SmpAttr::PortInfo,
                        physp.port_num as u32,
                        RequestContext::PortInfo {
                            dr_path: dr_path.clone(),
                            node_guid: node.guid,
                            port_num: physp.port_num,
                            light: true,
                        },
                    ));
                }
            }
        }
        probes
    };

    for (dr_path, attr, attr_mod, context) in probes {
        if let Err(error) = sm.requester.request(
            dr_path,
            SmpMethod::Get,
            attr,
            attr_mod,
            SmpPayload::None,
            context,
        ) {
            error.log();
            continue;
        }
        queued = true;
    }

    if queued { Signal::DonePending } else { Signal::Done }
}

// Heavy sweep, stage one: reset the discovery bookkeeping and probe the
// SM's own node at hop zero.
pub fn sweep_heavy_self(sm: &mut Sm) -> Signal {
    {
        let mut subnet = sm.subnet.write().unwrap();
        subnet.reset_discovery_counts();
    }
    sm.state.in_sweep_hop_0 = true;

    match sm.requester.request(
        DrPath::local(),
        SmpMethod::Get,
        SmpAttr::NodeInfo,
        0,
        SmpPayload::None,
        RequestContext::NodeInfo {
            dr_path: DrPath::local(),
            parent: None,
        },
    ) {
        Ok(()) => Signal::DonePending,
        Err(error) => {
            error.log();
            Signal::Done
        }
    }
}

// Heavy sweep, stage two: probe the SM node's neighbors at hop one;
// the response handlers then traverse the rest of the fabric via
// extended DR paths.
pub fn sweep_heavy_subnet(sm: &mut Sm) {
    sm.state.in_sweep_hop_0 = false;

    let ports = {
        let subnet = sm.subnet.read().unwrap();
        let Some((_, node)) = subnet.node_by_guid(sm.state.node_guid) else {
            return;
        };
        node.data_ports()
            .filter(|physp| physp.link_state >= LinkState::Init)
            .map(|physp| physp.port_num)
            .collect::<Vec<_>>()
    };

    for port_num in ports {
        let Some(next_path) = DrPath::local().extended(port_num) else {
            continue;
        };
        if let Err(error) = sm.requester.request(
            next_path.clone(),
            SmpMethod::Get,
            SmpAttr::NodeInfo,
            0,
            SmpPayload::None,
            RequestContext::NodeInfo {
                dr_path: next_path,
                parent: Some((sm.state.node_guid, port_num)),
            },
        ) {
            error.log();
        }
    }
}

// Whether the SM's bound port is down, invalidating all remote state.
pub fn local_port_down(sm: &Sm) -> bool {
    let subnet = sm.subnet.read().unwrap();
    let Some((_, node)) = subnet.node_by_guid(sm.state.node_guid) else {
        // Not even the local node answered.
        return true;
    };
    if node.is_switch() {
        return false;
    }
    !node
        .data_ports()
        .any(|physp| physp.link_state >= LinkState::Init)
}

// ===== response handlers =====

// NodeInfo response: create or refresh the node, wire the link to the
// parent, and fan out SwitchInfo/PortInfo probes on first contact.
pub fn on_node_info(
    sm: &mut Sm,
    dr_path: DrPath,
    parent: Option<(Guid, u8)>,
    attr: NodeInfoAttr,
) -> Signal {
    let mut signal = Signal::None;
    let first_contact;
    {
        let mut subnet = sm.subnet.write().unwrap();

        let node_idx = match subnet.node_by_guid(attr.node_guid) {
            Some((node_idx, _)) => node_idx,
            None => {
                Debug::NodeDiscovered(attr.node_guid).log();
                signal = Signal::ChangeDetected;
                subnet.insert_node(
                    attr.node_guid,
                    attr.node_type,
                    attr.num_ports,
                )
            }
        };

        let node = &mut subnet.nodes[node_idx];
        node.sys_guid = attr.sys_guid;
        node.discovery_count += 1;
        first_contact = node.discovery_count == 1;
        if let Some(physp) = node.physp_mut(attr.local_port_num) {
            physp.port_guid = attr.port_guid;
            physp.dr_path = dr_path.clone();
        }
        if attr.node_type == NodeType::Switch
            && let Some(physp) = node.physp_mut(0)
        {
            physp.dr_path = dr_path.clone();
        }

        // Wire both ends of the link the SMP came through.
        if let Some((parent_guid, parent_port)) = parent
            && let Some((parent_idx, _)) = subnet.node_by_guid(parent_guid)
        {
            let already_linked =
                subnet.remote_of(parent_idx, parent_port)
                    == Some((node_idx, attr.local_port_num));
            if !already_linked {
                signal = Signal::ChangeDetected;
                if let Err(error) = subnet.link(
                    parent_idx,
                    parent_port,
                    node_idx,
                    attr.local_port_num,
                ) {
                    error.log();
                }
            }
        }
    }

    if first_contact {
        fan_out_node_probes(sm, &dr_path, &attr);
    }

    signal
}

fn fan_out_node_probes(sm: &mut Sm, dr_path: &DrPath, attr: &NodeInfoAttr) {
    match attr.node_type {
        NodeType::Switch => {
            if let Err(error) = sm.requester.request(
                dr_path.clone(),
                SmpMethod::Get,
                SmpAttr::SwitchInfo,
                0,
                SmpPayload::None,
                RequestContext::SwitchInfo {
                    node_guid: attr.node_guid,
                    light: false,
                },
            ) {
                error.log();
            }
            for port_num in 0..=attr.num_ports {
                request_port_info(sm, dr_path, attr.node_guid, port_num);
            }
        }
        NodeType::Ca | NodeType::Router => {
            request_port_info(sm, dr_path, attr.node_guid, attr.local_port_num);
        }
    }
}

fn request_port_info(
    sm: &mut Sm,
    dr_path: &DrPath,
    node_guid: Guid,
    port_num: u8,
) {
    if let Err(error) = sm.requester.request(
        dr_path.clone(),
        SmpMethod::Get,
        SmpAttr::PortInfo,
        port_num as u32,
        SmpPayload::None,
        RequestContext::PortInfo {
            dr_path: dr_path.clone(),
            node_guid,
            port_num,
            light: false,
        },
    ) {
        error.log();
    }
}

// PortInfo response: refresh the physical port, maintain the endport
// and its LID claim, and extend the DR traversal through switch ports
// with unknown neighbors.
pub fn on_port_info(
    sm: &mut Sm,
    dr_path: DrPath,
    node_guid: Guid,
    port_num: u8,
    light: bool,
    attr: PortInfoAttr,
) -> Signal {
    let mut signal = Signal::None;
    let mut recurse = false;
    {
        let mut subnet = sm.subnet.write().unwrap();
        let Some((node_idx, node)) = subnet.node_by_guid(node_guid) else {
            Error::NodeGuidNotFound(node_guid).log();
            return Signal::None;
        };
        let is_switch = node.is_switch();
        let is_endport = !is_switch || port_num == 0;
        let had_remote =
            node.physp(port_num).and_then(|physp| physp.remote).is_some();

        let node = &mut subnet.nodes[node_idx];
        if let Some(physp) = node.physp_mut(port_num) {
            if light && physp.link_state != attr.link_state {
                signal = Signal::ChangeDetected;
            }
            Debug::PortStateChange(node_guid, port_num, attr.link_state).log();
            physp.port_guid = attr.port_guid;
            physp.link_state = attr.link_state;
            physp.link_width = attr.link_width_active;
            physp.link_speed = attr.link_speed_active;
            physp.mtu = attr.neighbor_mtu;
            physp.discovery_count += 1;
        }

        if is_endport && attr.port_guid.is_valid() {
            let port_idx = match subnet.port_by_guid(attr.port_guid) {
                Some((port_idx, _)) => port_idx,
                None => {
                    if light {
                        signal = Signal::ChangeDetected;
                    }
                    subnet.insert_port(attr.port_guid, node_idx, port_num)
                }
            };
            subnet.ports[port_idx].discovery_count += 1;

            // Register the claimed LID range; conflicting claims leave
            // the table untouched and schedule a reassignment.
            if attr.base_lid.is_valid() {
                if light && subnet.ports[port_idx].base_lid != attr.base_lid {
                    signal = Signal::ChangeDetected;
                }
                match subnet.assign_lid(port_idx, attr.base_lid, attr.lmc) {
                    Ok(()) => (),
                    Err(error) => {
                        error.log();
                        subnet.ports[port_idx].base_lid = Lid(0);
                    }
                }
            }
        }

        // Continue the DR traversal into unknown territory.
        if !light
            && !sm.state.in_sweep_hop_0
            && is_switch
            && port_num != 0
            && attr.link_state >= LinkState::Init
            && !had_remote
        {
            recurse = true;
        }
    }

    if recurse {
        match dr_path.extended(port_num) {
            Some(next_path) => {
                if let Err(error) = sm.requester.request(
                    next_path.clone(),
                    SmpMethod::Get,
                    SmpAttr::NodeInfo,
                    0,
                    SmpPayload::None,
                    RequestContext::NodeInfo {
                        dr_path: next_path,
                        parent: Some((node_guid, port_num)),
                    },
                ) {
                    error.log();
                }
            }
            None => {
                Error::DrPathTooLong(node_guid, port_num).log();
            }
        }
    }

    signal
}

// SwitchInfo response: refresh the stored attributes. During a light
// sweep a set PortStateChange bit means the fabric changed under us.
pub fn on_switch_info(
    sm: &mut Sm,
    node_guid: Guid,
    light: bool,
    attr: SwitchInfoAttr,
) -> Signal {
    let mut subnet = sm.subnet.write().unwrap();
    let Some((sw_idx, _)) = subnet.switch_by_guid(node_guid) else {
        Error::NodeGuidNotFound(node_guid).log();
        return Signal::None;
    };
    let sw = &mut subnet.switches[sw_idx];
    let state_change = attr.state_change;
    sw.switch_info = SwitchInfoAttr {
        state_change: false,
        ..attr
    };

    if light && state_change {
        Debug::ChangeDetected(node_guid).log();
        return Signal::ChangeDetected;
    }
    Signal::None
}

// A remote SM appeared. Precedence is (priority, GUID); detecting a
// higher SM during the sweep yields mastership.
pub fn on_sm_discovered(
    sm: &mut Sm,
    sm_info: ibsm_utils::smp::SmInfoAttr,
) -> Signal {
    if sm_info.guid == sm.state.port_guid {
        return Signal::None;
    }

    let keep = match sm.state.remote_sm {
        Some(best) => sm_info.is_higher_than(&best),
        None => true,
    };
    if keep {
        sm.state.remote_sm = Some(sm_info);
    }

    let local_info = ibsm_utils::smp::SmInfoAttr::new(
        sm.state.port_guid,
        sm.state.act_count,
        sm.state.priority,
        sm.state.sm_state,
    );
    if sm_info.is_higher_than(&local_info) {
        warn!(remote = %sm_info.guid, "higher SM detected");
        Signal::MasterOrHigherSmDetected
    } else {
        Signal::None
    }
}
