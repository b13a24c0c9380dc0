//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::LinkState;
use ibsm_utils::smp::SmpPayload;

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Sm;
use crate::request::RequestContext;
use crate::state_mgr::{self, Signal};
use crate::tasks::messages::ProtocolInputMsg;
use crate::tasks::messages::input;
use crate::{discovery, lid_mgr};

// ===== global functions =====

pub fn process_msg(sm: &mut Sm, msg: ProtocolInputMsg) {
    match msg {
        ProtocolInputMsg::Sweep(msg) => {
            if msg.force_heavy {
                sm.state.force_heavy_sweep = true;
            }
            state_mgr::process_signal(sm, Signal::Sweep);
        }
        ProtocolInputMsg::SmpResponse(msg) => {
            process_response(sm, msg);
        }
        ProtocolInputMsg::SmpTimeout(msg) => {
            process_timeout(sm, msg);
        }
        ProtocolInputMsg::SmDiscovered(msg) => {
            let signal = discovery::on_sm_discovered(sm, msg.sm_info);
            if signal != Signal::None {
                state_mgr::process_signal(sm, signal);
            }
        }
        ProtocolInputMsg::ExitStandby(_) => {
            state_mgr::process_signal(sm, Signal::ExitStby);
        }
        ProtocolInputMsg::IdleWork(msg) => {
            sm.enqueue_idle_work(msg.item);
        }
    }
}

// ===== helper functions =====

// Dispatches one SMP response to the subsystem that issued it, then
// reports transaction drain to the FSM.
fn process_response(sm: &mut Sm, msg: input::SmpResponseMsg) {
    let Some(context) = sm.requester.complete(msg.tid) else {
        // Drained or duplicate; late responses are discarded.
        Error::UnknownTransaction(msg.tid).log();
        return;
    };

    let signal = match (context, msg.payload) {
        (
            RequestContext::NodeInfo { dr_path, parent },
            SmpPayload::NodeInfo(attr),
        ) => discovery::on_node_info(sm, dr_path, parent, attr),
        (
            RequestContext::PortInfo {
                dr_path,
                node_guid,
                port_num,
                light,
            },
            SmpPayload::PortInfo(attr),
        ) => discovery::on_port_info(sm, dr_path, node_guid, port_num, light, attr),
        (
            RequestContext::SwitchInfo { node_guid, light },
            SmpPayload::SwitchInfo(attr),
        ) => discovery::on_switch_info(sm, node_guid, light, attr),
        (RequestContext::LidSet { port_guid }, _) => {
            lid_mgr::on_lid_set_confirmed(sm, port_guid);
            Signal::None
        }
        (RequestContext::LinkState { node_guid, port_num, state }, _) => {
            on_link_state_confirmed(sm, node_guid, port_num, state);
            Signal::None
        }
        (
            RequestContext::SwitchInfoTop { .. }
            | RequestContext::LftBlock { .. }
            | RequestContext::PKeyBlock { .. }
            | RequestContext::Handover,
            _,
        ) => Signal::None,
        // Payload/context mismatch: treat like a transport error.
        (context, _) => {
            tracing::warn!(?context, "mismatched response payload");
            sm.state.errors_this_sweep += 1;
            Signal::None
        }
    };

    if signal != Signal::None {
        state_mgr::process_signal(sm, signal);
    }
    signal_drain(sm);
}

// A transaction timed out: count it against the sweep's error budget
// and force a retry sweep once the budget is gone.
fn process_timeout(sm: &mut Sm, msg: input::SmpTimeoutMsg) {
    let Some(context) = sm.requester.complete(msg.tid) else {
        return;
    };

    sm.state.errors_this_sweep += 1;
    sm.state.subnet_initialization_error = true;
    if sm.state.errors_this_sweep >= sm.config.per_sweep_error_budget {
        sm.state.force_heavy_sweep = true;
    }

    let signal = match context {
        RequestContext::SwitchInfo { light: true, .. }
        | RequestContext::PortInfo { light: true, .. } => Signal::LightSweepFail,
        _ => Signal::None,
    };
    if signal != Signal::None {
        state_mgr::process_signal(sm, signal);
    }
    signal_drain(sm);
}

fn signal_drain(sm: &mut Sm) {
    if sm.requester.outstanding() == 0 {
        state_mgr::process_signal(sm, Signal::NoPendingTransactions);
    }
}

// The port acknowledged the state transition; mirror it in the model.
fn on_link_state_confirmed(
    sm: &mut Sm,
    node_guid: ibsm_utils::ib::Guid,
    port_num: u8,
    state: LinkState,
) {
    let mut subnet = sm.subnet.write().unwrap();
    let Some((node_idx, _)) = subnet.node_by_guid(node_guid) else {
        return;
    };
    let remote = subnet.remote_of(node_idx, port_num);
    if let Some(physp) = subnet.nodes[node_idx].physp_mut(port_num) {
        physp.link_state = state;
        Debug::PortStateChange(node_guid, port_num, state).log();
    }
    // The peer transitions with us.
    if let Some((remote_idx, remote_port)) = remote
        && let Some(remote_physp) =
            subnet.nodes[remote_idx].physp_mut(remote_port)
    {
        remote_physp.link_state = state;
    }
}
