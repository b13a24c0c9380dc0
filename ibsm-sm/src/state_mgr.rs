//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The sweep state machine.
//!
//! Drives the SM through discovery, LID assignment, routing, table
//! installation and link bring-up. Each configuration phase is a
//! `X -> X_WAIT -> X_DONE` triple: the phase handler reports `Done`
//! (nothing queued) or `DonePending` (SMPs in flight); `DonePending`
//! parks the FSM in the wait state until the outstanding-transaction
//! counter drains, and the done state chains into the next phase.

use ibsm_utils::ib::{LinkState, SmState};
use ibsm_utils::smp::{SmInfoAttr, SmInfoAttrMod, SmpAttr, SmpMethod, SmpPayload};
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::error::Error;
use crate::instance::Sm;
use crate::request::RequestContext;
use crate::tasks::messages::output;
use crate::{discovery, lid_mgr, link_mgr, ucast_mgr};

// Sweep FSM states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    Idle,
    ProcessRequest,
    ProcessRequestWait,
    ProcessRequestDone,
    SweepLight,
    SweepLightWait,
    SweepHeavySelf,
    SweepHeavySubnet,
    SetPkey,
    SetPkeyWait,
    SetPkeyDone,
    SetSmUcastLid,
    SetSmUcastLidWait,
    SetSmUcastLidDone,
    SetSubnetUcastLids,
    SetSubnetUcastLidsWait,
    SetSubnetUcastLidsDone,
    SetUcastTables,
    SetUcastTablesWait,
    SetUcastTablesDone,
    SetMcastTables,
    SetMcastTablesWait,
    SetMcastTablesDone,
    SetLinkPorts,
    SetLinkPortsWait,
    SetLinkPortsDone,
    SetArmed,
    SetArmedWait,
    SetArmedDone,
    SetActive,
    SetActiveWait,
    SubnetUp,
    MasterOrHigherSmDetected,
    Standby,
}

// Signals consumed (and produced) by the FSM.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Signal {
    None,
    Sweep,
    ChangeDetected,
    NoPendingTransactions,
    Done,
    DonePending,
    LightSweepFail,
    MasterOrHigherSmDetected,
    ExitStby,
    IdleTimeProcessRequest,
    IdleTimeProcess,
}

// ===== global functions =====

// Runs the FSM until the signal is absorbed. Each (state, signal) pair
// yields at most one next state plus a side effect; unexpected pairs
// are logged and dropped.
pub fn process_signal(sm: &mut Sm, signal: Signal) {
    let mut signal = signal;

    if sm.is_exiting() {
        sm.state.fsm_state = State::Idle;
        return;
    }

    while signal != Signal::None {
        let state = sm.state.fsm_state;

        // A sweep request only makes sense on an idle edge; anywhere
        // else a sweep is already in progress.
        if signal == Signal::Sweep
            && state != State::Idle
            && state != State::Standby
        {
            break;
        }

        let (next_state, next_signal) = transition(sm, state, signal);
        if next_state != state {
            Debug::FsmTransition(state, signal, next_state).log();
        }
        sm.state.fsm_state = next_state;
        signal = next_signal;

        // A heavy sweep requested from within a finished sweep starts
        // on the next idle edge.
        if signal == Signal::None
            && sm.state.fsm_state == State::Idle
            && sm.state.force_heavy_sweep
            && !sm.is_exiting()
        {
            signal = Signal::Sweep;
        }
    }
}

// ===== helper functions =====

fn transition(sm: &mut Sm, state: State, signal: Signal) -> (State, Signal) {
    match (state, signal) {
        // ===== idle =====
        (State::Idle, Signal::Sweep) => {
            if sm.state.sm_state == SmState::Master
                && !sm.state.force_heavy_sweep
            {
                let signal = discovery::sweep_light_start(sm);
                match signal {
                    // Nothing to probe: the model is empty, force a
                    // heavy sweep.
                    Signal::Done => start_heavy_self(sm),
                    _ => (State::SweepLight, Signal::None),
                }
            } else {
                start_heavy_self(sm)
            }
        }
        (State::Idle, Signal::IdleTimeProcessRequest) => {
            (State::ProcessRequest, Signal::IdleTimeProcess)
        }

        // ===== idle-time work queue =====
        (State::ProcessRequest, Signal::IdleTimeProcess) => {
            match sm.idle_queue.pop_front() {
                None => (State::Idle, Signal::None),
                Some(item) => {
                    let signal = (item.start)(sm);
                    sm.idle_done = Some(item.done);
                    match signal {
                        Signal::DonePending => {
                            (State::ProcessRequestWait, Signal::None)
                        }
                        _ => (State::ProcessRequestDone, Signal::Done),
                    }
                }
            }
        }
        (State::ProcessRequestWait, Signal::NoPendingTransactions) => {
            (State::ProcessRequestDone, Signal::Done)
        }
        (
            State::ProcessRequestDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            if let Some(done) = sm.idle_done.take() {
                (done)(sm);
            }
            (State::ProcessRequest, Signal::IdleTimeProcess)
        }

        // ===== light sweep =====
        (
            State::SweepLight,
            Signal::LightSweepFail | Signal::ChangeDetected,
        ) => {
            sm.state.force_heavy_sweep = true;
            (State::SweepLightWait, Signal::None)
        }
        (State::SweepLight, Signal::NoPendingTransactions) => {
            // All probes confirmed the model; nothing to do.
            (State::ProcessRequest, Signal::IdleTimeProcess)
        }
        (
            State::SweepLightWait,
            Signal::LightSweepFail | Signal::ChangeDetected,
        ) => {
            sm.state.force_heavy_sweep = true;
            (State::SweepLightWait, Signal::None)
        }
        (State::SweepLightWait, Signal::NoPendingTransactions) => {
            start_heavy_self(sm)
        }

        // ===== heavy sweep =====
        (State::SweepHeavySelf, Signal::ChangeDetected) => {
            (State::SweepHeavySelf, Signal::None)
        }
        (State::SweepHeavySelf, Signal::NoPendingTransactions) => {
            if discovery::local_port_down(sm) {
                Debug::SmPortDown.log();
                sm.subnet.write().unwrap().clear();
                sm.state.sm_state = SmState::Discovering;
                (State::Idle, Signal::None)
            } else {
                discovery::sweep_heavy_subnet(sm);
                (State::SweepHeavySubnet, Signal::None)
            }
        }
        (State::SweepHeavySubnet, Signal::ChangeDetected) => {
            (State::SweepHeavySubnet, Signal::None)
        }
        (State::SweepHeavySubnet, Signal::MasterOrHigherSmDetected) => {
            (State::MasterOrHigherSmDetected, Signal::None)
        }
        (State::SweepHeavySubnet, Signal::NoPendingTransactions) => {
            // Mastership resolution before any configuration.
            if let Some(remote_sm) = sm.state.remote_sm {
                let local = local_sm_info(sm);
                if remote_sm.is_higher_than(&local) {
                    send_handover(sm, &remote_sm);
                    sm.state.sm_state = SmState::Standby;
                    return (State::Standby, Signal::None);
                }
                if remote_sm.sm_state == SmState::Master {
                    // This SM wins, but the remote master must
                    // relinquish first; poll again on the next sweep.
                    return (State::ProcessRequest, Signal::IdleTimeProcess);
                }
            }

            sm.state.sm_state = SmState::Master;
            sm.state.force_heavy_sweep = false;
            let signal = set_pkey(sm);
            (State::SetPkey, signal)
        }

        // ===== configuration phase triples =====
        (State::SetPkey, Signal::Done) => (State::SetPkeyDone, Signal::Done),
        (State::SetPkey, Signal::DonePending) => {
            (State::SetPkeyWait, Signal::None)
        }
        (State::SetPkeyWait, Signal::NoPendingTransactions) => {
            (State::SetPkeyDone, Signal::Done)
        }
        (
            State::SetPkeyDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            let signal = lid_mgr::set_sm_lid(sm);
            (State::SetSmUcastLid, signal)
        }

        (State::SetSmUcastLid, Signal::Done) => {
            (State::SetSmUcastLidDone, Signal::Done)
        }
        (State::SetSmUcastLid, Signal::DonePending) => {
            (State::SetSmUcastLidWait, Signal::None)
        }
        (State::SetSmUcastLidWait, Signal::NoPendingTransactions) => {
            (State::SetSmUcastLidDone, Signal::Done)
        }
        (
            State::SetSmUcastLidDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            let signal = lid_mgr::set_subnet_lids(sm);
            (State::SetSubnetUcastLids, signal)
        }

        (State::SetSubnetUcastLids, Signal::Done) => {
            (State::SetSubnetUcastLidsDone, Signal::Done)
        }
        (State::SetSubnetUcastLids, Signal::DonePending) => {
            (State::SetSubnetUcastLidsWait, Signal::None)
        }
        (State::SetSubnetUcastLidsWait, Signal::NoPendingTransactions) => {
            (State::SetSubnetUcastLidsDone, Signal::Done)
        }
        (
            State::SetSubnetUcastLidsDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => match ucast_mgr::process(sm) {
            ucast_mgr::Outcome::Signal(signal) => {
                (State::SetUcastTables, signal)
            }
            // Routing found the fabric inconsistent (e.g. a link died
            // mid-sweep): abort the phase and rediscover.
            ucast_mgr::Outcome::Abort => start_heavy_self(sm),
        },

        (State::SetUcastTables, Signal::Done) => {
            (State::SetUcastTablesDone, Signal::Done)
        }
        (State::SetUcastTables, Signal::DonePending) => {
            (State::SetUcastTablesWait, Signal::None)
        }
        (State::SetUcastTablesWait, Signal::NoPendingTransactions) => {
            (State::SetUcastTablesDone, Signal::Done)
        }
        (
            State::SetUcastTablesDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            // Multicast spanning trees are a collaborator concern; the
            // phase only exists to order table installation before link
            // bring-up.
            (State::SetMcastTables, Signal::Done)
        }

        (State::SetMcastTables, Signal::Done) => {
            (State::SetMcastTablesDone, Signal::Done)
        }
        (State::SetMcastTables, Signal::DonePending) => {
            (State::SetMcastTablesWait, Signal::None)
        }
        (State::SetMcastTablesWait, Signal::NoPendingTransactions) => {
            (State::SetMcastTablesDone, Signal::Done)
        }
        (
            State::SetMcastTablesDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            let signal = link_mgr::process(sm, None);
            (State::SetLinkPorts, signal)
        }

        (State::SetLinkPorts, Signal::Done) => {
            (State::SetLinkPortsDone, Signal::Done)
        }
        (State::SetLinkPorts, Signal::DonePending) => {
            (State::SetLinkPortsWait, Signal::None)
        }
        (State::SetLinkPortsWait, Signal::NoPendingTransactions) => {
            (State::SetLinkPortsDone, Signal::Done)
        }
        (
            State::SetLinkPortsDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            let signal = link_mgr::process(sm, Some(LinkState::Armed));
            (State::SetArmed, signal)
        }

        (State::SetArmed, Signal::Done) => {
            (State::SetArmedDone, Signal::Done)
        }
        (State::SetArmed, Signal::DonePending) => {
            (State::SetArmedWait, Signal::None)
        }
        (State::SetArmedWait, Signal::NoPendingTransactions) => {
            (State::SetArmedDone, Signal::Done)
        }
        (
            State::SetArmedDone,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            let signal = link_mgr::process(sm, Some(LinkState::Active));
            (State::SetActive, signal)
        }

        (State::SetActive, Signal::Done) => (State::SubnetUp, Signal::Done),
        (State::SetActive, Signal::DonePending) => {
            (State::SetActiveWait, Signal::None)
        }
        (State::SetActiveWait, Signal::NoPendingTransactions) => {
            (State::SubnetUp, Signal::NoPendingTransactions)
        }

        // ===== sweep completion =====
        (
            State::SubnetUp,
            Signal::NoPendingTransactions | Signal::Done,
        ) => {
            if sm.state.subnet_initialization_error {
                Debug::InitializationErrors(sm.state.errors_this_sweep).log();
                sm.state.subnet_initialization_error = false;
                sm.state.errors_this_sweep = 0;
                sm.state.force_heavy_sweep = true;
                (State::Idle, Signal::None)
            } else {
                report_subnet_up(sm);
                (State::ProcessRequest, Signal::IdleTimeProcess)
            }
        }

        // ===== mastership =====
        (
            State::MasterOrHigherSmDetected,
            Signal::ChangeDetected | Signal::MasterOrHigherSmDetected,
        ) => (State::MasterOrHigherSmDetected, Signal::None),
        (
            State::MasterOrHigherSmDetected,
            Signal::NoPendingTransactions,
        ) => {
            if let Some(remote_sm) = sm.state.remote_sm {
                send_handover(sm, &remote_sm);
            }
            sm.state.sm_state = SmState::Standby;
            (State::Standby, Signal::None)
        }
        (State::Standby, Signal::ExitStby) => {
            sm.state.sm_state = SmState::Discovering;
            sm.state.remote_sm = None;
            sm.state.force_heavy_sweep = true;
            (State::Idle, Signal::Sweep)
        }
        (State::Standby, Signal::NoPendingTransactions) => {
            (State::Standby, Signal::None)
        }

        _ => {
            if signal != Signal::IdleTimeProcessRequest {
                Error::UnexpectedSignal(state, signal).log();
            }
            (state, Signal::None)
        }
    }
}

fn start_heavy_self(sm: &mut Sm) -> (State, Signal) {
    Debug::SweepHeavyStart.log();
    sm.state.force_heavy_sweep = false;
    sm.state.remote_sm = None;
    sm.state.errors_this_sweep = 0;
    match discovery::sweep_heavy_self(sm) {
        Signal::DonePending => (State::SweepHeavySelf, Signal::None),
        // Request issue failed outright; retry from idle.
        _ => (State::Idle, Signal::None),
    }
}

// Partition keys arrive pre-validated from the policy collaborator;
// with none registered the phase is a no-op.
fn set_pkey(_sm: &mut Sm) -> Signal {
    Signal::Done
}

fn local_sm_info(sm: &Sm) -> SmInfoAttr {
    SmInfoAttr::new(
        sm.state.port_guid,
        sm.state.act_count,
        sm.state.priority,
        sm.state.sm_state,
    )
}

// SubnSet(SMInfo) HANDOVER toward the winning SM.
fn send_handover(sm: &mut Sm, remote_sm: &SmInfoAttr) {
    Debug::HandoverSent(remote_sm.guid).log();
    let local = local_sm_info(sm);
    if let Err(error) = sm.requester.request(
        ibsm_utils::ib::DrPath::local(),
        SmpMethod::Set,
        SmpAttr::SmInfo,
        SmInfoAttrMod::Handover as u32,
        SmpPayload::SmInfo(local),
        RequestContext::Handover,
    ) {
        error.log();
    }
}

fn report_subnet_up(sm: &mut Sm) {
    sm.state.act_count += 1;
    sm.state.last_subnet_up = Some(chrono::Utc::now());
    if !sm.state.subnet_up_reported {
        Debug::SubnetUp.log();
        sm.state.subnet_up_reported = true;
    }
    let _ = sm
        .tx
        .output
        .send(output::ProtocolMsg::SubnetUp(output::SubnetUpMsg {}));

    // Trap 64 for every endport first seen during this sweep.
    let mut traps = Vec::new();
    {
        let mut subnet = sm.subnet.write().unwrap();
        for port_idx in subnet.port_indexes().collect::<Vec<_>>() {
            let port = &mut subnet.ports[port_idx];
            if port.is_new {
                port.is_new = false;
                traps.push((port.port_guid, port.base_lid));
            }
        }
    }
    for (port_guid, base_lid) in traps {
        let _ = sm.tx.output.send(output::ProtocolMsg::PortNewTrap(
            output::PortNewTrapMsg {
                port_guid,
                base_lid,
            },
        ));
    }
}
