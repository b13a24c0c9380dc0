//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use ibsm_routing::{EngineRegistry, RoutingEngine};
use ibsm_subnet::Subnet;
use ibsm_utils::config::SmConfig;
use ibsm_utils::ib::{Guid, SmState};
use ibsm_utils::smp::SmInfoAttr;
use ibsm_utils::task::IntervalTask;
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug_span;

use crate::request::Requester;
use crate::state_mgr::{self, Signal, State};
use crate::tasks;
use crate::tasks::messages::input::{
    ExitStandbyMsg, IdleWorkMsg, SmDiscoveredMsg, SmpResponseMsg,
    SmpTimeoutMsg, SweepMsg,
};
use crate::tasks::messages::{ProtocolInputMsg, ProtocolOutputMsg};
use crate::{events, tasks::messages::input};

// A deferred computation drained from the idle-time queue between
// sweeps. Two-phase: `start` runs first and reports whether SMPs were
// queued; `done` runs once the transactions have drained.
pub struct IdleWorkItem {
    pub start: Box<dyn FnOnce(&mut Sm) -> Signal + Send>,
    pub done: Box<dyn FnOnce(&mut Sm) + Send>,
}

#[derive(Debug)]
pub struct SmStateData {
    pub fsm_state: State,
    pub sm_state: SmState,
    // Identity of the port the SM is bound to.
    pub port_guid: Guid,
    pub node_guid: Guid,
    pub priority: u8,
    pub act_count: u32,
    // Sweep bookkeeping.
    pub force_heavy_sweep: bool,
    pub in_sweep_hop_0: bool,
    pub subnet_initialization_error: bool,
    pub errors_this_sweep: u32,
    pub ignore_existing_lfts: bool,
    // Highest remote SM seen during the current sweep.
    pub remote_sm: Option<SmInfoAttr>,
    // First successful SUBNET_UP already reported.
    pub subnet_up_reported: bool,
    pub last_subnet_up: Option<DateTime<Utc>>,
}

// SM instance: the sweep task's entire mutable world.
pub struct Sm {
    pub config: SmConfig,
    // The shared subnet model (the plock). The sweep task takes the
    // write lock for mutations; collaborators may hold read locks, and
    // holding it across an SMP round-trip is forbidden.
    pub subnet: Arc<RwLock<Subnet>>,
    pub state: SmStateData,
    pub requester: Requester,
    pub engine: Box<dyn RoutingEngine>,
    pub idle_queue: VecDeque<IdleWorkItem>,
    // Completion half of the idle item currently in flight.
    pub idle_done: Option<Box<dyn FnOnce(&mut Sm) + Send>>,
    pub exit_flag: Arc<AtomicBool>,
    pub tx: InstanceChannelsTx,
    _sweep_timer: Option<IntervalTask>,
}

#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    pub output: UnboundedSender<ProtocolOutputMsg>,
    pub protocol_input: ProtocolInputChannelsTx,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    pub sweep: UnboundedSender<SweepMsg>,
    pub smp_response: UnboundedSender<SmpResponseMsg>,
    pub smp_timeout: UnboundedSender<SmpTimeoutMsg>,
    pub sm_discovered: UnboundedSender<SmDiscoveredMsg>,
    pub exit_standby: UnboundedSender<ExitStandbyMsg>,
    pub idle_work: UnboundedSender<IdleWorkMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    pub sweep: UnboundedReceiver<SweepMsg>,
    pub smp_response: UnboundedReceiver<SmpResponseMsg>,
    pub smp_timeout: UnboundedReceiver<SmpTimeoutMsg>,
    pub sm_discovered: UnboundedReceiver<SmDiscoveredMsg>,
    pub exit_standby: UnboundedReceiver<ExitStandbyMsg>,
    pub idle_work: UnboundedReceiver<IdleWorkMsg>,
}

// ===== impl Sm =====

impl Sm {
    pub fn new(
        config: SmConfig,
        port_guid: Guid,
        node_guid: Guid,
        output_tx: UnboundedSender<ProtocolOutputMsg>,
    ) -> (Sm, ProtocolInputChannelsRx) {
        let (input_tx, input_rx) = protocol_input_channels();

        let requester = Requester::new(
            config.transaction_timeout,
            output_tx.clone(),
            input_tx.smp_timeout.clone(),
        );
        let registry = EngineRegistry::with_builtin();
        let engine = registry.create(config.routing_engine.name(), &config);
        let sweep_timer = tasks::sweep_timer(config.sweep_interval, &input_tx.sweep);

        let sm = Sm {
            state: SmStateData {
                fsm_state: State::Idle,
                sm_state: SmState::Discovering,
                port_guid,
                node_guid,
                priority: config.sm_priority,
                act_count: 0,
                force_heavy_sweep: config.force_heavy_sweep,
                in_sweep_hop_0: false,
                subnet_initialization_error: false,
                errors_this_sweep: 0,
                ignore_existing_lfts: config.ignore_existing_lfts,
                remote_sm: None,
                subnet_up_reported: false,
                last_subnet_up: None,
            },
            config,
            subnet: Arc::new(RwLock::new(Subnet::default())),
            requester,
            engine,
            idle_queue: VecDeque::new(),
            idle_done: None,
            exit_flag: Arc::new(AtomicBool::new(false)),
            tx: InstanceChannelsTx {
                output: output_tx,
                protocol_input: input_tx,
            },
            _sweep_timer: sweep_timer,
        };
        (sm, input_rx)
    }

    // Appends a deferred computation and wakes the FSM on its next idle
    // edge.
    pub fn enqueue_idle_work(&mut self, item: IdleWorkItem) {
        self.idle_queue.push_back(item);
        if self.state.fsm_state == State::Idle {
            state_mgr::process_signal(self, Signal::IdleTimeProcessRequest);
        }
    }

    pub fn is_exiting(&self) -> bool {
        self.exit_flag.load(Ordering::Relaxed)
    }

    // Main event loop: drains the input channels until the exit flag is
    // raised. In-flight SMPs keep draining, but their responses resolve
    // against an empty transaction table once the requester was
    // drained.
    pub async fn run(mut self, mut rx: ProtocolInputChannelsRx) {
        loop {
            let msg = tokio::select! {
                Some(msg) = rx.sweep.recv() => {
                    ProtocolInputMsg::Sweep(msg)
                }
                Some(msg) = rx.smp_response.recv() => {
                    ProtocolInputMsg::SmpResponse(msg)
                }
                Some(msg) = rx.smp_timeout.recv() => {
                    ProtocolInputMsg::SmpTimeout(msg)
                }
                Some(msg) = rx.sm_discovered.recv() => {
                    ProtocolInputMsg::SmDiscovered(msg)
                }
                Some(msg) = rx.exit_standby.recv() => {
                    ProtocolInputMsg::ExitStandby(msg)
                }
                Some(msg) = rx.idle_work.recv() => {
                    ProtocolInputMsg::IdleWork(msg)
                }
                else => break,
            };

            if self.is_exiting() {
                self.requester.drain();
                break;
            }

            let span = debug_span!("sm", port_guid = %self.state.port_guid);
            let _span_guard = span.enter();
            events::process_msg(&mut self, msg);
        }
    }

    // Synchronous message entry point, shared by the event loop and the
    // unit tests.
    pub fn deliver(&mut self, msg: input::ProtocolMsg) {
        events::process_msg(self, msg);
    }
}

impl std::fmt::Debug for Sm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sm")
            .field("state", &self.state)
            .field("outstanding", &self.requester.outstanding())
            .field("idle_queue", &self.idle_queue.len())
            .finish()
    }
}

// ===== global functions =====

pub fn protocol_input_channels()
-> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
    let (sweep_tx, sweep_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
    let (sm_tx, sm_rx) = mpsc::unbounded_channel();
    let (stby_tx, stby_rx) = mpsc::unbounded_channel();
    let (idle_tx, idle_rx) = mpsc::unbounded_channel();

    let tx = ProtocolInputChannelsTx {
        sweep: sweep_tx,
        smp_response: response_tx,
        smp_timeout: timeout_tx,
        sm_discovered: sm_tx,
        exit_standby: stby_tx,
        idle_work: idle_tx,
    };
    let rx = ProtocolInputChannelsRx {
        sweep: sweep_rx,
        smp_response: response_rx,
        smp_timeout: timeout_rx,
        sm_discovered: sm_rx,
        exit_standby: stby_rx,
        idle_work: idle_rx,
    };
    (tx, rx)
}
