//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Sweep controller tests, driven over the message channels against a
//! stub transport simulating a small fabric.

use std::collections::{BTreeMap, VecDeque};

use ibsm_sm::Sm;
use ibsm_sm::state_mgr::State;
use ibsm_sm::tasks::messages::input::{SmpResponseMsg, SweepMsg};
use ibsm_sm::tasks::messages::output::{ProtocolMsg, SmpRequestMsg};
use ibsm_sm::tasks::messages::{ProtocolInputMsg, ProtocolOutputMsg};
use ibsm_utils::config::SmConfig;
use ibsm_utils::ib::{Guid, Lid, LinkState, NodeType};
use ibsm_utils::smp::{
    NodeInfoAttr, PortInfoAttr, SmpAttr, SmpMethod, SmpPayload, SwitchInfoAttr,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;

const SM_NODE: u64 = 0x50;

// ===== stub transport =====

#[derive(Clone, Debug)]
struct StubPort {
    port_guid: Guid,
    remote: Option<(u64, u8)>,
    link_state: LinkState,
    base_lid: Lid,
    lmc: u8,
}

#[derive(Clone, Debug)]
struct StubNode {
    guid: Guid,
    node_type: NodeType,
    num_ports: u8,
    // Indexed by port number; entry 0 is the management port.
    ports: Vec<StubPort>,
}

// A simulated fabric answering directed-route SMPs the way real
// hardware would.
#[derive(Debug)]
struct StubFabric {
    nodes: BTreeMap<u64, StubNode>,
    sm_node: u64,
    sm_port: u8,
    lft_sets: usize,
}

impl StubFabric {
    fn add_node(&mut self, guid: u64, node_type: NodeType, num_ports: u8) {
        let ports = (0..=num_ports)
            .map(|port_num| StubPort {
                port_guid: Guid(0x1000 + guid * 0x10 + port_num as u64),
                remote: None,
                link_state: LinkState::Init,
                base_lid: Lid(0),
                lmc: 0,
            })
            .collect();
        self.nodes.insert(
            guid,
            StubNode {
                guid: Guid(guid),
                node_type,
                num_ports,
                ports,
            },
        );
    }

    fn link(&mut self, a: u64, a_port: u8, b: u64, b_port: u8) {
        self.nodes.get_mut(&a).unwrap().ports[a_port as usize].remote =
            Some((b, b_port));
        self.nodes.get_mut(&b).unwrap().ports[b_port as usize].remote =
            Some((a, a_port));
    }

    // Walks the directed route from the SM port, returning the reached
    // node and the port the SMP entered through.
    fn resolve(&self, dr_path: &ibsm_utils::ib::DrPath) -> Option<(u64, u8)> {
        let mut guid = self.sm_node;
        let mut entry = self.sm_port;
        for &hop in dr_path.hops() {
            let node = self.nodes.get(&guid)?;
            let (next_guid, next_port) =
                node.ports.get(hop as usize)?.remote?;
            guid = next_guid;
            entry = next_port;
        }
        Some((guid, entry))
    }

    fn answer(&mut self, req: &SmpRequestMsg) -> SmpResponseMsg {
        let Some((guid, entry)) = self.resolve(&req.dr_path) else {
            // Unreachable path: the transaction would time out; tests
            // never take this branch.
            panic!("stub cannot resolve DR path {}", req.dr_path);
        };

        let payload = match (req.method, req.attr) {
            (SmpMethod::Get, SmpAttr::NodeInfo) => {
                let node = &self.nodes[&guid];
                SmpPayload::NodeInfo(NodeInfoAttr::new(
                    node.node_type,
                    node.num_ports,
                    node.guid,
                    node.guid,
                    node.ports[entry as usize].port_guid,
                    entry,
                ))
            }
            (SmpMethod::Get, SmpAttr::PortInfo) => {
                let node = &self.nodes[&guid];
                let port = &node.ports[req.attr_mod as usize];
                SmpPayload::PortInfo(PortInfoAttr::new(
                    port.port_guid,
                    port.base_lid,
                    port.lmc,
                    port.link_state,
                    Default::default(),
                    Default::default(),
                    Default::default(),
                    Lid(0),
                ))
            }
            (SmpMethod::Get, SmpAttr::SwitchInfo) => {
                SmpPayload::SwitchInfo(SwitchInfoAttr::default())
            }
            (SmpMethod::Set, SmpAttr::PortInfo) => {
                let node = self.nodes.get_mut(&guid).unwrap();
                let port = &mut node.ports[req.attr_mod as usize];
                if let SmpPayload::PortInfo(attr) = &req.payload {
                    if attr.base_lid.is_valid() {
                        port.base_lid = attr.base_lid;
                        port.lmc = attr.lmc;
                    }
                    if attr.link_state >= LinkState::Armed {
                        port.link_state = attr.link_state;
                        if let Some((remote, remote_port)) = port.remote {
                            self.nodes.get_mut(&remote).unwrap().ports
                                [remote_port as usize]
                                .link_state = attr.link_state;
                        }
                    }
                }
                SmpPayload::None
            }
            (SmpMethod::Set, SmpAttr::LinFwdTbl) => {
                self.lft_sets += 1;
                SmpPayload::None
            }
            (SmpMethod::Set, _) => SmpPayload::None,
            (method, attr) => {
                panic!("stub cannot answer {:?} {:?}", method, attr)
            }
        };

        SmpResponseMsg {
            tid: req.tid,
            payload,
        }
    }
}

// Two switches A and B, one CA each, plus the SM's CA on A.
//
//   CA3 - A.1     B.1 - CA4
//   SM  - A.2
//         A.3 --- B.3
fn two_switch_fabric() -> StubFabric {
    let mut fabric = StubFabric {
        nodes: BTreeMap::new(),
        sm_node: SM_NODE,
        sm_port: 1,
        lft_sets: 0,
    };
    fabric.add_node(SM_NODE, NodeType::Ca, 1);
    fabric.add_node(0xA, NodeType::Switch, 3);
    fabric.add_node(0xB, NodeType::Switch, 3);
    fabric.add_node(0xC3, NodeType::Ca, 1);
    fabric.add_node(0xC4, NodeType::Ca, 1);
    fabric.link(0xC3, 1, 0xA, 1);
    fabric.link(SM_NODE, 1, 0xA, 2);
    fabric.link(0xC4, 1, 0xB, 1);
    fabric.link(0xA, 3, 0xB, 3);
    fabric
}

// ===== harness =====

struct Harness {
    sm: Sm,
    fabric: StubFabric,
    output_rx: UnboundedReceiver<ProtocolOutputMsg>,
    log: Vec<ProtocolOutputMsg>,
}

impl Harness {
    fn new() -> Harness {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();

        let fabric = two_switch_fabric();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let sm_port_guid = fabric.nodes[&SM_NODE].ports[1].port_guid;
        let (sm, _input_rx) = Sm::new(
            SmConfig::default(),
            sm_port_guid,
            Guid(SM_NODE),
            output_tx,
        );
        Harness {
            sm,
            fabric,
            output_rx,
            log: Vec::new(),
        }
    }

    // Answers every outstanding request until the controller goes
    // quiet. `fault_hook` fires right before the final discovery
    // response of a heavy subnet sweep is delivered.
    fn pump(&mut self, mut fault_hook: Option<&mut dyn FnMut(&mut Sm)>) {
        let had_hook = fault_hook.is_some();
        let mut responses: VecDeque<SmpResponseMsg> = VecDeque::new();

        loop {
            while let Ok(msg) = self.output_rx.try_recv() {
                if let ProtocolMsg::SmpRequest(req) = &msg {
                    responses.push_back(self.fabric.answer(req));
                }
                self.log.push(msg);
            }

            let Some(response) = responses.pop_front() else {
                break;
            };

            if let Some(hook) = fault_hook.as_mut()
                && responses.is_empty()
                && self.sm.requester.outstanding() == 1
                && self.sm.state.fsm_state == State::SweepHeavySubnet
            {
                (hook)(&mut self.sm);
                fault_hook = None;
            }

            self.sm.deliver(ProtocolInputMsg::SmpResponse(response));

            // After the injected fault, a rediscovery abort ends the
            // experiment.
            if had_hook
                && fault_hook.is_none()
                && self.sm.state.fsm_state == State::SweepHeavySelf
            {
                break;
            }
        }
    }

    fn sweep(&mut self, force_heavy: bool) {
        self.sm.deliver(ProtocolInputMsg::Sweep(SweepMsg { force_heavy }));
        self.pump(None);
    }

    fn lft_set_requests(&self) -> usize {
        self.log
            .iter()
            .filter(|msg| {
                matches!(msg, ProtocolMsg::SmpRequest(req)
                    if req.attr == SmpAttr::LinFwdTbl
                        && req.method == SmpMethod::Set)
            })
            .count()
    }

    fn subnet_up_events(&self) -> usize {
        self.log
            .iter()
            .filter(|msg| matches!(msg, ProtocolMsg::SubnetUp(_)))
            .count()
    }
}

// ===== tests =====

// First sweep: discovery, LID assignment, routing, table installation,
// link bring-up, SUBNET UP with Trap 64 for every new endport.
#[test]
fn heavy_sweep_brings_subnet_up() {
    let mut harness = Harness::new();
    harness.sweep(false);

    assert_eq!(harness.sm.state.fsm_state, State::Idle);
    assert_eq!(harness.subnet_up_events(), 1);
    assert!(harness.lft_set_requests() >= 2, "both switches get tables");

    let traps = harness
        .log
        .iter()
        .filter(|msg| matches!(msg, ProtocolMsg::PortNewTrap(_)))
        .count();
    // Five endports: two switch management ports, two CAs, the SM.
    assert_eq!(traps, 5);

    // Every link ended up ACTIVE.
    let subnet = harness.sm.subnet.read().unwrap();
    for node_idx in subnet.node_indexes().collect::<Vec<_>>() {
        for physp in subnet.nodes[node_idx].data_ports() {
            if physp.remote.is_some() {
                assert_eq!(physp.link_state, LinkState::Active);
            }
        }
    }
}

// LID stability law: a second heavy sweep must not move any base LID.
#[test]
fn lids_stable_across_sweeps() {
    let mut harness = Harness::new();
    harness.sweep(false);

    let before: Vec<(Guid, Lid)> = {
        let subnet = harness.sm.subnet.read().unwrap();
        subnet
            .port_indexes()
            .map(|port_idx| {
                let port = &subnet.ports[port_idx];
                (port.port_guid, port.base_lid)
            })
            .collect()
    };

    harness.sweep(true);

    let subnet = harness.sm.subnet.read().unwrap();
    let after: Vec<(Guid, Lid)> = subnet
        .port_indexes()
        .map(|port_idx| {
            let port = &subnet.ports[port_idx];
            (port.port_guid, port.base_lid)
        })
        .collect();
    assert_eq!(before, after);
}

// Light-sweep idempotence: with no topology change, a light sweep must
// not emit a single SubnSet(LinearForwardingTable).
#[test]
fn light_sweep_is_idempotent() {
    let mut harness = Harness::new();
    harness.sweep(false);
    assert_eq!(harness.sm.state.fsm_state, State::Idle);

    let installed_blocks = harness.fabric.lft_sets;
    harness.log.clear();
    harness.sweep(false);

    assert_eq!(harness.lft_set_requests(), 0);
    assert_eq!(harness.fabric.lft_sets, installed_blocks);
    assert_eq!(harness.sm.state.fsm_state, State::Idle);

    // The light sweep only probed; no heavy rediscovery happened.
    let node_info_probes = harness
        .log
        .iter()
        .filter(|msg| {
            matches!(msg, ProtocolMsg::SmpRequest(req)
                if req.attr == SmpAttr::NodeInfo)
        })
        .count();
    assert_eq!(node_info_probes, 0);
}

// Deferred work drains through the idle-time queue once the FSM hits
// an idle edge, with the two-phase start/done contract.
#[test]
fn idle_queue_two_phase() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use ibsm_sm::instance::IdleWorkItem;
    use ibsm_sm::state_mgr::Signal;

    let mut harness = Harness::new();
    harness.sweep(false);
    assert_eq!(harness.sm.state.fsm_state, State::Idle);

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let started_flag = started.clone();
    let finished_flag = finished.clone();

    harness.sm.enqueue_idle_work(IdleWorkItem {
        start: Box::new(move |_| {
            started_flag.store(true, Ordering::Relaxed);
            Signal::Done
        }),
        done: Box::new(move |_| {
            finished_flag.store(true, Ordering::Relaxed);
        }),
    });

    assert!(started.load(Ordering::Relaxed));
    assert!(finished.load(Ordering::Relaxed));
    assert_eq!(harness.sm.state.fsm_state, State::Idle);
}

// A link dying between discovery and SET_UCAST_TABLES makes part of
// the fabric unreachable; the controller must abort the phase and loop
// back through SWEEP_HEAVY_SELF instead of installing stale tables.
#[test]
fn port_down_mid_sweep_aborts_to_rediscovery() {
    let mut harness = Harness::new();
    harness.sweep(false);
    assert_eq!(harness.sm.state.fsm_state, State::Idle);

    harness.log.clear();
    harness
        .sm
        .deliver(ProtocolInputMsg::Sweep(SweepMsg { force_heavy: true }));

    let mut kill_link = |sm: &mut Sm| {
        let mut subnet = sm.subnet.write().unwrap();
        let (node_idx, _) = subnet.node_by_guid(Guid(0xA)).unwrap();
        subnet.nodes[node_idx]
            .physp_mut(3)
            .unwrap()
            .flags
            .insert(ibsm_subnet::PortFlags::FAULTY);
    };
    harness.pump(Some(&mut kill_link));

    assert_eq!(harness.sm.state.fsm_state, State::SweepHeavySelf);
    assert_eq!(
        harness.lft_set_requests(),
        0,
        "no tables may be installed after the abort"
    );
    assert!(harness.sm.state.subnet_initialization_error);
}
