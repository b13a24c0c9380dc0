//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Nue unicast routing.
//!
//! Nue computes deadlock-free routes on arbitrary topologies by running
//! Dijkstra's algorithm directly on the complete channel dependency
//! graph (cCDG) instead of the network graph. Every accepted channel
//! dependency is colored per destination; a cycle-safe promotion step
//! refuses any edge that would close a directed cycle within one
//! virtual lane, and per-VL escape paths (a spanning tree rooted at the
//! most central switch of the VL's destinations) guarantee a valid
//! fallback when the search reaches an impasse.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};
use std::cmp::Reverse;

use ibsm_subnet::{NodeIndex, Subnet, SwitchIndex};
use ibsm_utils::config::SmConfig;
use ibsm_utils::ib::{Lid, NodeType};

use crate::RoutingEngine;
use crate::debug::Debug;
use crate::error::Error;

const INFINITY: u64 = u64::MAX;

// Special entries of the color array.
const BLOCKED: usize = 0;
const UNUSED: usize = 1;
const ESCAPE_PATH: usize = 2;

type NodeId = usize;
type LinkId = usize;
type CcdgId = usize;

// Identifies a directed switch-to-switch channel by the LID and port of
// both ends. Fake source channels use equal LIDs and zero ports.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Channel {
    local_lid: u16,
    local_port: u8,
    remote_lid: u16,
    remote_port: u8,
}

#[derive(Debug)]
struct NetworkLink {
    channel: Channel,
    to_node: NodeId,
    ccdg_node: CcdgId,
    weight: u64,
}

#[derive(Debug)]
struct NetworkNode {
    lid: u16,
    sw_idx: SwitchIndex,
    node_idx: NodeIndex,
    // CAs behind this switch, plus the switch itself, counting LMC
    // replicas.
    num_terminals: u64,
    links: Vec<LinkId>,
    // Dijkstra state.
    distance: u64,
    used_link: Option<LinkId>,
    hops: u8,
    // Alternate colored channels into this node, for backtracking.
    stack_used_links: Vec<LinkId>,
    found_after_backtracking_step: i32,
    // Escape spanning tree: the link this node was reached through.
    escape_path: Option<LinkId>,
    // Convex hull and betweenness centrality helpers.
    in_convex_hull: bool,
    processed: bool,
    betw_centrality: f64,
    delta: f64,
    sigma: u64,
    ps: Vec<NodeId>,
    num_adj_terminals_in_hull: u64,
    has_adj_destinations: bool,
}

#[derive(Debug, Default)]
struct Network {
    nodes: Vec<NetworkNode>,
    links: Vec<NetworkLink>,
    node_by_lid: BTreeMap<u16, NodeId>,
}

// One disjoint acyclic subgraph of the cCDG. Merging two subgraphs
// repoints the absorbed color's `real_col`; reads follow one level of
// indirection, which `fix` collapses after every destination.
#[derive(Clone, Copy, Debug)]
struct Color {
    real_col: usize,
}

#[derive(Debug)]
struct CcdgEdge {
    to: CcdgId,
    to_channel: Channel,
    color: usize,
    wet_paint: bool,
}

#[derive(Debug)]
struct CcdgNode {
    channel: Channel,
    edges: Vec<CcdgEdge>,
    // The network link this vertex stands for; None for the fake
    // per-switch source vertices.
    netw_link: Option<LinkId>,
    distance: u64,
    color: usize,
    wet_paint: bool,
}

#[derive(Debug, Default)]
struct Ccdg {
    nodes: Vec<CcdgNode>,
    node_by_channel: BTreeMap<Channel, CcdgId>,
    colors: Vec<Color>,
}

// Deadlock-free engine for arbitrary topologies.
#[derive(Debug)]
pub struct NueEngine {
    max_vl: u8,
    network: Network,
    ccdg: Ccdg,
    destinations: Vec<Vec<u16>>,
    dlid_to_vl: BTreeMap<u16, u8>,
    // Destinations whose used paths came from the escape spanning tree
    // instead of a cCDG search.
    escape_fallbacks: BTreeSet<u16>,
}

// ===== impl Channel =====

impl Channel {
    fn fake(lid: u16) -> Channel {
        Channel {
            local_lid: lid,
            local_port: 0,
            remote_lid: lid,
            remote_port: 0,
        }
    }

    fn inverted(&self) -> Channel {
        Channel {
            local_lid: self.remote_lid,
            local_port: self.remote_port,
            remote_lid: self.local_lid,
            remote_port: self.local_port,
        }
    }

    fn is_reverse_of(&self, other: &Channel) -> bool {
        self.local_lid == other.remote_lid
            && self.remote_lid == other.local_lid
    }
}

// ===== impl Network =====

impl Network {
    fn node_by_lid(&self, lid: u16) -> Option<NodeId> {
        self.node_by_lid.get(&lid).copied()
    }

    fn reset_dijkstra_state(&mut self) {
        for node in self.nodes.iter_mut() {
            node.distance = INFINITY;
            node.used_link = None;
            node.stack_used_links.clear();
            node.hops = 0;
            node.found_after_backtracking_step = -1;
        }
    }
}

// ===== impl Ccdg =====

impl Ccdg {
    fn node_color(&self, node: CcdgId) -> usize {
        self.colors[self.nodes[node].color].real_col
    }

    fn edge_color(&self, node: CcdgId, edge_pos: usize) -> usize {
        self.colors[self.nodes[node].edges[edge_pos].color].real_col
    }

    // Edge position from `from` to `to`, if the turn exists.
    fn edge_between(&self, from: CcdgId, to: CcdgId) -> Option<usize> {
        self.nodes[from].edges.iter().position(|edge| edge.to == to)
    }

    // Resets every color to a singleton and sizes the array for the
    // VL's destinations.
    fn reset_color_array(&mut self, num_colors: usize) {
        self.colors.clear();
        for real_col in 0..num_colors.max(3) {
            self.colors.push(Color { real_col });
        }
        for node in self.nodes.iter_mut() {
            node.color = UNUSED;
            node.wet_paint = false;
            for edge in node.edges.iter_mut() {
                edge.color = UNUSED;
                edge.wet_paint = false;
            }
        }
    }

    fn set_escape_node(&mut self, node: CcdgId) {
        self.nodes[node].color = ESCAPE_PATH;
    }

    fn set_escape_edge(&mut self, from: CcdgId, to: CcdgId) {
        if let Some(edge_pos) = self.edge_between(from, to) {
            self.nodes[from].edges[edge_pos].color = ESCAPE_PATH;
        }
    }

    // Only valid for the fake source vertices at Dijkstra start.
    fn change_fake_node_color(&mut self, node: CcdgId, color: usize) {
        if self.node_color(node) > UNUSED {
            let entry = self.nodes[node].color;
            self.colors[entry].real_col = color;
        } else {
            self.nodes[node].color = color;
        }
    }

    fn block_edge(&mut self, node: CcdgId, edge_pos: usize) {
        self.nodes[node].edges[edge_pos].color = BLOCKED;
        self.nodes[node].edges[edge_pos].wet_paint = false;
    }

    // Colors the edge `from -> to` with `from`'s subgraph color.
    fn add_edge_to_subgraph(&mut self, from: CcdgId, edge_pos: usize) {
        self.nodes[from].edges[edge_pos].color = self.nodes[from].color;
        self.nodes[from].edges[edge_pos].wet_paint = true;
    }

    fn add_node_to_subgraph(&mut self, from: CcdgId, edge_pos: usize) {
        let to = self.nodes[from].edges[edge_pos].to;
        self.nodes[to].color = self.nodes[from].color;
        self.nodes[to].wet_paint = true;
        self.add_edge_to_subgraph(from, edge_pos);
    }

    fn merge_subgraphs(&mut self, from: CcdgId, edge_pos: usize) {
        let to = self.nodes[from].edges[edge_pos].to;
        let absorbed = self.nodes[to].color;
        self.colors[absorbed].real_col = self.nodes[from].color;
        self.add_edge_to_subgraph(from, edge_pos);
    }

    fn reset_edge_color(&mut self, node: CcdgId, edge_pos: usize) {
        if self.nodes[node].edges[edge_pos].wet_paint {
            self.nodes[node].edges[edge_pos].color = UNUSED;
            self.nodes[node].edges[edge_pos].wet_paint = false;
        }
    }

    fn reset_edge_color_between(&mut self, from: CcdgId, to: CcdgId) {
        if let Some(edge_pos) = self.edge_between(from, to) {
            self.reset_edge_color(from, edge_pos);
        }
    }
}

// ===== impl NueEngine =====

impl NueEngine {
    pub fn setup(config: &SmConfig) -> NueEngine {
        NueEngine {
            max_vl: config.nue_max_num_vls.clamp(1, 15),
            network: Network::default(),
            ccdg: Ccdg::default(),
            destinations: Vec::new(),
            dlid_to_vl: BTreeMap::new(),
            escape_fallbacks: BTreeSet::new(),
        }
    }

    // Whether this destination's routes were taken from the escape
    // spanning tree (cCDG impasse, or a destination routed over plain
    // spanning trees) rather than found by the search itself.
    pub fn used_escape_path(&self, dlid: Lid) -> bool {
        self.escape_fallbacks.contains(&dlid.0)
    }
}

impl RoutingEngine for NueEngine {
    fn name(&self) -> &'static str {
        "nue"
    }

    // Rebuilds the network graph and the complete CDG from the subnet.
    fn build_hop_matrices(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error> {
        self.network = discover_network(subnet, config)?;
        self.ccdg = build_complete_cdg(&mut self.network);
        Ok(())
    }

    fn build_ucast_tables(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error> {
        if self.network.nodes.is_empty() {
            return Err(Error::Unsupported);
        }
        self.do_ucast_routing(subnet, config)
    }

    // The virtual lane a destination was routed in.
    fn path_sl(&self, hint_sl: u8, _slid: Lid, dlid: Lid) -> u8 {
        self.dlid_to_vl.get(&dlid.0).copied().unwrap_or(hint_sl)
    }
}

// ===== network and cCDG construction =====

// Builds the switch-to-switch multigraph with N^2 initial link weights,
// where N is the total number of destination LIDs.
fn discover_network(
    subnet: &Subnet,
    config: &SmConfig,
) -> Result<Network, Error> {
    let mut network = Network::default();

    let total_lids = subnet
        .port_indexes()
        .filter_map(|port_idx| subnet.ports[port_idx].lid_range())
        .map(|(min, max)| (max.0 - min.0 + 1) as u64)
        .sum::<u64>();
    let init_weight = total_lids * total_lids;

    // Nodes first, sorted by LID for deterministic traversal.
    let mut entries = Vec::new();
    for sw_idx in subnet.switch_indexes() {
        let sw = &subnet.switches[sw_idx];
        let Some(base_lid) = subnet.switch_base_lid(sw_idx) else {
            continue;
        };
        entries.push((base_lid.0, sw_idx, sw.node_idx));
    }
    entries.sort_unstable_by_key(|&(lid, ..)| lid);

    for (lid, sw_idx, node_idx) in entries {
        let node = &subnet.nodes[node_idx];

        // The switch's own endport counts as a terminal too.
        let mut num_terminals = 1u64;
        for physp in node.data_ports() {
            let Some((remote_idx, remote_port)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            let remote = &subnet.nodes[remote_idx];
            if remote.node_type != NodeType::Switch {
                let lmc = remote
                    .endports
                    .iter()
                    .map(|&port_idx| &subnet.ports[port_idx])
                    .find(|port| port.port_num == remote_port)
                    .map(|port| port.lmc)
                    .unwrap_or(0);
                num_terminals += 1u64 << lmc;
            }
        }

        network.node_by_lid.insert(lid, network.nodes.len());
        network.nodes.push(NetworkNode {
            lid,
            sw_idx,
            node_idx,
            num_terminals,
            links: Vec::new(),
            distance: INFINITY,
            used_link: None,
            hops: 0,
            stack_used_links: Vec::new(),
            found_after_backtracking_step: -1,
            escape_path: None,
            in_convex_hull: false,
            processed: false,
            betw_centrality: 0.0,
            delta: 0.0,
            sigma: 0,
            ps: Vec::new(),
            num_adj_terminals_in_hull: 0,
            has_adj_destinations: false,
        });
    }

    // Links second, now that every endpoint has an id.
    for node_id in 0..network.nodes.len() {
        let node_idx = network.nodes[node_id].node_idx;
        let lid = network.nodes[node_id].lid;
        let node = &subnet.nodes[node_idx];
        for physp in node.data_ports() {
            let Some((remote_idx, remote_port)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            if remote_idx == node_idx {
                continue;
            }
            let remote = &subnet.nodes[remote_idx];
            if remote.node_type != NodeType::Switch {
                continue;
            }
            if !subnet.link_is_healthy(
                node_idx,
                physp.port_num,
                config.avoid_throttled_links,
            ) {
                continue;
            }
            let Some(remote_lid) = subnet
                .node_base_lid(remote_idx)
                .map(|remote_lid| remote_lid.0)
            else {
                continue;
            };
            let Some(to_node) = network.node_by_lid(remote_lid) else {
                continue;
            };

            let link_id = network.links.len();
            network.links.push(NetworkLink {
                channel: Channel {
                    local_lid: lid,
                    local_port: physp.port_num,
                    remote_lid,
                    remote_port,
                },
                to_node,
                ccdg_node: 0,
                weight: init_weight,
            });
            network.nodes[node_id].links.push(link_id);
        }
    }

    Ok(network)
}

// One cCDG vertex per directed link plus one fake vertex per switch;
// one edge per turn, excluding the direct reverse.
fn build_complete_cdg(network: &mut Network) -> Ccdg {
    let mut ccdg = Ccdg::default();

    for node in network.nodes.iter() {
        // Fake source vertex, connected to every link leaving the
        // switch.
        let fake_channel = Channel::fake(node.lid);
        let edges = node
            .links
            .iter()
            .map(|&link_id| network.links[link_id].channel)
            .collect::<Vec<_>>();
        push_ccdg_node(&mut ccdg, fake_channel, None, edges);

        // Real vertices: channel (A -> B) depends on every (B -> C)
        // except the reverse of itself.
        for &link_id in node.links.iter() {
            let channel = network.links[link_id].channel;
            let remote = network.links[link_id].to_node;
            let edges = network.nodes[remote]
                .links
                .iter()
                .map(|&next_id| network.links[next_id].channel)
                .filter(|next| {
                    !(channel.local_lid == next.remote_lid
                        && channel.local_port == next.remote_port)
                })
                .collect::<Vec<_>>();
            push_ccdg_node(&mut ccdg, channel, Some(link_id), edges);
        }
    }

    // Resolve edge targets and backlink the network links.
    for node_id in 0..ccdg.nodes.len() {
        for edge_pos in 0..ccdg.nodes[node_id].edges.len() {
            let channel = ccdg.nodes[node_id].edges[edge_pos].to_channel;
            ccdg.nodes[node_id].edges[edge_pos].to =
                ccdg.node_by_channel[&channel];
        }
        if let Some(link_id) = ccdg.nodes[node_id].netw_link {
            network.links[link_id].ccdg_node = node_id;
        }
    }

    ccdg
}

fn push_ccdg_node(
    ccdg: &mut Ccdg,
    channel: Channel,
    netw_link: Option<LinkId>,
    edge_channels: Vec<Channel>,
) {
    let node_id = ccdg.nodes.len();
    ccdg.node_by_channel.insert(channel, node_id);
    ccdg.nodes.push(CcdgNode {
        channel,
        edges: edge_channels
            .into_iter()
            .map(|to_channel| CcdgEdge {
                to: 0,
                to_channel,
                color: UNUSED,
                wet_paint: false,
            })
            .collect(),
        netw_link,
        distance: 0,
        color: UNUSED,
        wet_paint: false,
    });
}

// ===== destination-to-VL distribution =====

impl NueEngine {
    // Round-robin partitioning of the destination LIDs across the
    // available virtual lanes; a cut-minimizing graph partitioner would
    // slot in here.
    fn distribute_lids(&mut self, subnet: &Subnet, include_switches: bool) {
        self.destinations = vec![Vec::new(); self.max_vl as usize];

        let mut all = Vec::new();
        for port_idx in subnet.port_indexes() {
            let port = &subnet.ports[port_idx];
            if !port.base_lid.is_valid() {
                continue;
            }
            let is_switch = subnet.nodes[port.node_idx].is_switch();
            if is_switch && !include_switches {
                continue;
            }
            all.push(port.base_lid.0);
        }
        all.sort_unstable();

        for (i, dlid) in all.into_iter().enumerate() {
            let vl = (i % self.max_vl as usize) as u8;
            self.destinations[vl as usize].push(dlid);
            Debug::NueVlAssignment(Lid(dlid), vl).log();
        }
    }
}

// ===== escape paths =====

impl NueEngine {
    // Determines the convex hull of the VL's destinations: the
    // enclosure of all shortest paths between their fronting switches.
    fn calculate_convex_hull(&mut self, destinations: &[NodeId]) {
        let network = &mut self.network;
        for node in network.nodes.iter_mut() {
            node.in_convex_hull = false;
            node.has_adj_destinations = false;
        }
        for &node_id in destinations {
            network.nodes[node_id].in_convex_hull = true;
            network.nodes[node_id].has_adj_destinations = true;
        }

        let num_nodes = network.nodes.len();
        for start in 0..num_nodes {
            if !network.nodes[start].in_convex_hull {
                continue;
            }

            // BFS distances from this hull member.
            for node in network.nodes.iter_mut() {
                node.distance = INFINITY;
                node.processed = false;
            }
            network.nodes[start].distance = 0;
            network.nodes[start].processed = true;
            let mut queue = VecDeque::from([start]);
            while let Some(u) = queue.pop_front() {
                for pos in 0..network.nodes[u].links.len() {
                    let link_id = network.nodes[u].links[pos];
                    let v = network.links[link_id].to_node;
                    if network.nodes[v].distance == INFINITY {
                        network.nodes[v].distance =
                            network.nodes[u].distance + 1;
                        queue.push_back(v);
                    }
                }
            }

            // Walk the BFS tree backward from every other hull member;
            // everything on a shortest path joins the hull.
            for other in 0..num_nodes {
                if !network.nodes[other].in_convex_hull
                    || network.nodes[other].processed
                {
                    continue;
                }
                network.nodes[other].processed = true;
                let mut queue = VecDeque::from([other]);
                while let Some(v) = queue.pop_front() {
                    for pos in 0..network.nodes[v].links.len() {
                        let link_id = network.nodes[v].links[pos];
                        let u = network.links[link_id].to_node;
                        if network.nodes[u].processed {
                            continue;
                        }
                        if network.nodes[u].distance + 1
                            == network.nodes[v].distance
                        {
                            network.nodes[u].in_convex_hull = true;
                            network.nodes[u].processed = true;
                            queue.push_back(u);
                        }
                    }
                }
            }
        }
    }

    // Brandes-style betweenness centrality over the convex hull,
    // modified to account for the terminals attached to each switch.
    // Returns the most central hull member.
    fn central_node(&mut self, destinations: &[(u16, NodeId)]) -> NodeId {
        let network = &mut self.network;
        for node in network.nodes.iter_mut() {
            node.betw_centrality = 0.0;
            node.num_adj_terminals_in_hull = 0;
        }
        for &(dlid, node_id) in destinations {
            if dlid != network.nodes[node_id].lid {
                network.nodes[node_id].num_adj_terminals_in_hull += 1;
            }
        }

        let num_nodes = network.nodes.len();
        for start in 0..num_nodes {
            if !network.nodes[start].in_convex_hull {
                continue;
            }

            for node in network.nodes.iter_mut() {
                node.ps.clear();
                node.sigma = 0;
                node.distance = INFINITY;
            }
            network.nodes[start].sigma = 1;
            network.nodes[start].distance = 0;

            let mut fifo = VecDeque::from([start]);
            let mut lifo = Vec::new();
            while let Some(u) = fifo.pop_front() {
                lifo.push(u);
                for pos in 0..network.nodes[u].links.len() {
                    let link_id = network.nodes[u].links[pos];
                    let v = network.links[link_id].to_node;
                    if !network.nodes[v].in_convex_hull {
                        continue;
                    }
                    if network.nodes[v].distance == INFINITY {
                        network.nodes[v].distance =
                            network.nodes[u].distance + 1;
                        fifo.push_back(v);
                    }
                    if network.nodes[v].distance
                        == network.nodes[u].distance + 1
                    {
                        let sigma_u = network.nodes[u].sigma;
                        network.nodes[v].sigma += sigma_u;
                        network.nodes[v].ps.push(u);
                    }
                }
            }

            // One accumulation pass for the switch itself plus one per
            // attached hull terminal, since terminals are not explicit
            // graph nodes.
            let rounds = network.nodes[start].num_adj_terminals_in_hull + 1;
            for round in 0..rounds {
                for node in network.nodes.iter_mut() {
                    node.delta = 0.0;
                }
                for &v in lifo.iter().rev() {
                    let update_for_adj = if v != start {
                        network.nodes[v].num_adj_terminals_in_hull
                    } else if round == 0 {
                        network.nodes[v].num_adj_terminals_in_hull
                    } else {
                        network.nodes[v]
                            .num_adj_terminals_in_hull
                            .saturating_sub(1)
                    };
                    network.nodes[v].delta += update_for_adj as f64;

                    let (sigma_v, delta_v) =
                        (network.nodes[v].sigma, network.nodes[v].delta);
                    for pos in 0..network.nodes[v].ps.len() {
                        let u = network.nodes[v].ps[pos];
                        let sigma_u = network.nodes[u].sigma;
                        network.nodes[u].delta += (sigma_u as f64)
                            / (sigma_v as f64)
                            * (1.0 + delta_v);
                    }
                    if round > 0 || v != start {
                        network.nodes[v].betw_centrality +=
                            network.nodes[v].delta;
                    }
                }
            }
        }

        let mut central = 0;
        let mut max_centrality = -1.0;
        for (node_id, node) in network.nodes.iter().enumerate() {
            if node.in_convex_hull && node.betw_centrality > max_centrality {
                max_centrality = node.betw_centrality;
                central = node_id;
            }
        }
        central
    }

    // Weighted Dijkstra spanning tree from the root; the tree is stored
    // in each node's escape_path.
    fn calculate_spanning_tree(&mut self, root: NodeId) {
        let network = &mut self.network;
        for node in network.nodes.iter_mut() {
            node.distance = INFINITY;
            node.escape_path = None;
        }
        network.nodes[root].distance = 0;

        let mut heap = BinaryHeap::new();
        heap.push(Reverse((0u64, root)));
        while let Some(Reverse((distance, u))) = heap.pop() {
            if distance > network.nodes[u].distance {
                continue;
            }
            for pos in 0..network.nodes[u].links.len() {
                let link_id = network.nodes[u].links[pos];
                let v = network.links[link_id].to_node;
                let new_distance = network.nodes[u]
                    .distance
                    .saturating_add(network.links[link_id].weight);
                if new_distance < network.nodes[v].distance {
                    network.nodes[v].distance = new_distance;
                    network.nodes[v].escape_path = Some(link_id);
                    heap.push(Reverse((new_distance, v)));
                }
            }
        }
    }

    // Colors the escape spanning tree into the cCDG, including the
    // reverse turns needed by switches fronting destinations, and the
    // turns through the tree root.
    fn mark_escape_paths(
        &mut self,
        destinations: &[u16],
        subnet: &Subnet,
        verify_network_integrity: bool,
    ) -> Result<(), Error> {
        let dest_nodes = destinations
            .iter()
            .filter_map(|&dlid| {
                let front = front_switch_lid(subnet, Lid(dlid))?;
                Some((dlid, self.network.node_by_lid(front.0)?))
            })
            .collect::<Vec<_>>();
        let hull_members = dest_nodes
            .iter()
            .map(|&(_, node_id)| node_id)
            .collect::<Vec<_>>();

        self.calculate_convex_hull(&hull_members);
        let central = self.central_node(&dest_nodes);
        Debug::NueEscapeRoot(
            0,
            subnet.switches[self.network.nodes[central].sw_idx].guid,
        )
        .log();
        self.calculate_spanning_tree(central);

        if verify_network_integrity {
            let undiscovered = self
                .network
                .nodes
                .iter()
                .filter(|node| node.escape_path.is_none())
                .count();
            // Only the tree root lacks an escape path in a connected
            // fabric.
            if undiscovered > 1 {
                return Err(Error::Unreachable(Lid(
                    self.network.nodes[central].lid
                )));
            }
        }

        // Restore the destination flags clobbered by the hull pass.
        for node in self.network.nodes.iter_mut() {
            node.has_adj_destinations = false;
        }
        for &node_id in &hull_members {
            self.network.nodes[node_id].has_adj_destinations = true;
        }

        let mut into_central: Vec<LinkId> = Vec::new();
        for node_id in 0..self.network.nodes.len() {
            let mut curr_link = self.network.nodes[node_id].escape_path;
            let has_adj = self.network.nodes[node_id].has_adj_destinations;

            while let Some(curr) = curr_link {
                let parent =
                    self.network.node_by_lid
                        [&self.network.links[curr].channel.local_lid];
                let curr_ccdg = self.network.links[curr].ccdg_node;
                self.ccdg.set_escape_node(curr_ccdg);

                let Some(next) = self.network.nodes[parent].escape_path
                else {
                    // Reached the tree root.
                    if !into_central.contains(&curr) {
                        into_central.push(curr);
                    }
                    break;
                };

                let next_ccdg = self.network.links[next].ccdg_node;
                self.ccdg.set_escape_node(next_ccdg);
                self.ccdg.set_escape_edge(next_ccdg, curr_ccdg);

                // Reverse-direction traffic out of destination-fronting
                // switches follows the tree upward.
                if has_adj {
                    let rev_curr = self.ccdg.node_by_channel
                        [&self.network.links[curr].channel.inverted()];
                    let rev_next = self.ccdg.node_by_channel
                        [&self.network.links[next].channel.inverted()];
                    self.ccdg.set_escape_node(rev_curr);
                    self.ccdg.set_escape_node(rev_next);
                    self.ccdg.set_escape_edge(rev_curr, rev_next);

                    // Turns into sibling branches of the parent.
                    let curr_channel = self.network.links[curr].channel;
                    for pos in 0..self.network.nodes[parent].links.len() {
                        let sibling_id =
                            self.network.nodes[parent].links[pos];
                        let sibling = self.network.links[sibling_id].to_node;
                        let Some(adj) =
                            self.network.nodes[sibling].escape_path
                        else {
                            continue;
                        };
                        let adj_channel = self.network.links[adj].channel;
                        if curr_channel.local_lid == adj_channel.local_lid
                            && curr_channel.remote_lid
                                != adj_channel.remote_lid
                        {
                            let adj_ccdg =
                                self.network.links[adj].ccdg_node;
                            self.ccdg.set_escape_edge(rev_curr, adj_ccdg);
                        }
                    }
                }

                curr_link = Some(next);
            }
        }

        // Turns through the tree root.
        for &curr in &into_central {
            for &next in &into_central {
                if curr == next {
                    continue;
                }
                let curr_ccdg = self.network.links[curr].ccdg_node;
                let rev_next = self.ccdg.node_by_channel
                    [&self.network.links[next].channel.inverted()];
                self.ccdg.set_escape_node(curr_ccdg);
                self.ccdg.set_escape_node(rev_next);
                self.ccdg.set_escape_edge(curr_ccdg, rev_next);
            }
        }

        Ok(())
    }
}

// ===== cycle-safe promotion =====

impl NueEngine {
    // Search within one colored subgraph for a directed path from
    // `source` to `target`; finding one means the candidate edge would
    // close a cycle.
    fn found_path_in_subgraph(&mut self, source: CcdgId, target: CcdgId) -> bool {
        let mut visited = BTreeSet::new();
        let mut stack = vec![source];
        visited.insert(source);

        while let Some(curr) = stack.pop() {
            for edge_pos in 0..self.ccdg.nodes[curr].edges.len() {
                if self.ccdg.edge_color(curr, edge_pos) <= UNUSED {
                    continue;
                }
                let to = self.ccdg.nodes[curr].edges[edge_pos].to;
                if to == target {
                    return true;
                }
                if visited.insert(to) {
                    stack.push(to);
                }
            }
        }
        false
    }

    // Cycle-Safe Promotion: accept the edge into the current color's
    // subgraph, merge a foreign subgraph, or reject (and block) an edge
    // that would close a cycle.
    fn using_edge_induces_cycle(
        &mut self,
        head: CcdgId,
        edge_pos: usize,
        color: usize,
    ) -> bool {
        let tail = self.ccdg.nodes[head].edges[edge_pos].to;

        if self.ccdg.edge_color(head, edge_pos) > UNUSED {
            // Already part of the subgraph.
            return false;
        }

        let tail_color = self.ccdg.node_color(tail);
        if tail_color == color {
            if self.found_path_in_subgraph(tail, head) {
                self.ccdg.block_edge(head, edge_pos);
                true
            } else {
                self.ccdg.add_edge_to_subgraph(head, edge_pos);
                false
            }
        } else if tail_color == UNUSED {
            self.ccdg.add_node_to_subgraph(head, edge_pos);
            false
        } else {
            self.ccdg.merge_subgraphs(head, edge_pos);
            false
        }
    }
}

// ===== modified Dijkstra on the cCDG =====

impl NueEngine {
    // Routes one destination LID: a Dijkstra run on the cCDG with
    // cycle-safe promotion, shortcut discovery after backtracking, and
    // escape-path fallback on an unsolvable impasse. Returns whether
    // the escape fallback was taken.
    fn route_on_ccdg(
        &mut self,
        subnet: &Subnet,
        dlid: Lid,
        color: usize,
    ) -> Result<bool, Error> {
        let mut fallback = false;

        self.network.reset_dijkstra_state();
        while self.ccdg.colors.len() <= color {
            let real_col = self.ccdg.colors.len();
            self.ccdg.colors.push(Color { real_col });
        }

        let Some(front_lid) = front_switch_lid(subnet, dlid) else {
            return Err(Error::Unreachable(dlid));
        };
        let Some(source) = self.network.node_by_lid(front_lid.0) else {
            return Err(Error::Unreachable(dlid));
        };
        let dest_is_switch = front_lid == dlid;

        self.network.nodes[source].distance = 0;
        self.network.nodes[source].hops =
            if dest_is_switch { 0 } else { 1 };
        let mut num_found = 1usize;

        let source_ccdg =
            self.ccdg.node_by_channel[&Channel::fake(front_lid.0)];
        self.ccdg.change_fake_node_color(source_ccdg, color);
        self.ccdg.nodes[source_ccdg].distance = 0;

        let mut heap: BinaryHeap<Reverse<(u64, CcdgId)>> = BinaryHeap::new();
        let mut last_backtracking_step = 0i32;
        let mut curr = Some(source_ccdg);

        while let Some(curr_node) = curr {
            let num_edges = self.ccdg.nodes[curr_node].edges.len();

            // Two passes over the outgoing turns: first the already
            // colored dependencies, then the unused ones.
            for pass in 0..2 {
                for edge_pos in 0..num_edges {
                    let edge_color = self.ccdg.edge_color(curr_node, edge_pos);
                    match pass {
                        0 if edge_color < ESCAPE_PATH => continue,
                        1 if edge_color != UNUSED => continue,
                        _ => (),
                    }

                    let next_node = self.ccdg.nodes[curr_node].edges[edge_pos].to;
                    let Some(next_link) = self.ccdg.nodes[next_node].netw_link
                    else {
                        continue;
                    };
                    let netw_node = self.network.links[next_link].to_node;
                    let new_distance = self.ccdg.nodes[curr_node]
                        .distance
                        .saturating_add(self.network.links[next_link].weight);

                    if new_distance < self.network.nodes[netw_node].distance {
                        if self.using_edge_induces_cycle(
                            curr_node, edge_pos, color,
                        ) {
                            continue;
                        }

                        let prior_link = self.network.nodes[netw_node].used_link;
                        if last_backtracking_step != 0
                            && prior_link.is_some()
                            && last_backtracking_step
                                != self.network.nodes[netw_node]
                                    .found_after_backtracking_step
                        {
                            // Nodes discovered before backtracking may
                            // only be improved through a verified
                            // shortcut.
                            if !self.attempt_shortcut_discovery(
                                netw_node, next_node, color,
                            ) {
                                continue;
                            }
                        } else {
                            if let Some(old_link) = prior_link {
                                // Superseded path: uncolor the turn
                                // that led into the old channel.
                                let old_ccdg =
                                    self.network.links[old_link].ccdg_node;
                                let parent_lid = self.ccdg.nodes[old_ccdg]
                                    .channel
                                    .local_lid;
                                let parent =
                                    self.network.node_by_lid[&parent_lid];
                                let pre_old = match self.network.nodes[parent]
                                    .used_link
                                {
                                    Some(pre_link) => {
                                        self.network.links[pre_link].ccdg_node
                                    }
                                    None => source_ccdg,
                                };
                                self.ccdg.reset_edge_color_between(
                                    pre_old, old_ccdg,
                                );
                            } else {
                                num_found += 1;
                                self.network.nodes[netw_node]
                                    .found_after_backtracking_step =
                                    last_backtracking_step;
                            }

                            self.ccdg.nodes[next_node].distance = new_distance;
                            heap.push(Reverse((new_distance, next_node)));
                        }

                        self.network.nodes[netw_node].distance = new_distance;
                        self.network.nodes[netw_node].used_link =
                            Some(next_link);
                        self.network.nodes[netw_node].hops =
                            if curr_node == source_ccdg {
                                self.network.nodes[source].hops + 1
                            } else {
                                let via = self.ccdg.nodes[curr_node]
                                    .netw_link
                                    .map(|link_id| {
                                        self.network.links[link_id].to_node
                                    })
                                    .unwrap_or(source);
                                self.network.nodes[via].hops + 1
                            };
                    } else if self.ccdg.edge_color(curr_node, edge_pos)
                        > UNUSED
                    {
                        if last_backtracking_step != 0
                            && self.network.nodes[netw_node].used_link.is_some()
                        {
                            continue;
                        }
                        // Remember alternate colored channels for the
                        // backtracking step.
                        self.ccdg.nodes[next_node].distance = new_distance;
                        let stack =
                            &mut self.network.nodes[netw_node].stack_used_links;
                        if !stack.contains(&next_link) {
                            stack.push(next_link);
                        }
                    }
                }
            }

            // Pop the closest valid channel; entries whose network node
            // moved to a better channel are stale.
            curr = None;
            while let Some(Reverse((_, cand))) = heap.pop() {
                let Some(link_id) = self.ccdg.nodes[cand].netw_link else {
                    continue;
                };
                let netw_node = self.network.links[link_id].to_node;
                if self.network.nodes[netw_node].used_link == Some(link_id) {
                    curr = Some(cand);
                    break;
                }
            }

            if curr.is_none() && num_found != self.network.nodes.len() {
                match self.attempt_local_backtracking(source, color) {
                    Some(found) => {
                        Debug::NueLocalBacktrack(dlid).log();
                        num_found += 1;
                        last_backtracking_step += 1;
                        curr = Some(found);
                    }
                    None => {
                        Debug::NueEscapeFallback(dlid).log();
                        self.use_escape_paths(source);
                        fallback = true;
                        last_backtracking_step = 0;
                    }
                }
            }
        }

        self.fix_ccdg_colors(source, source_ccdg);
        Ok(fallback)
    }

    // Local backtracking: for an unreached node U and a reached
    // neighbor A, try the alternate channels stacked on A. A candidate
    // X->A is viable when the consecutive dependencies W->X->A and
    // X->A->U all pass cycle-safe promotion and none of A's dependent
    // consumers is cut off.
    fn attempt_local_backtracking(
        &mut self,
        source: NodeId,
        color: usize,
    ) -> Option<CcdgId> {
        let num_nodes = self.network.nodes.len();

        for unreachable in 0..num_nodes {
            if self.network.nodes[unreachable].distance != INFINITY {
                continue;
            }

            // (link U->A, stacked channel X->A) pairs.
            let mut candidates: Vec<(LinkId, CcdgId)> = Vec::new();
            for pos in 0..self.network.nodes[unreachable].links.len() {
                let link_to_adj = self.network.nodes[unreachable].links[pos];
                let adj = self.network.links[link_to_adj].to_node;
                if self.network.nodes[adj].distance == INFINITY {
                    continue;
                }

                // Channels that currently receive traffic from A.
                let mut depended: Vec<CcdgId> = Vec::new();
                for dep_pos in 0..self.network.nodes[adj].links.len() {
                    let dep_link = self.network.nodes[adj].links[dep_pos];
                    let consumer = self.network.links[dep_link].to_node;
                    let Some(used) = self.network.nodes[consumer].used_link
                    else {
                        continue;
                    };
                    if self.network.links[used].channel.local_lid
                        == self.network.nodes[adj].lid
                    {
                        depended.push(self.network.links[used].ccdg_node);
                    }
                }

                for stack_pos in
                    0..self.network.nodes[adj].stack_used_links.len()
                {
                    let stacked =
                        self.network.nodes[adj].stack_used_links[stack_pos];
                    let stacked_ccdg = self.network.links[stacked].ccdg_node;

                    let viable = depended.iter().all(|&dep| {
                        let stacked_channel =
                            self.ccdg.nodes[stacked_ccdg].channel;
                        let dep_channel = self.ccdg.nodes[dep].channel;
                        if stacked_channel.is_reverse_of(&dep_channel) {
                            return false;
                        }
                        match self.ccdg.edge_between(stacked_ccdg, dep) {
                            Some(edge_pos) => {
                                self.ccdg.edge_color(stacked_ccdg, edge_pos)
                                    >= ESCAPE_PATH
                            }
                            None => false,
                        }
                    });
                    if viable {
                        candidates.push((link_to_adj, stacked_ccdg));
                    }
                }
            }

            if candidates.is_empty() {
                continue;
            }
            candidates.sort_by_key(|&(_, ccdg_node)| {
                (self.ccdg.nodes[ccdg_node].distance, ccdg_node)
            });

            let mut new_channel: Option<CcdgId> = None;
            for (link_to_adj, pre_ccdg) in candidates {
                let into_unreachable_channel = self.network.links
                    [link_to_adj]
                    .channel
                    .inverted();
                let ccdg_node =
                    self.ccdg.node_by_channel[&into_unreachable_channel];

                // X->A->U must not be blocked.
                match self.ccdg.edge_between(pre_ccdg, ccdg_node) {
                    Some(edge_pos) => {
                        if self.ccdg.edge_color(pre_ccdg, edge_pos) == BLOCKED {
                            continue;
                        }
                    }
                    None => continue,
                }

                let pre_lid = self.ccdg.nodes[pre_ccdg].channel.local_lid;
                let pre_node = self.network.node_by_lid[&pre_lid];
                if pre_node == source {
                    continue;
                }
                let Some(pre_used) = self.network.nodes[pre_node].used_link
                else {
                    continue;
                };
                let pre_pre_ccdg = self.network.links[pre_used].ccdg_node;

                let pre_channel = self.ccdg.nodes[pre_ccdg].channel;
                let pre_pre_channel = self.ccdg.nodes[pre_pre_ccdg].channel;
                if pre_channel.is_reverse_of(&pre_pre_channel) {
                    continue;
                }

                let Some(pre_edge_pos) =
                    self.ccdg.edge_between(pre_pre_ccdg, pre_ccdg)
                else {
                    continue;
                };
                if self.ccdg.edge_color(pre_pre_ccdg, pre_edge_pos) == BLOCKED {
                    continue;
                }

                let was_wet_before =
                    self.ccdg.nodes[pre_pre_ccdg].edges[pre_edge_pos].wet_paint;
                if self.using_edge_induces_cycle(
                    pre_pre_ccdg,
                    pre_edge_pos,
                    color,
                ) {
                    continue;
                }

                let Some(edge_pos) =
                    self.ccdg.edge_between(pre_ccdg, ccdg_node)
                else {
                    continue;
                };
                if self.using_edge_induces_cycle(pre_ccdg, edge_pos, color) {
                    if !was_wet_before {
                        self.ccdg.reset_edge_color(pre_pre_ccdg, pre_edge_pos);
                    }
                    continue;
                }

                // Real channels always carry their network link; a
                // fake vertex here means the candidate bookkeeping went
                // wrong, so drop the candidate and keep searching.
                let (Some(link_into_unreachable), Some(pre_link)) = (
                    self.ccdg.nodes[ccdg_node].netw_link,
                    self.ccdg.nodes[pre_ccdg].netw_link,
                ) else {
                    debug_assert!(false, "fake channel as backtracking candidate");
                    Error::InvariantViolated(
                        "fake channel as backtracking candidate",
                    )
                    .log();
                    continue;
                };
                if new_channel.is_none() {
                    self.ccdg.nodes[ccdg_node].distance = self.ccdg.nodes
                        [pre_ccdg]
                        .distance
                        .saturating_add(
                            self.network.links[link_into_unreachable].weight,
                        );
                    self.network.nodes[unreachable].used_link =
                        Some(link_into_unreachable);
                    self.network.nodes[unreachable].distance =
                        self.ccdg.nodes[ccdg_node].distance;

                    let adj = self.network.links[link_to_adj].to_node;
                    self.network.nodes[adj].used_link = Some(pre_link);
                    self.network.nodes[adj].distance =
                        self.ccdg.nodes[pre_ccdg].distance;

                    new_channel = Some(ccdg_node);
                } else {
                    self.ccdg.nodes[ccdg_node].distance = self.ccdg.nodes
                        [pre_ccdg]
                        .distance
                        .saturating_add(
                            self.network.links[link_into_unreachable].weight,
                        );
                    let stack = &mut self.network.nodes[unreachable]
                        .stack_used_links;
                    if !stack.contains(&link_into_unreachable) {
                        stack.push(link_into_unreachable);
                    }
                }
            }

            if new_channel.is_some() {
                return new_channel;
            }
        }

        None
    }

    // Shortcut check: the improved channel may only replace the old one
    // if every dependent turn out of it can be recolored without
    // closing a cycle. On rejection only the wet paint is reverted;
    // BLOCKED marks stay.
    fn attempt_shortcut_discovery(
        &mut self,
        shortcut_node: NodeId,
        shortcut_ccdg: CcdgId,
        color: usize,
    ) -> bool {
        // The caller only probes shortcuts for nodes that were already
        // routed; without a used link there is nothing to shorten.
        let Some(old_link) = self.network.nodes[shortcut_node].used_link
        else {
            debug_assert!(false, "shortcut probe for an unrouted node");
            Error::InvariantViolated("shortcut probe for an unrouted node")
                .log();
            return false;
        };
        let old_ccdg = self.network.links[old_link].ccdg_node;
        if old_ccdg == shortcut_ccdg {
            return false;
        }

        let parent_lid = self.ccdg.nodes[old_ccdg].channel.local_lid;
        let parent = self.network.node_by_lid[&parent_lid];
        let pre_old_ccdg = match self.network.nodes[parent].used_link {
            Some(pre_link) => self.network.links[pre_link].ccdg_node,
            None => self.ccdg.node_by_channel[&Channel::fake(parent_lid)],
        };

        // Turns the shortcut channel must be able to serve: every
        // downstream consumer currently fed through this node.
        let mut dependent_edges: Vec<usize> = Vec::new();
        for pos in 0..self.network.nodes[shortcut_node].links.len() {
            let link_id = self.network.nodes[shortcut_node].links[pos];
            let consumer = self.network.links[link_id].to_node;
            let Some(used) = self.network.nodes[consumer].used_link else {
                continue;
            };
            if self.network.links[used].channel.local_lid
                == self.network.nodes[shortcut_node].lid
            {
                let used_ccdg = self.network.links[used].ccdg_node;
                if let Some(edge_pos) =
                    self.ccdg.edge_between(shortcut_ccdg, used_ccdg)
                {
                    dependent_edges.push(edge_pos);
                }
            }
        }

        let was_wet_before = dependent_edges
            .iter()
            .map(|&edge_pos| {
                self.ccdg.nodes[shortcut_ccdg].edges[edge_pos].wet_paint
            })
            .collect::<Vec<_>>();

        let mut valid_shortcut = true;
        let mut break_point = dependent_edges.len();
        for (i, &edge_pos) in dependent_edges.iter().enumerate() {
            if self.ccdg.edge_color(shortcut_ccdg, edge_pos) == BLOCKED {
                valid_shortcut = false;
                break_point = i;
                break;
            }
            if self.using_edge_induces_cycle(shortcut_ccdg, edge_pos, color) {
                valid_shortcut = false;
                break_point = i;
                break;
            }
        }

        if valid_shortcut {
            // The dependencies of the superseded path are reverted.
            self.ccdg.reset_edge_color_between(pre_old_ccdg, old_ccdg);
            for &edge_pos in &dependent_edges {
                let to = self.ccdg.nodes[shortcut_ccdg].edges[edge_pos].to;
                self.ccdg.reset_edge_color_between(old_ccdg, to);
            }
        } else {
            for i in 0..break_point {
                let edge_pos = dependent_edges[i];
                if self.ccdg.edge_color(shortcut_ccdg, edge_pos) != BLOCKED
                    && !was_wet_before[i]
                {
                    self.ccdg.reset_edge_color(shortcut_ccdg, edge_pos);
                }
            }
        }

        valid_shortcut
    }

    // Copies the escape spanning tree into the used links, reversing
    // the orientation between the destination's switch and the tree
    // root.
    fn use_escape_paths(&mut self, source: NodeId) {
        for node_id in 0..self.network.nodes.len() {
            self.network.nodes[node_id].used_link =
                self.network.nodes[node_id].escape_path;
        }

        let mut node_id = source;
        let mut curr_link = self.network.nodes[node_id].used_link.take();
        while let Some(curr) = curr_link {
            let parent = self.network.node_by_lid
                [&self.network.links[curr].channel.local_lid];
            let reverse_channel = self.network.links[curr].channel.inverted();
            let reverse_link = self.network.nodes[node_id]
                .links
                .iter()
                .copied()
                .find(|&link_id| {
                    self.network.links[link_id].channel == reverse_channel
                });

            curr_link = self.network.nodes[parent].used_link;
            self.network.nodes[parent].used_link = reverse_link;
            node_id = parent;
        }

        // The Dijkstra hop counters no longer match the rewired routes.
        let base_hops = self.network.nodes[source].hops;
        for node_id in 0..self.network.nodes.len() {
            if node_id == source {
                continue;
            }
            let mut hops = 0u8;
            let mut curr = node_id;
            let mut guard = self.network.nodes.len() + 1;
            while curr != source && guard > 0 {
                guard -= 1;
                let Some(used) = self.network.nodes[curr].used_link else {
                    break;
                };
                hops = hops.saturating_add(1);
                curr = self.network.node_by_lid
                    [&self.network.links[used].channel.local_lid];
            }
            self.network.nodes[node_id].hops = base_hops.saturating_add(hops);
        }
    }

    // Color fixing after one destination: dry the colors on the used
    // route, wash off every other wet mark, and collapse the real_col
    // chains.
    fn fix_ccdg_colors(&mut self, source: NodeId, source_ccdg: CcdgId) {
        for node_id in 0..self.network.nodes.len() {
            let Some(used) = self.network.nodes[node_id].used_link else {
                continue;
            };
            let ccdg_node = self.network.links[used].ccdg_node;
            self.ccdg.nodes[ccdg_node].wet_paint = false;

            let parent_lid = self.ccdg.nodes[ccdg_node].channel.local_lid;
            let parent = self.network.node_by_lid[&parent_lid];
            let pre_ccdg = if parent == source {
                source_ccdg
            } else {
                match self.network.nodes[parent].used_link {
                    Some(pre_link) => self.network.links[pre_link].ccdg_node,
                    None => continue,
                }
            };
            if let Some(edge_pos) = self.ccdg.edge_between(pre_ccdg, ccdg_node)
            {
                self.ccdg.nodes[pre_ccdg].edges[edge_pos].wet_paint = false;
            }
        }

        for node_id in 0..self.ccdg.nodes.len() {
            if self.ccdg.nodes[node_id].wet_paint {
                self.ccdg.nodes[node_id].color = UNUSED;
                self.ccdg.nodes[node_id].wet_paint = false;
            }
            for edge_pos in 0..self.ccdg.nodes[node_id].edges.len() {
                self.ccdg.reset_edge_color(node_id, edge_pos);
                let entry = self.ccdg.nodes[node_id].edges[edge_pos].color;
                self.ccdg.nodes[node_id].edges[edge_pos].color =
                    self.ccdg.colors[entry].real_col;
            }
            let entry = self.ccdg.nodes[node_id].color;
            self.ccdg.nodes[node_id].color = self.ccdg.colors[entry].real_col;
        }
    }
}

// ===== table updates and weights =====

impl NueEngine {
    fn init_linear_forwarding_tables(&self, subnet: &mut Subnet) {
        for node in self.network.nodes.iter() {
            let sw_idx = node.sw_idx;
            let node_idx = node.node_idx;
            let endports = subnet.nodes[node_idx].endports.clone();
            for port_idx in endports {
                let Some((min_lid, max_lid)) =
                    subnet.ports[port_idx].lid_range()
                else {
                    continue;
                };
                if subnet.ports[port_idx].port_num != 0 {
                    continue;
                }
                for lid in min_lid.0..=max_lid.0 {
                    let lid = Lid(lid);
                    if let Err(error) =
                        subnet.switches[sw_idx].set_new_lft(lid, 0)
                    {
                        error.log();
                    }
                    if let Err(error) =
                        subnet.switches[sw_idx].set_hops(lid, 0, 0)
                    {
                        error.log();
                    }
                }
            }
        }
    }

    // Writes the routes of the last Dijkstra run into the new-LFT
    // buffers.
    fn update_linear_forwarding_tables(
        &self,
        subnet: &mut Subnet,
        dlid: Lid,
        dest_is_switch: bool,
        edge_port: Option<u8>,
        config: &SmConfig,
    ) {
        for node in self.network.nodes.iter() {
            let exit_port = match node.used_link {
                Some(used) => self.network.links[used].channel.remote_port,
                None => {
                    // Only the destination's fronting switch has no
                    // used link; its route to a terminal leaves through
                    // the edge port.
                    if dest_is_switch {
                        continue;
                    }
                    let Some(edge_port) = edge_port else {
                        continue;
                    };
                    edge_port
                }
            };

            let sw = &mut subnet.switches[node.sw_idx];
            if let Err(error) = sw.set_new_lft(dlid, exit_port) {
                error.log();
            }
            let counted = !dest_is_switch || config.port_profile_switch_nodes;
            if counted {
                sw.count_path(exit_port);
            }
            if let Err(error) = sw.set_hops(dlid, exit_port, node.hops) {
                error.log();
            }
        }
    }

    // Raises the weight of every link on the used routes by the number
    // of terminals whose traffic it will now carry, steering later
    // destinations away from the congested links.
    fn update_network_link_weights(&mut self, desti_lid: u16) {
        for node_id in 0..self.network.nodes.len() {
            if self.network.nodes[node_id].lid == desti_lid {
                continue;
            }
            let additional = self.network.nodes[node_id].num_terminals;
            let mut curr_lid = self.network.nodes[node_id].lid;
            let mut guard = self.network.nodes.len() + 1;
            while curr_lid != desti_lid && guard > 0 {
                guard -= 1;
                let curr = self.network.node_by_lid[&curr_lid];
                let Some(used) = self.network.nodes[curr].used_link else {
                    break;
                };
                self.network.links[used].weight = self.network.links[used]
                    .weight
                    .saturating_add(additional);
                curr_lid = self.network.links[used].channel.local_lid;
            }
        }
    }
}

// ===== main routing loop =====

impl NueEngine {
    fn do_ucast_routing(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error> {
        let include_switches = config.nue_include_switches;

        self.init_linear_forwarding_tables(subnet);
        self.dlid_to_vl.clear();
        self.escape_fallbacks.clear();
        self.distribute_lids(subnet, include_switches);

        #[cfg(debug_assertions)]
        let mut audit = CdgAudit::default();

        for vl in 0..self.max_vl {
            let destinations = self.destinations[vl as usize].clone();
            if destinations.is_empty() {
                continue;
            }

            let num_colors = ESCAPE_PATH + 1 + destinations.len() * 8;
            self.ccdg.reset_color_array(num_colors);
            self.mark_escape_paths(&destinations, subnet, vl == 0)?;

            #[cfg(debug_assertions)]
            audit.reset();

            let mut color = ESCAPE_PATH + 1;
            // CAs first, then switches, within one VL.
            for process_sw in [false, true] {
                for &base_dlid in &destinations {
                    let Some(port_idx) = subnet.port_by_lid(Lid(base_dlid))
                    else {
                        continue;
                    };
                    let port = &subnet.ports[port_idx];
                    let dest_is_switch =
                        subnet.nodes[port.node_idx].is_switch();
                    if dest_is_switch != process_sw {
                        continue;
                    }
                    let edge_port = (!dest_is_switch)
                        .then(|| {
                            subnet
                                .remote_of(port.node_idx, port.port_num)
                                .map(|(_, remote_port)| remote_port)
                        })
                        .flatten();
                    let Some((min_lid, max_lid)) = port.lid_range() else {
                        continue;
                    };

                    for lid in min_lid.0..=max_lid.0 {
                        let dlid = Lid(lid);
                        let fallback =
                            self.route_on_ccdg(subnet, dlid, color)?;
                        color += 1;
                        if fallback {
                            self.escape_fallbacks.insert(lid);
                        }

                        #[cfg(debug_assertions)]
                        {
                            audit.add_routes(self, subnet, dlid);
                            debug_assert!(
                                audit.is_cycle_free(),
                                "channel dependency cycle within VL {}",
                                vl
                            );
                        }

                        self.update_linear_forwarding_tables(
                            subnet,
                            dlid,
                            dest_is_switch,
                            edge_port,
                            config,
                        );
                        let front = front_switch_lid(subnet, dlid)
                            .unwrap_or(dlid);
                        self.update_network_link_weights(front.0);
                        self.dlid_to_vl.insert(lid, vl);
                    }
                }
                if !include_switches {
                    break;
                }
            }
        }

        // Switches excluded from the destination sets carry no real
        // data traffic; route them over plain spanning trees without
        // touching the cCDG.
        if !include_switches {
            for node_id in 0..self.network.nodes.len() {
                let node_lid = self.network.nodes[node_id].lid;
                let Some(port_idx) = subnet.port_by_lid(Lid(node_lid)) else {
                    continue;
                };
                let Some((min_lid, max_lid)) =
                    subnet.ports[port_idx].lid_range()
                else {
                    continue;
                };
                for lid in min_lid.0..=max_lid.0 {
                    let dlid = Lid(lid);
                    self.calculate_spanning_tree(node_id);
                    self.network.nodes[node_id].hops = 0;
                    self.use_escape_paths(node_id);
                    self.escape_fallbacks.insert(lid);
                    self.update_linear_forwarding_tables(
                        subnet, dlid, true, None, config,
                    );
                    self.update_network_link_weights(node_lid);
                    self.dlid_to_vl.insert(lid, 0);
                }
            }
        }

        Ok(())
    }
}

// ===== helper functions =====

// The LID of the switch fronting a destination: the destination itself
// for switches, the adjacent switch for terminals.
fn front_switch_lid(subnet: &Subnet, dlid: Lid) -> Option<Lid> {
    let port_idx = subnet.port_by_lid(dlid)?;
    let port = &subnet.ports[port_idx];
    let node = &subnet.nodes[port.node_idx];
    if node.is_switch() {
        return subnet.node_base_lid(port.node_idx);
    }
    let (remote_idx, _) = subnet.remote_of(port.node_idx, port.port_num)?;
    subnet.node_base_lid(remote_idx)
}

// ===== debug-only acyclicity audit =====

// Accumulates the channel dependencies of the actually-computed routes
// and checks them for directed cycles with a WHITE/GRAY/BLACK DFS.
#[cfg(debug_assertions)]
#[derive(Debug, Default)]
struct CdgAudit {
    edges: BTreeMap<Channel, BTreeSet<Channel>>,
}

#[cfg(debug_assertions)]
impl CdgAudit {
    fn reset(&mut self) {
        self.edges.clear();
    }

    fn add_routes(&mut self, engine: &NueEngine, subnet: &Subnet, dlid: Lid) {
        let Some(desti) = front_switch_lid(subnet, dlid) else {
            return;
        };
        for node in engine.network.nodes.iter() {
            if node.lid == desti.0 {
                continue;
            }
            let mut route = Vec::new();
            let mut curr_lid = node.lid;
            let mut guard = engine.network.nodes.len() + 1;
            while curr_lid != desti.0 && guard > 0 {
                guard -= 1;
                let Some(&curr) = engine.network.node_by_lid.get(&curr_lid)
                else {
                    break;
                };
                let Some(used) = engine.network.nodes[curr].used_link else {
                    break;
                };
                route.push(engine.network.links[used].channel);
                curr_lid = engine.network.links[used].channel.local_lid;
            }
            // The walk runs destination-ward in reverse; consecutive
            // pairs are channel dependencies.
            for pair in route.windows(2) {
                self.edges.entry(pair[1]).or_default().insert(pair[0]);
            }
        }
    }

    fn is_cycle_free(&self) -> bool {
        #[derive(Clone, Copy, Eq, PartialEq)]
        enum Status {
            White,
            Gray,
            Black,
        }

        let mut status: BTreeMap<Channel, Status> = self
            .edges
            .keys()
            .chain(self.edges.values().flatten())
            .map(|&channel| (channel, Status::White))
            .collect();
        let channels = status.keys().copied().collect::<Vec<_>>();

        for &start in &channels {
            if status[&start] != Status::White {
                continue;
            }
            // Iterative DFS with an explicit path stack.
            let mut stack = vec![(start, 0usize)];
            status.insert(start, Status::Gray);
            while let Some((curr, edge_pos)) = stack.pop() {
                let next = self
                    .edges
                    .get(&curr)
                    .and_then(|targets| targets.iter().nth(edge_pos).copied());
                match next {
                    Some(next) => {
                        stack.push((curr, edge_pos + 1));
                        match status[&next] {
                            Status::Gray => return false,
                            Status::White => {
                                status.insert(next, Status::Gray);
                                stack.push((next, 0));
                            }
                            Status::Black => (),
                        }
                    }
                    None => {
                        status.insert(curr, Status::Black);
                    }
                }
            }
        }
        true
    }
}
