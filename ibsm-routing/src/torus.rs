//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use ibsm_subnet::{NodeIndex, Subnet, SwitchIndex};
use smallvec::SmallVec;
use ibsm_utils::config::{SeedLink, SmConfig, TorusConfig, TorusSeed};
use ibsm_utils::ib::{Guid, Lid, NodeType};

use crate::RoutingEngine;
use crate::debug::Debug;
use crate::error::Error;

const DIMS: usize = 3;

// A canonical torus position: 0 <= coord[d] < radix[d].
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
struct Coord([usize; DIMS]);

// One traversal step: dimension plus ring direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Step {
    dim: usize,
    positive: bool,
}

#[derive(Debug)]
struct TorusSw {
    sw_idx: SwitchIndex,
    node_idx: NodeIndex,
    coord: Option<Coord>,
    // Egress ports per (dimension, direction); parallel links keep all
    // their ports for balancing.
    dir_ports: [[SmallVec<[u8; 2]>; 2]; DIMS],
}

// Routing engine for 2D/3D torus and mesh fabrics, with VL switching
// at the datelines to break the ring credit loops.
#[derive(Debug)]
pub struct TorusEngine {
    cfg: TorusConfig,
    radix: [usize; DIMS],
    mesh: [bool; DIMS],
    sws: Vec<TorusSw>,
    sw_by_guid: BTreeMap<Guid, usize>,
    sw_by_coord: BTreeMap<Coord, usize>,
    // Fronting-switch position per destination LID, kept across the
    // pass so path_sl stays answerable.
    coord_by_lid: BTreeMap<u16, Coord>,
}

// ===== impl Coord =====

impl Coord {
    fn canonicalize(values: [isize; DIMS], radix: &[usize; DIMS]) -> Coord {
        let mut coord = [0; DIMS];
        for dim in 0..DIMS {
            coord[dim] = values[dim].rem_euclid(radix[dim] as isize) as usize;
        }
        Coord(coord)
    }
}

// ===== impl TorusEngine =====

impl TorusEngine {
    pub fn setup(config: &SmConfig) -> Result<TorusEngine, Error> {
        let Some(cfg) = config.torus.clone() else {
            return Err(Error::MissingTorusConfig);
        };
        let radix = [cfg.x_sz.max(1), cfg.y_sz.max(1), cfg.z_sz.max(1)];
        let mesh = [cfg.x_mesh, cfg.y_mesh, cfg.z_mesh];
        Ok(TorusEngine {
            cfg,
            radix,
            mesh,
            sws: Vec::new(),
            sw_by_guid: BTreeMap::new(),
            sw_by_coord: BTreeMap::new(),
            coord_by_lid: BTreeMap::new(),
        })
    }

    // Ring distance and dateline crossing when moving from `from` to
    // `to` in one dimension, for each direction.
    fn ring_distance(&self, dim: usize, from: usize, to: usize) -> [usize; 2] {
        let radix = self.radix[dim];
        let positive = (to + radix - from) % radix;
        let negative = (from + radix - to) % radix;
        [negative, positive]
    }

    // The direction taken in `dim` between two positions, or None when
    // the dimension is already aligned. Ties break toward positive.
    fn choose_step(&self, dim: usize, from: usize, to: usize) -> Option<Step> {
        if from == to {
            return None;
        }
        if self.mesh[dim] {
            return Some(Step {
                dim,
                positive: to > from,
            });
        }
        let [negative, positive] = self.ring_distance(dim, from, to);
        Some(Step {
            dim,
            positive: positive <= negative,
        })
    }

    // Whether one traversal of `dim` from `from` to `to` wraps through
    // the dateline (the 0 boundary of the canonical coordinates).
    fn crosses_dateline(&self, dim: usize, from: usize, to: usize) -> bool {
        if self.mesh[dim] || from == to {
            return false;
        }
        let Some(step) = self.choose_step(dim, from, to) else {
            return false;
        };
        let [negative, positive] = self.ring_distance(dim, from, to);
        if step.positive {
            from + positive >= self.radix[dim]
        } else {
            from < negative
        }
    }

    // Inter-switch path length in hops.
    fn distance(&self, from: Coord, to: Coord) -> usize {
        (0..DIMS)
            .map(|dim| {
                let [negative, positive] =
                    self.ring_distance(dim, from.0[dim], to.0[dim]);
                if self.mesh[dim] {
                    let (from, to) = (from.0[dim], to.0[dim]);
                    from.abs_diff(to)
                } else {
                    negative.min(positive)
                }
            })
            .sum()
    }
}

impl RoutingEngine for TorusEngine {
    fn name(&self) -> &'static str {
        "torus-2QoS"
    }

    // Places every switch on the coordinate grid; the hop tables are
    // filled together with the LFTs during routing.
    fn build_hop_matrices(
        &mut self,
        subnet: &mut Subnet,
        _config: &SmConfig,
    ) -> Result<(), Error> {
        self.capture_fabric(subnet)?;
        self.assign_coordinates(subnet)?;
        Ok(())
    }

    fn build_ucast_tables(
        &mut self,
        subnet: &mut Subnet,
        _config: &SmConfig,
    ) -> Result<(), Error> {
        if self.sw_by_coord.is_empty() {
            return Err(Error::Unsupported);
        }
        self.route_all(subnet)
    }

    // SL for the path: one bit per dimension whose dateline the path
    // crosses, QoS bit passed through from the hint.
    fn path_sl(&self, hint_sl: u8, slid: Lid, dlid: Lid) -> u8 {
        let qos = hint_sl & 0x8;
        let (Some(src), Some(dst)) = (
            self.coord_by_lid.get(&slid.0),
            self.coord_by_lid.get(&dlid.0),
        ) else {
            return qos;
        };

        let mut sl = qos;
        for dim in 0..DIMS {
            if self.crosses_dateline(dim, src.0[dim], dst.0[dim]) {
                sl |= 1 << dim;
            }
        }
        sl
    }
}

// ===== impl TorusEngine (fabric capture and coordinates) =====

impl TorusEngine {
    fn capture_fabric(&mut self, subnet: &Subnet) -> Result<(), Error> {
        self.sws.clear();
        self.sw_by_guid.clear();
        self.sw_by_coord.clear();
        self.coord_by_lid.clear();

        for sw_idx in subnet.switch_indexes() {
            let sw = &subnet.switches[sw_idx];
            if subnet.switch_base_lid(sw_idx).is_none() {
                return Err(Error::CoordAssignment(sw.guid));
            }
            self.sw_by_guid.insert(sw.guid, self.sws.len());
            self.sws.push(TorusSw {
                sw_idx,
                node_idx: sw.node_idx,
                coord: None,
                dir_ports: Default::default(),
            });
        }
        Ok(())
    }

    // Seeds the origin from the configured coordinate links, then
    // propagates positions by ring and face completion until the grid
    // is full.
    fn assign_coordinates(&mut self, subnet: &Subnet) -> Result<(), Error> {
        self.place_seed(subnet)?;

        // Fixpoint propagation. Each round tries to place every
        // unplaced switch from the positions of its placed neighbors;
        // ambiguous candidates (radix-4 rings, incomplete faces) are
        // deferred to a later round.
        let mut progress = true;
        while progress {
            progress = false;
            for sw in 0..self.sws.len() {
                if self.sws[sw].coord.is_some() {
                    continue;
                }
                if let Some(coord) = self.infer_position(subnet, sw) {
                    self.place(subnet, sw, coord);
                    progress = true;
                }
            }
        }

        if let Some(unplaced) =
            self.sws.iter().find(|entry| entry.coord.is_none())
        {
            let guid = subnet.switches[unplaced.sw_idx].guid;
            return Err(Error::CoordAssignment(guid));
        }

        // Record every switch's egress ports per direction now that all
        // positions are known.
        for sw in 0..self.sws.len() {
            self.collect_dir_ports(subnet, sw);
        }

        Ok(())
    }

    fn place_seed(&mut self, subnet: &Subnet) -> Result<(), Error> {
        let seeds = self.cfg.seeds.clone();
        for seed in &seeds {
            if self.try_seed(subnet, seed).is_ok() {
                return Ok(());
            }
        }
        Err(Error::MissingTorusConfig)
    }

    fn try_seed(
        &mut self,
        subnet: &Subnet,
        seed: &TorusSeed,
    ) -> Result<(), Error> {
        let links: [(usize, bool, &Option<SeedLink>); 6] = [
            (0, true, &seed.xp_link),
            (0, false, &seed.xm_link),
            (1, true, &seed.yp_link),
            (1, false, &seed.ym_link),
            (2, true, &seed.zp_link),
            (2, false, &seed.zm_link),
        ];

        // The shared switch sits opposite the dateline offsets.
        let origin = Coord::canonicalize(
            [
                -seed.x_dateline,
                -seed.y_dateline,
                -seed.z_dateline,
            ],
            &self.radix,
        );

        let mut placed = Vec::new();
        for (dim, positive, link) in links {
            let Some(link) = link else {
                continue;
            };
            let (Some(&near), Some(&far)) = (
                self.sw_by_guid.get(&link.near),
                self.sw_by_guid.get(&link.far),
            ) else {
                return Err(Error::BadSeedLink(link.near, link.far));
            };
            if !self.are_linked(subnet, near, far) {
                return Err(Error::BadSeedLink(link.near, link.far));
            }
            let coord = self.step_coord(origin, dim, positive);
            placed.push((near, origin));
            placed.push((far, coord));
        }
        if placed.is_empty() {
            return Err(Error::MissingTorusConfig);
        }

        for (sw, coord) in placed {
            if self.sws[sw].coord.is_none() {
                self.place(subnet, sw, coord);
            }
        }
        Ok(())
    }

    fn place(&mut self, subnet: &Subnet, sw: usize, coord: Coord) {
        self.sws[sw].coord = Some(coord);
        self.sw_by_coord.insert(coord, sw);
        let guid = subnet.switches[self.sws[sw].sw_idx].guid;
        Debug::TorusCoordinate(guid, (coord.0[0], coord.0[1], coord.0[2]))
            .log();
    }

    fn step_coord(&self, from: Coord, dim: usize, positive: bool) -> Coord {
        let mut values = [0isize; DIMS];
        for d in 0..DIMS {
            values[d] = from.0[d] as isize;
        }
        values[dim] += if positive { 1 } else { -1 };
        Coord::canonicalize(values, &self.radix)
    }

    fn are_linked(&self, subnet: &Subnet, a: usize, b: usize) -> bool {
        let node_idx = self.sws[a].node_idx;
        let node = &subnet.nodes[node_idx];
        node.data_ports().any(|physp| {
            subnet
                .remote_of(node_idx, physp.port_num)
                .is_some_and(|(remote_idx, _)| {
                    remote_idx == self.sws[b].node_idx
                })
        })
    }

    // Neighbor switches (by fabric position) of one torus switch.
    fn neighbors(&self, subnet: &Subnet, sw: usize) -> Vec<usize> {
        let node_idx = self.sws[sw].node_idx;
        let node = &subnet.nodes[node_idx];
        let mut neighbors = Vec::new();
        for physp in node.data_ports() {
            let Some((remote_idx, _)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            let remote = &subnet.nodes[remote_idx];
            if remote.node_type != NodeType::Switch {
                continue;
            }
            if let Some(&remote_sw) = self.sw_by_guid.get(&remote.guid)
                && !neighbors.contains(&remote_sw)
            {
                neighbors.push(remote_sw);
            }
        }
        neighbors
    }

    // Tries to pin down an unplaced switch from its placed neighbors.
    //
    // A position is accepted when it is implied by a face (two placed
    // neighbors on diagonal corners of a 4-cycle) or by a ring segment
    // (two placed neighbors two steps apart in one dimension), and the
    // implied slot is free. Radix-4 rings produce two candidate slots
    // for the same witness pair, so a candidate is only accepted once
    // every witness pair agrees on a single free slot.
    fn infer_position(&self, subnet: &Subnet, sw: usize) -> Option<Coord> {
        let neighbors = self.neighbors(subnet, sw);
        let placed = neighbors
            .iter()
            .filter_map(|&neighbor| self.sws[neighbor].coord)
            .collect::<Vec<_>>();
        if placed.is_empty() {
            return None;
        }

        let mut candidates: Vec<Coord> = Vec::new();
        for (pos, &b) in placed.iter().enumerate() {
            // All slots adjacent to neighbor `b`.
            for dim in 0..DIMS {
                for positive in [false, true] {
                    if self.mesh[dim] {
                        let at_edge = if positive {
                            b.0[dim] + 1 >= self.radix[dim]
                        } else {
                            b.0[dim] == 0
                        };
                        if at_edge {
                            continue;
                        }
                    } else if self.radix[dim] < 3 && positive {
                        // Radix-2 rings: both directions land on the
                        // same slot.
                        continue;
                    }
                    let slot = self.step_coord(b, dim, positive);
                    if self.sw_by_coord.contains_key(&slot) {
                        continue;
                    }
                    // The slot must be adjacent to every other placed
                    // witness as well.
                    if placed
                        .iter()
                        .enumerate()
                        .filter(|&(other, _)| other != pos)
                        .all(|(_, &w)| self.distance(slot, w) == 1)
                        && !candidates.contains(&slot)
                    {
                        candidates.push(slot);
                    }
                }
            }
        }

        // With a single placed witness any adjacent free slot would fit,
        // which is only unambiguous when exactly one slot survives.
        // This is what makes radix-4 rings safe: until the face around
        // the candidate is complete enough, two slots survive and the
        // placement is deferred.
        match candidates.as_slice() {
            [coord] => Some(*coord),
            _ => None,
        }
    }

    fn collect_dir_ports(&mut self, subnet: &Subnet, sw: usize) {
        let Some(coord) = self.sws[sw].coord else {
            return;
        };
        let node_idx = self.sws[sw].node_idx;
        let node = &subnet.nodes[node_idx];

        for physp in node.data_ports() {
            let Some((remote_idx, _)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            let remote = &subnet.nodes[remote_idx];
            if remote.node_type != NodeType::Switch {
                continue;
            }
            let Some(&remote_sw) = self.sw_by_guid.get(&remote.guid) else {
                continue;
            };
            let Some(remote_coord) = self.sws[remote_sw].coord else {
                continue;
            };

            for dim in 0..DIMS {
                for positive in [false, true] {
                    if self.step_coord(coord, dim, positive) == remote_coord
                        && remote_coord != coord
                    {
                        let dir = positive as usize;
                        self.sws[sw].dir_ports[dim][dir]
                            .push(physp.port_num);
                    }
                }
            }
        }
    }
}

// ===== impl TorusEngine (routing) =====

impl TorusEngine {
    // Routes every LID from every switch: dimensions are always
    // traversed in X, Y, Z order, taking the shorter way around each
    // ring, so any path crosses each dateline at most once.
    fn route_all(&mut self, subnet: &mut Subnet) -> Result<(), Error> {
        // Destination LIDs with their fronting switch and, for CAs, the
        // edge port on that switch.
        let mut targets: Vec<(Lid, usize, Option<u8>)> = Vec::new();
        for port_idx in subnet.port_indexes() {
            let port = &subnet.ports[port_idx];
            let Some((min_lid, max_lid)) = port.lid_range() else {
                continue;
            };
            let node = &subnet.nodes[port.node_idx];
            let (front_sw, edge_port) = if node.is_switch() {
                let Some(&sw) = self.sw_by_guid.get(&node.guid) else {
                    continue;
                };
                (sw, None)
            } else {
                let Some((remote_idx, remote_port)) =
                    subnet.remote_of(port.node_idx, port.port_num)
                else {
                    continue;
                };
                let remote = &subnet.nodes[remote_idx];
                let Some(&sw) = self.sw_by_guid.get(&remote.guid) else {
                    continue;
                };
                (sw, Some(remote_port))
            };
            for lid in min_lid.0..=max_lid.0 {
                targets.push((Lid(lid), front_sw, edge_port));
            }
        }

        for &(lid, front_sw, edge_port) in &targets {
            let front_coord = self.sws[front_sw].coord.unwrap_or_default();
            self.coord_by_lid.insert(lid.0, front_coord);

            for sw in 0..self.sws.len() {
                let coord = self.sws[sw].coord.unwrap_or_default();
                let sw_idx = self.sws[sw].sw_idx;

                let egress = if sw == front_sw {
                    match edge_port {
                        Some(port_num) => port_num,
                        // The switch's own LID terminates locally.
                        None => 0,
                    }
                } else {
                    let Some(step) = (0..DIMS).find_map(|dim| {
                        self.choose_step(
                            dim,
                            coord.0[dim],
                            front_coord.0[dim],
                        )
                    }) else {
                        continue;
                    };
                    let ports =
                        &self.sws[sw].dir_ports[step.dim][step.positive as usize];
                    if ports.is_empty() {
                        let guid = subnet.switches[sw_idx].guid;
                        return Err(Error::CoordAssignment(guid));
                    }
                    // Spread parallel links by destination LID.
                    ports[lid.0 as usize % ports.len()]
                };

                if let Err(error) =
                    subnet.switches[sw_idx].set_new_lft(lid, egress)
                {
                    error.log();
                }

                // Hop rows are tracked for switch LIDs, mirroring the
                // min-hop convention.
                if edge_port.is_none() && sw != front_sw {
                    let hops = self.distance(coord, front_coord) as u8;
                    if let Err(error) =
                        subnet.switches[sw_idx].set_hops(lid, egress, hops)
                    {
                        error.log();
                    }
                } else if edge_port.is_none() {
                    if let Err(error) =
                        subnet.switches[sw_idx].set_hops(lid, 0, 0)
                    {
                        error.log();
                    }
                }
            }
        }

        Ok(())
    }

    // Dateline crossings of the path between two routed LIDs, per
    // dimension. Exposed for auditing the VL discipline.
    pub fn path_crossings(&self, slid: Lid, dlid: Lid) -> [bool; DIMS] {
        let mut crossings = [false; DIMS];
        let (Some(src), Some(dst)) = (
            self.coord_by_lid.get(&slid.0),
            self.coord_by_lid.get(&dlid.0),
        ) else {
            return crossings;
        };
        for dim in 0..DIMS {
            crossings[dim] = self.crosses_dateline(dim, src.0[dim], dst.0[dim]);
        }
        crossings
    }
}
