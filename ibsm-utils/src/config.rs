//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::path::PathBuf;

use derive_new::new;
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use crate::ib::Guid;

// Unicast routing engine selector.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum RoutingAlgo {
    #[default]
    MinHop,
    FTree,
    Torus2Qos,
    Nue,
}

// SM-wide configuration surface.
//
// Parsing of configuration files is a collaborator concern; the routing
// core consumes this pre-validated struct.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct SmConfig {
    pub routing_engine: RoutingAlgo,
    // LID-Mask-Count: each endport owns 2^lmc LIDs. Range 0..=7.
    pub lmc: u8,
    // Interval between periodic light sweeps, in seconds. 0 disables
    // periodic sweeping.
    pub sweep_interval: u16,
    pub avoid_throttled_links: bool,
    // Number of virtual lanes Nue may spread destinations over. 1..=15.
    pub nue_max_num_vls: u8,
    // Whether Nue routes switch LIDs in addition to CA LIDs.
    pub nue_include_switches: bool,
    pub force_heavy_sweep: bool,
    // When set, port selection disregards the currently-installed LFT
    // entries instead of preferring them.
    pub ignore_existing_lfts: bool,
    // Whether routes terminating at switch LIDs participate in port
    // profile (path count) balancing.
    pub port_profile_switch_nodes: bool,
    pub sm_priority: u8,
    pub packet_life_time: u8,
    // SMP response timeout, in milliseconds.
    pub transaction_timeout: u32,
    // SMP timeouts tolerated per sweep before the sweep is failed.
    pub per_sweep_error_budget: u32,
    // Target directory for table dumps; None disables dumping.
    pub dump_files_dir: Option<PathBuf>,
    // Topology description for the torus-2QoS engine.
    pub torus: Option<TorusConfig>,
}

// Topology input for the torus-2QoS engine.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct TorusConfig {
    // Radix of each dimension.
    pub x_sz: usize,
    pub y_sz: usize,
    pub z_sz: usize,
    // Per-dimension mesh flag: a mesh dimension has no wrap link and
    // thus no dateline.
    pub x_mesh: bool,
    pub y_mesh: bool,
    pub z_mesh: bool,
    // Seed links anchoring the coordinate directions.
    pub seeds: Vec<TorusSeed>,
}

// One coordinate seed: for each direction, the switch GUID pair of a
// link pointing that way, plus the dateline offset per dimension.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct TorusSeed {
    pub xp_link: Option<SeedLink>,
    pub xm_link: Option<SeedLink>,
    pub yp_link: Option<SeedLink>,
    pub ym_link: Option<SeedLink>,
    pub zp_link: Option<SeedLink>,
    pub zm_link: Option<SeedLink>,
    pub x_dateline: isize,
    pub y_dateline: isize,
    pub z_dateline: isize,
}

// An ordered switch GUID pair; the link points from `near` to `far` in
// the seed's direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(new)]
#[derive(Deserialize, Serialize)]
pub struct SeedLink {
    pub near: Guid,
    pub far: Guid,
}

// ===== impl RoutingAlgo =====

impl RoutingAlgo {
    pub const fn name(&self) -> &'static str {
        match self {
            RoutingAlgo::MinHop => "minhop",
            RoutingAlgo::FTree => "ftree",
            RoutingAlgo::Torus2Qos => "torus-2QoS",
            RoutingAlgo::Nue => "nue",
        }
    }
}

impl std::str::FromStr for RoutingAlgo {
    type Err = ();

    fn from_str(s: &str) -> Result<RoutingAlgo, Self::Err> {
        match s {
            "minhop" => Ok(RoutingAlgo::MinHop),
            "ftree" => Ok(RoutingAlgo::FTree),
            "torus-2QoS" => Ok(RoutingAlgo::Torus2Qos),
            "nue" => Ok(RoutingAlgo::Nue),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for RoutingAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ===== impl SmConfig =====

impl Default for SmConfig {
    fn default() -> SmConfig {
        SmConfig {
            routing_engine: RoutingAlgo::default(),
            lmc: 0,
            sweep_interval: 10,
            avoid_throttled_links: false,
            nue_max_num_vls: 1,
            nue_include_switches: false,
            force_heavy_sweep: false,
            ignore_existing_lfts: false,
            port_profile_switch_nodes: false,
            sm_priority: 0,
            packet_life_time: 0x12,
            transaction_timeout: 200,
            per_sweep_error_budget: 8,
            dump_files_dir: None,
            torus: None,
        }
    }
}
