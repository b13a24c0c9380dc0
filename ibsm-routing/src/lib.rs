//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod debug;
pub mod dump;
pub mod error;
pub mod ftree;
pub mod minhop;
pub mod nue;
pub mod torus;

use std::collections::BTreeMap;

use ibsm_subnet::Subnet;
use ibsm_utils::config::{RoutingAlgo, SmConfig};
use ibsm_utils::ib::Lid;

use crate::debug::Debug;
pub use crate::error::Error;

// A unicast routing engine.
//
// Construction doubles as the `setup` stage (a failing constructor
// makes the core fall back to Min-Hop) and `Drop` as `destroy`. The
// default `build_hop_matrices` reports the stage as absent, which makes
// the core compute plain min-hop matrices before the engine's table
// pass runs.
pub trait RoutingEngine: Send {
    fn name(&self) -> &'static str;

    fn build_hop_matrices(
        &mut self,
        _subnet: &mut Subnet,
        _config: &SmConfig,
    ) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    fn build_ucast_tables(
        &mut self,
        subnet: &mut Subnet,
        config: &SmConfig,
    ) -> Result<(), Error>;

    // Service level for the (slid, dlid) pair. Must be idempotent and
    // side-effect free.
    fn path_sl(&self, hint_sl: u8, _slid: Lid, _dlid: Lid) -> u8 {
        hint_sl
    }
}

// Factory signature for pluggable engine registration.
pub type EngineFactory =
    Box<dyn Fn(&SmConfig) -> Result<Box<dyn RoutingEngine>, Error> + Send + Sync>;

// Name-indexed registry of routing engine factories.
//
// The built-in engines are pre-registered; external engines can be
// added under new names before the first sweep.
#[derive(Default)]
pub struct EngineRegistry {
    factories: BTreeMap<String, EngineFactory>,
}

// Outcome of one routing pass.
#[derive(Debug, Eq, PartialEq)]
pub struct RouteSummary {
    pub engine: &'static str,
    // The selected engine failed and Min-Hop routed the fabric instead.
    pub used_fallback: bool,
    // LIDs no switch can reach; non-zero forces a retry sweep when the
    // default engine routed.
    pub unreachable: u32,
}

// ===== impl EngineRegistry =====

impl EngineRegistry {
    pub fn with_builtin() -> EngineRegistry {
        let mut registry = EngineRegistry::default();
        registry.register(RoutingAlgo::MinHop.name(), Box::new(|_| {
            Ok(Box::new(minhop::MinHopEngine::default()) as Box<dyn RoutingEngine>)
        }));
        registry.register(RoutingAlgo::FTree.name(), Box::new(|_| {
            Ok(Box::new(ftree::FTreeEngine::default()) as Box<dyn RoutingEngine>)
        }));
        registry.register(RoutingAlgo::Torus2Qos.name(), Box::new(|config| {
            torus::TorusEngine::setup(config)
                .map(|engine| Box::new(engine) as Box<dyn RoutingEngine>)
        }));
        registry.register(RoutingAlgo::Nue.name(), Box::new(|config| {
            Ok(Box::new(nue::NueEngine::setup(config)) as Box<dyn RoutingEngine>)
        }));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: EngineFactory) {
        self.factories.insert(name.into(), factory);
    }

    // Instantiates the engine registered under `name`. A missing name
    // or failing setup yields Min-Hop, mirroring the engine fallback
    // contract.
    pub fn create(
        &self,
        name: &str,
        config: &SmConfig,
    ) -> Box<dyn RoutingEngine> {
        match self.factories.get(name) {
            Some(factory) => match factory(config) {
                Ok(engine) => engine,
                Err(error) => {
                    error.log();
                    Debug::EngineFallback(RoutingAlgo::MinHop.name()).log();
                    Box::new(minhop::MinHopEngine::default())
                }
            },
            None => {
                Debug::EngineFallback(RoutingAlgo::MinHop.name()).log();
                Box::new(minhop::MinHopEngine::default())
            }
        }
    }
}

// ===== global functions =====

// Runs one full routing pass: hop matrices, then unicast tables, with
// Min-Hop fallback on engine failure. Every switch's new-LFT buffer is
// valid on return.
pub fn route_subnet(
    subnet: &mut Subnet,
    config: &SmConfig,
    engine: &mut dyn RoutingEngine,
) -> RouteSummary {
    let mut summary = RouteSummary {
        engine: engine.name(),
        used_fallback: false,
        unreachable: 0,
    };

    if subnet.num_switches() == 0 {
        return summary;
    }

    prepare_switches(subnet);
    Debug::EngineStart(engine.name()).log();

    // Engines without their own matrix stage run on plain min-hop
    // matrices.
    let mut default_matrices = false;
    if engine.build_hop_matrices(subnet, config).is_err() {
        minhop::build_hop_matrices(subnet, config);
        default_matrices = true;
    }

    let mut default_tables = false;
    if let Err(error) = engine.build_ucast_tables(subnet, config) {
        error.log();
        Debug::EngineFallback(engine.name()).log();
        summary.used_fallback = true;

        // The failed engine may have left partial state in the new-LFT
        // buffers.
        prepare_switches(subnet);
        minhop::build_hop_matrices(subnet, config);
        default_matrices = true;
        minhop::build_ucast_tables(subnet, config);
        default_tables = true;
    } else if engine.name() == RoutingAlgo::MinHop.name() {
        // The baseline engine runs exactly the default stages.
        default_matrices = true;
        default_tables = true;
    }

    // Unreachable destinations are only an initialization error with
    // default routing; topology-aware engines legitimately skip LIDs
    // (e.g. up/down separation).
    if default_matrices && default_tables {
        summary.unreachable = count_unreachable(subnet);
    }

    if let Some(dir) = &config.dump_files_dir
        && let Err(error) = dump::write_all(subnet, dir)
    {
        error.log();
    }

    Debug::EngineFinish(summary.engine).log();
    summary
}

// ===== helper functions =====

fn prepare_switches(subnet: &mut Subnet) {
    let max_lid = subnet.max_lid;
    let sw_idxs = subnet.switch_indexes().collect::<Vec<_>>();
    for sw_idx in sw_idxs {
        subnet.switches[sw_idx].prepare_path_rebuild(max_lid);
    }
}

fn count_unreachable(subnet: &Subnet) -> u32 {
    let mut unreachable = 0;
    for sw_idx in subnet.switch_indexes() {
        let sw = &subnet.switches[sw_idx];
        for lid in 1..=subnet.max_lid.0 {
            let lid = Lid(lid);
            if subnet.port_by_lid(lid).is_some()
                && sw.new_lft_get(lid) == ibsm_utils::ib::NO_PATH
            {
                Debug::UnreachableLid(sw.guid, lid).log();
                unreachable += 1;
            }
        }
    }
    unreachable
}
