//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::{Guid, Lid};
use tracing::{debug, debug_span};

// Routing debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    EngineStart(&'a str),
    EngineFinish(&'a str),
    EngineFallback(&'a str),
    HopMatricesDone(usize),
    UnreachableLid(Guid, Lid),
    FtreeRankAssigned(Guid, u8),
    TorusCoordinate(Guid, (usize, usize, usize)),
    NueVlAssignment(Lid, u8),
    NueEscapeRoot(u8, Guid),
    NueLocalBacktrack(Lid),
    NueEscapeFallback(Lid),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub fn log(&self) {
        match self {
            Debug::EngineStart(name)
            | Debug::EngineFinish(name)
            | Debug::EngineFallback(name) => {
                debug!(%name, "{}", self);
            }
            Debug::HopMatricesDone(passes) => {
                debug!(%passes, "{}", self);
            }
            Debug::UnreachableLid(guid, lid) => {
                debug_span!("switch", %guid).in_scope(|| {
                    debug!(%lid, "{}", self);
                })
            }
            Debug::FtreeRankAssigned(guid, rank) => {
                debug_span!("switch", %guid).in_scope(|| {
                    debug!(%rank, "{}", self);
                })
            }
            Debug::TorusCoordinate(guid, (i, j, k)) => {
                debug_span!("switch", %guid).in_scope(|| {
                    debug!(i, j, k, "{}", self);
                })
            }
            Debug::NueVlAssignment(dlid, vl) => {
                debug!(%dlid, %vl, "{}", self);
            }
            Debug::NueEscapeRoot(vl, guid) => {
                debug!(%vl, %guid, "{}", self);
            }
            Debug::NueLocalBacktrack(dlid) | Debug::NueEscapeFallback(dlid) => {
                debug!(%dlid, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::EngineStart(..) => {
                write!(f, "routing engine starting")
            }
            Debug::EngineFinish(..) => {
                write!(f, "routing engine finished")
            }
            Debug::EngineFallback(..) => {
                write!(f, "routing engine failed, falling back to minhop")
            }
            Debug::HopMatricesDone(..) => {
                write!(f, "min-hop matrices relaxed")
            }
            Debug::UnreachableLid(..) => {
                write!(f, "no path to LID")
            }
            Debug::FtreeRankAssigned(..) => {
                write!(f, "rank assigned")
            }
            Debug::TorusCoordinate(..) => {
                write!(f, "coordinate assigned")
            }
            Debug::NueVlAssignment(..) => {
                write!(f, "destination assigned to virtual lane")
            }
            Debug::NueEscapeRoot(..) => {
                write!(f, "escape-path root elected")
            }
            Debug::NueLocalBacktrack(..) => {
                write!(f, "local backtracking engaged")
            }
            Debug::NueEscapeFallback(..) => {
                write!(f, "falling back to escape paths")
            }
        }
    }
}
