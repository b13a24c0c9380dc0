//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::{Guid, Lid};
use tracing::{error, warn};

// Routing engine errors.
//
// Any of these returned from an engine's table-building entry point
// makes the core fall back to Min-Hop.
#[derive(Debug)]
pub enum Error {
    // The engine does not provide this stage.
    Unsupported,
    // Fat-Tree: LMC > 0 is not supported.
    LmcNotSupported(u8),
    // Fat-Tree: tree depth outside the supported [2, 8] window.
    RankBounds(u8),
    // Fat-Tree: two CAs linked directly.
    CaCaLink(Guid, Guid),
    // Fat-Tree: switches of one rank disagree on port-group counts.
    RankAsymmetry(u8),
    // Fat-Tree: the fabric shape rules out a k-ary-n-tree.
    NotFatTree(&'static str),
    // Torus: the engine requires a topology description.
    MissingTorusConfig,
    // Torus: a seed link names GUIDs absent from the fabric.
    BadSeedLink(Guid, Guid),
    // Torus: a switch could not be placed on the coordinate grid.
    CoordAssignment(Guid),
    // Nue: a destination stayed unreachable after backtracking and
    // escape-path fallback.
    Unreachable(Lid),
    // Nue (debug builds): the acyclicity audit found a cycle.
    CdgCycle(u8),
    // An internal routing invariant did not hold. Asserts in debug
    // builds; release builds log and the sweep is retried.
    InvariantViolated(&'static str),
    // Dump file I/O.
    Io(std::io::Error),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::Unsupported => {
                warn!("{}", self);
            }
            Error::LmcNotSupported(lmc) => {
                warn!(%lmc, "{}", self);
            }
            Error::RankBounds(rank) => {
                error!(%rank, "{}", self);
            }
            Error::CaCaLink(guid1, guid2) => {
                error!(%guid1, %guid2, "{}", self);
            }
            Error::RankAsymmetry(rank) => {
                error!(%rank, "{}", self);
            }
            Error::NotFatTree(reason) => {
                error!(%reason, "{}", self);
            }
            Error::MissingTorusConfig => {
                error!("{}", self);
            }
            Error::BadSeedLink(near, far) => {
                error!(%near, %far, "{}", self);
            }
            Error::CoordAssignment(guid) => {
                error!(%guid, "{}", self);
            }
            Error::Unreachable(lid) => {
                error!(%lid, "{}", self);
            }
            Error::CdgCycle(vl) => {
                error!(%vl, "{}", self);
            }
            Error::InvariantViolated(invariant) => {
                error!(%invariant, "{}", self);
            }
            Error::Io(err) => {
                warn!(error = %err, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Unsupported => {
                write!(f, "stage not provided by the routing engine")
            }
            Error::LmcNotSupported(..) => {
                write!(f, "engine does not support LMC > 0")
            }
            Error::RankBounds(..) => {
                write!(f, "fabric rank outside the supported range")
            }
            Error::CaCaLink(..) => {
                write!(f, "illegal CA-to-CA link")
            }
            Error::RankAsymmetry(..) => {
                write!(f, "asymmetric port groups within one rank")
            }
            Error::NotFatTree(..) => {
                write!(f, "fabric topology is not a fat-tree")
            }
            Error::MissingTorusConfig => {
                write!(f, "torus engine started without a topology description")
            }
            Error::BadSeedLink(..) => {
                write!(f, "seed link does not match any fabric link")
            }
            Error::CoordAssignment(..) => {
                write!(f, "switch not reachable from the coordinate seeds")
            }
            Error::Unreachable(..) => {
                write!(f, "destination unreachable in the dependency graph")
            }
            Error::CdgCycle(..) => {
                write!(f, "channel dependency cycle within one virtual lane")
            }
            Error::InvariantViolated(..) => {
                write!(f, "routing invariant violated")
            }
            Error::Io(..) => {
                write!(f, "failed to write dump file")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}
