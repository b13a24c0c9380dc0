//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::{Guid, Lid};
use tracing::{error, warn};

// Subnet model errors.
#[derive(Debug)]
pub enum Error {
    NodeGuidNotFound(Guid),
    PortGuidNotFound(Guid),
    SwitchGuidNotFound(Guid),
    // A port claims a LID the lid table records under another port.
    LidConflict(Lid, Guid, Guid),
    LidOutOfRange(Lid),
    InvalidPortNum(Guid, u8),
    DrPathTooLong(Guid),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::NodeGuidNotFound(guid)
            | Error::PortGuidNotFound(guid)
            | Error::SwitchGuidNotFound(guid) => {
                warn!(%guid, "{}", self);
            }
            Error::LidConflict(lid, owner, claimer) => {
                error!(%lid, %owner, %claimer, "{}", self);
            }
            Error::LidOutOfRange(lid) => {
                error!(%lid, "{}", self);
            }
            Error::InvalidPortNum(guid, port_num) => {
                error!(%guid, %port_num, "{}", self);
            }
            Error::DrPathTooLong(guid) => {
                error!(%guid, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NodeGuidNotFound(..) => {
                write!(f, "node GUID not found")
            }
            Error::PortGuidNotFound(..) => {
                write!(f, "port GUID not found")
            }
            Error::SwitchGuidNotFound(..) => {
                write!(f, "switch GUID not found")
            }
            Error::LidConflict(..) => {
                write!(f, "LID already assigned to another port")
            }
            Error::LidOutOfRange(..) => {
                write!(f, "LID outside the unicast range")
            }
            Error::InvalidPortNum(..) => {
                write!(f, "port number outside the node's port array")
            }
            Error::DrPathTooLong(..) => {
                write!(f, "directed route exceeds the 64-hop limit")
            }
        }
    }
}

impl std::error::Error for Error {}
