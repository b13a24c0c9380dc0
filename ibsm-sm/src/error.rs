//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::Guid;
use tracing::{error, warn};

use crate::state_mgr::{Signal, State};

// Sweep controller errors.
#[derive(Debug)]
pub enum Error {
    // Inter-task communication
    UnknownTransaction(u64),
    RequestChannelClosed,
    // FSM
    UnexpectedSignal(State, Signal),
    // Discovery
    NodeGuidNotFound(Guid),
    DrPathTooLong(Guid, u8),
    // LID management
    LidSpaceExhausted,
    // Subnet model
    Subnet(ibsm_subnet::Error),
}

// ===== impl Error =====

impl Error {
    pub fn log(&self) {
        match self {
            Error::UnknownTransaction(tid) => {
                warn!(%tid, "{}", self);
            }
            Error::RequestChannelClosed => {
                warn!("{}", self);
            }
            Error::UnexpectedSignal(state, signal) => {
                error!(?state, ?signal, "{}", self);
            }
            Error::NodeGuidNotFound(guid) => {
                warn!(%guid, "{}", self);
            }
            Error::DrPathTooLong(guid, port_num) => {
                error!(%guid, %port_num, "{}", self);
            }
            Error::LidSpaceExhausted => {
                error!("{}", self);
            }
            Error::Subnet(error) => {
                error.log();
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownTransaction(..) => {
                write!(f, "response for unknown transaction")
            }
            Error::RequestChannelClosed => {
                write!(f, "transport request channel closed")
            }
            Error::UnexpectedSignal(..) => {
                write!(f, "unexpected signal in this state")
            }
            Error::NodeGuidNotFound(..) => {
                write!(f, "node GUID not found")
            }
            Error::DrPathTooLong(..) => {
                write!(f, "directed route exceeds the 64-hop limit")
            }
            Error::LidSpaceExhausted => {
                write!(f, "no free LID range left in the unicast space")
            }
            Error::Subnet(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Subnet(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ibsm_subnet::Error> for Error {
    fn from(error: ibsm_subnet::Error) -> Error {
        Error::Subnet(error)
    }
}
