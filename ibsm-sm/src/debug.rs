//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ibsm_utils::ib::{Guid, Lid, LinkState};
use tracing::{debug, debug_span, info};

use crate::state_mgr::{Signal, State};

// Sweep controller debug messages.
#[derive(Debug)]
pub enum Debug {
    FsmTransition(State, Signal, State),
    SweepLightStart,
    SweepHeavyStart,
    ChangeDetected(Guid),
    NodeDiscovered(Guid),
    PortStateChange(Guid, u8, LinkState),
    LidAssigned(Guid, Lid),
    LftBlockSent(Guid, u32),
    HandoverSent(Guid),
    SmPortDown,
    SubnetUp,
    InitializationErrors(u32),
}

// ===== impl Debug =====

impl Debug {
    // Log debug message using the tracing API.
    pub fn log(&self) {
        match self {
            Debug::FsmTransition(from, signal, to) => {
                debug!(?from, ?signal, ?to, "{}", self);
            }
            Debug::SweepLightStart | Debug::SweepHeavyStart => {
                debug!("{}", self);
            }
            Debug::ChangeDetected(guid) | Debug::NodeDiscovered(guid) => {
                debug!(%guid, "{}", self);
            }
            Debug::PortStateChange(guid, port_num, state) => {
                debug_span!("port", %guid, %port_num).in_scope(|| {
                    debug!(%state, "{}", self);
                })
            }
            Debug::LidAssigned(guid, lid) => {
                debug!(%guid, %lid, "{}", self);
            }
            Debug::LftBlockSent(guid, block) => {
                debug_span!("switch", %guid).in_scope(|| {
                    debug!(%block, "{}", self);
                })
            }
            Debug::HandoverSent(guid) => {
                info!(%guid, "{}", self);
            }
            Debug::SmPortDown => {
                info!("{}", self);
            }
            Debug::SubnetUp => {
                // The one-line marker operators grep for.
                info!("SUBNET UP");
            }
            Debug::InitializationErrors(errors) => {
                info!(%errors, "ERRORS DURING INITIALIZATION");
            }
        }
    }
}

impl std::fmt::Display for Debug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::SweepLightStart => {
                write!(f, "initiating light sweep")
            }
            Debug::SweepHeavyStart => {
                write!(f, "initiating heavy sweep")
            }
            Debug::ChangeDetected(..) => {
                write!(f, "fabric change detected")
            }
            Debug::NodeDiscovered(..) => {
                write!(f, "node discovered")
            }
            Debug::PortStateChange(..) => {
                write!(f, "port state updated")
            }
            Debug::LidAssigned(..) => {
                write!(f, "LID range assigned")
            }
            Debug::LftBlockSent(..) => {
                write!(f, "forwarding table block written")
            }
            Debug::HandoverSent(..) => {
                write!(f, "mastership handover sent")
            }
            Debug::SmPortDown => {
                write!(f, "local port is down, dropping subnet state")
            }
            Debug::SubnetUp => {
                write!(f, "SUBNET UP")
            }
            Debug::InitializationErrors(..) => {
                write!(f, "ERRORS DURING INITIALIZATION")
            }
        }
    }
}
