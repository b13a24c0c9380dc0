//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use ibsm_utils::task::{IntervalTask, TimeoutTask};
use tokio::sync::mpsc::UnboundedSender;

use crate::tasks::messages::input::{SmpTimeoutMsg, SweepMsg};

//
// SM tasks diagram:
//                                  +--------------+
//                   sweep timer -> |              |
//               smp_response Nx -> |              | -> (Nx) smp requests
//                smp_timeout Nx -> |      sm      | -> traps / notices
//                  exit_standby -> |              | -> subnet-up event
//                 sm_discovered -> |              |
//                                  +--------------+
//

// SM inter-task message types.
pub mod messages {
    use ibsm_utils::ib::{DrPath, Guid, Lid};
    use ibsm_utils::smp::{SmInfoAttr, SmpAttr, SmpMethod, SmpPayload};
    use serde::{Deserialize, Serialize};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;
    pub type ProtocolOutputMsg = output::ProtocolMsg;

    // Input messages (transport/timers -> sweep task).
    pub mod input {
        use super::*;

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum ProtocolMsg {
            Sweep(SweepMsg),
            SmpResponse(SmpResponseMsg),
            SmpTimeout(SmpTimeoutMsg),
            SmDiscovered(SmDiscoveredMsg),
            ExitStandby(ExitStandbyMsg),
            #[serde(skip)]
            IdleWork(IdleWorkMsg),
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct SweepMsg {
            pub force_heavy: bool,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct SmpResponseMsg {
            pub tid: u64,
            pub payload: SmpPayload,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct SmpTimeoutMsg {
            pub tid: u64,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct SmDiscoveredMsg {
            pub sm_info: SmInfoAttr,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct ExitStandbyMsg {}

        // Deferred computation handed to the sweep task; drained on
        // the next idle edge.
        pub struct IdleWorkMsg {
            pub item: crate::instance::IdleWorkItem,
        }

        impl std::fmt::Debug for IdleWorkMsg {
            fn fmt(
                &self,
                f: &mut std::fmt::Formatter<'_>,
            ) -> std::fmt::Result {
                f.debug_struct("IdleWorkMsg").finish()
            }
        }
    }

    // Output messages (sweep task -> transport/notice consumers).
    pub mod output {
        use super::*;

        #[derive(Debug, Eq, PartialEq)]
        #[derive(Deserialize, Serialize)]
        pub enum ProtocolMsg {
            SmpRequest(SmpRequestMsg),
            PortNewTrap(PortNewTrapMsg),
            SubnetUp(SubnetUpMsg),
        }

        #[derive(Debug, Eq, PartialEq)]
        #[derive(Deserialize, Serialize)]
        pub struct SmpRequestMsg {
            pub tid: u64,
            pub dr_path: DrPath,
            pub method: SmpMethod,
            pub attr: SmpAttr,
            pub attr_mod: u32,
            pub payload: SmpPayload,
        }

        // Trap 64: a new endport joined the subnet.
        #[derive(Debug, Eq, PartialEq)]
        #[derive(Deserialize, Serialize)]
        pub struct PortNewTrapMsg {
            pub port_guid: Guid,
            pub base_lid: Lid,
        }

        #[derive(Debug, Eq, PartialEq)]
        #[derive(Deserialize, Serialize)]
        pub struct SubnetUpMsg {}
    }
}

// ===== global functions =====

// Periodic light-sweep trigger; disabled when the configured interval
// is zero.
pub fn sweep_timer(
    interval_secs: u16,
    sweep_tx: &UnboundedSender<SweepMsg>,
) -> Option<IntervalTask> {
    if interval_secs == 0 {
        return None;
    }
    let sweep_tx = sweep_tx.clone();
    let task = IntervalTask::new(
        Duration::from_secs(interval_secs as u64),
        false,
        move || {
            let sweep_tx = sweep_tx.clone();
            async move {
                let _ = sweep_tx.send(SweepMsg { force_heavy: false });
            }
        },
    );
    Some(task)
}

// Per-transaction response timeout.
pub fn transaction_timer(
    tid: u64,
    timeout_ms: u32,
    timeout_tx: &UnboundedSender<SmpTimeoutMsg>,
) -> TimeoutTask {
    let timeout_tx = timeout_tx.clone();
    TimeoutTask::new(Duration::from_millis(timeout_ms as u64), move || {
        async move {
            let _ = timeout_tx.send(SmpTimeoutMsg { tid });
        }
    })
}
