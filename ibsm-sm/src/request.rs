//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use ibsm_utils::ib::{DrPath, Guid, LinkState};
use ibsm_utils::smp::{SmpAttr, SmpMethod, SmpPayload};
use ibsm_utils::task::TimeoutTask;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Error;
use crate::tasks;
use crate::tasks::messages::input::SmpTimeoutMsg;
use crate::tasks::messages::output;
use crate::tasks::messages::output::SmpRequestMsg;

// What to do with a transaction's response. The issuer itself is
// oblivious to these; they are resolved back to the originating
// subsystem when the response (or timeout) arrives.
#[derive(Clone, Debug)]
pub enum RequestContext {
    NodeInfo {
        dr_path: DrPath,
        // Node and egress port the SMP was forwarded through, for link
        // establishment.
        parent: Option<(Guid, u8)>,
    },
    PortInfo {
        dr_path: DrPath,
        node_guid: Guid,
        port_num: u8,
        light: bool,
    },
    SwitchInfo {
        node_guid: Guid,
        light: bool,
    },
    LidSet {
        port_guid: Guid,
    },
    SwitchInfoTop {
        node_guid: Guid,
    },
    LftBlock {
        node_guid: Guid,
        block_id: u32,
    },
    PKeyBlock {
        node_guid: Guid,
    },
    LinkState {
        node_guid: Guid,
        port_num: u8,
        state: LinkState,
    },
    Handover,
}

#[derive(Debug)]
struct Pending {
    context: RequestContext,
    _timeout: TimeoutTask,
}

// The request issuer: queues outbound SMPs toward the transport
// collaborator and tracks the outstanding transactions. The sweep
// controller receives NO_PENDING_TRANSACTIONS when the count drops back
// to zero.
#[derive(Debug)]
pub struct Requester {
    next_tid: u64,
    outstanding: BTreeMap<u64, Pending>,
    transaction_timeout: u32,
    request_tx: UnboundedSender<output::ProtocolMsg>,
    timeout_tx: UnboundedSender<SmpTimeoutMsg>,
}

// ===== impl Requester =====

impl Requester {
    pub fn new(
        transaction_timeout: u32,
        request_tx: UnboundedSender<output::ProtocolMsg>,
        timeout_tx: UnboundedSender<SmpTimeoutMsg>,
    ) -> Requester {
        Requester {
            next_tid: 1,
            outstanding: BTreeMap::new(),
            transaction_timeout,
            request_tx,
            timeout_tx,
        }
    }

    // Queues one SMP request. The payload travels opaque; the context
    // is kept for response dispatch.
    pub fn request(
        &mut self,
        dr_path: DrPath,
        method: SmpMethod,
        attr: SmpAttr,
        attr_mod: u32,
        payload: SmpPayload,
        context: RequestContext,
    ) -> Result<(), Error> {
        let tid = self.next_tid;
        self.next_tid += 1;

        let timeout = tasks::transaction_timer(
            tid,
            self.transaction_timeout,
            &self.timeout_tx,
        );
        self.outstanding.insert(
            tid,
            Pending {
                context,
                _timeout: timeout,
            },
        );

        self.request_tx
            .send(output::ProtocolMsg::SmpRequest(SmpRequestMsg {
                tid,
                dr_path,
                method,
                attr,
                attr_mod,
                payload,
            }))
            .map_err(|_| {
                self.outstanding.remove(&tid);
                Error::RequestChannelClosed
            })
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    // Completes a transaction on response or timeout, returning its
    // context. Dropping the pending entry cancels the timeout task.
    pub fn complete(&mut self, tid: u64) -> Option<RequestContext> {
        self.outstanding
            .remove(&tid)
            .map(|pending| pending.context)
    }

    // Discards every in-flight transaction; responses arriving later
    // resolve to no context and are dropped.
    pub fn drain(&mut self) {
        self.outstanding.clear();
    }
}
