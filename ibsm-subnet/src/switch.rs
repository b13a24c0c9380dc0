//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use ibsm_utils::ib::{Guid, Lid, NO_PATH};
use ibsm_utils::smp::{LFT_BLOCK_SIZE, SwitchInfoAttr};

use crate::error::Error;
use crate::subnet::NodeIndex;

// Per-switch routing state: the installed LFT, the "new LFT" buffer the
// routing engines write into, the hop-count matrix and the port
// profiles.
#[derive(Debug)]
pub struct Switch {
    pub node_idx: NodeIndex,
    pub guid: Guid,
    pub num_ports: u8,
    pub switch_info: SwitchInfoAttr,
    // Installed linear forwarding table, block-padded.
    lft: Vec<u8>,
    // Double buffer for the routing pass in progress, block-padded.
    new_lft: Vec<u8>,
    // hops[lid][port]: minimal known hop count toward `lid` leaving
    // through `port`.
    hops: Vec<Vec<u8>>,
    // Path count per egress port (port profiles).
    path_counts: Vec<u32>,
    // Multicast port membership per MLID; populated by a collaborator.
    pub mcast_tbl: BTreeMap<Lid, BTreeSet<u8>>,
    pub max_lid: Lid,
    pub need_update: bool,
    pub discovery_count: u32,
}

// LMC > 0 spreading state: the remote system/node GUIDs already chosen
// for previous LIDs of the same destination port.
#[derive(Debug, Default)]
pub struct PathSpread {
    used_systems: Vec<Guid>,
    used_nodes: Vec<Guid>,
}

// ===== impl Switch =====

impl Switch {
    pub fn new(node_idx: NodeIndex, guid: Guid, num_ports: u8) -> Switch {
        Switch {
            node_idx,
            guid,
            num_ports,
            switch_info: SwitchInfoAttr::default(),
            lft: Vec::new(),
            new_lft: Vec::new(),
            hops: Vec::new(),
            path_counts: vec![0; num_ports as usize + 1],
            mcast_tbl: BTreeMap::new(),
            max_lid: Lid(0),
            need_update: true,
            discovery_count: 0,
        }
    }

    // Resets the routing buffers for a new routing pass. The installed
    // LFT is kept for diffing; the new-LFT buffer, the hop matrix and
    // the port profiles start from scratch.
    pub fn prepare_path_rebuild(&mut self, max_lid: Lid) {
        let tbl_len = blocks_covering(max_lid) * LFT_BLOCK_SIZE;
        self.max_lid = max_lid;
        self.new_lft.clear();
        self.new_lft.resize(tbl_len, NO_PATH);
        if self.lft.len() < tbl_len {
            self.lft.resize(tbl_len, NO_PATH);
        }
        self.hops.clear();
        self.hops.resize(
            max_lid.0 as usize + 1,
            vec![NO_PATH; self.num_ports as usize + 1],
        );
        self.path_counts = vec![0; self.num_ports as usize + 1];
    }

    // ===== hop matrix =====

    pub fn set_hops(
        &mut self,
        lid: Lid,
        port_num: u8,
        hops: u8,
    ) -> Result<(), Error> {
        let row = self
            .hops
            .get_mut(lid.0 as usize)
            .ok_or(Error::LidOutOfRange(lid))?;
        let entry = row
            .get_mut(port_num as usize)
            .ok_or(Error::InvalidPortNum(self.guid, port_num))?;
        *entry = hops;
        Ok(())
    }

    pub fn hop_count(&self, lid: Lid, port_num: u8) -> u8 {
        self.hops
            .get(lid.0 as usize)
            .and_then(|row| row.get(port_num as usize))
            .copied()
            .unwrap_or(NO_PATH)
    }

    // Minimal hop count toward `lid` over all egress ports.
    pub fn least_hops(&self, lid: Lid) -> u8 {
        self.hops
            .get(lid.0 as usize)
            .map(|row| row.iter().copied().min().unwrap_or(NO_PATH))
            .unwrap_or(NO_PATH)
    }

    // ===== port profiles =====

    pub fn count_path(&mut self, port_num: u8) {
        if let Some(count) = self.path_counts.get_mut(port_num as usize) {
            *count += 1;
        }
    }

    pub fn path_count(&self, port_num: u8) -> u32 {
        self.path_counts
            .get(port_num as usize)
            .copied()
            .unwrap_or(0)
    }

    // ===== forwarding tables =====

    pub fn lft_get(&self, lid: Lid) -> u8 {
        self.lft.get(lid.0 as usize).copied().unwrap_or(NO_PATH)
    }

    pub fn new_lft_get(&self, lid: Lid) -> u8 {
        self.new_lft.get(lid.0 as usize).copied().unwrap_or(NO_PATH)
    }

    pub fn set_new_lft(&mut self, lid: Lid, port_num: u8) -> Result<(), Error> {
        let entry = self
            .new_lft
            .get_mut(lid.0 as usize)
            .ok_or(Error::LidOutOfRange(lid))?;
        *entry = port_num;
        Ok(())
    }

    pub fn num_blocks(&self) -> usize {
        self.new_lft.len() / LFT_BLOCK_SIZE
    }

    pub fn lft_block(&self, block_id: usize) -> Option<&[u8]> {
        let start = block_id * LFT_BLOCK_SIZE;
        self.lft.get(start..start + LFT_BLOCK_SIZE)
    }

    pub fn new_lft_block(&self, block_id: usize) -> Option<&[u8]> {
        let start = block_id * LFT_BLOCK_SIZE;
        self.new_lft.get(start..start + LFT_BLOCK_SIZE)
    }

    // Mirrors a sent block into the installed table.
    pub fn set_lft_block(&mut self, block_id: usize, block: &[u8]) {
        let start = block_id * LFT_BLOCK_SIZE;
        if let Some(dst) = self.lft.get_mut(start..start + LFT_BLOCK_SIZE) {
            dst.copy_from_slice(block);
        }
    }

    // ===== port selection =====

    // Recommends the egress port for `dest_lid` among the ports
    // achieving the minimal hop count.
    //
    // The hop matrix only carries rows for switch LIDs; `via_lid` is
    // the LID of the switch owning (or fronting) the destination, which
    // the caller resolved from the LID table.
    //
    // Unless `ignore_existing` is set, an installed LFT entry that
    // still achieves the minimal hop count is kept, avoiding gratuitous
    // reprogramming. Otherwise the least-loaded candidate wins; with
    // LMC > 0, `spread` steers consecutive LIDs of one destination
    // toward distinct remote systems, then distinct remote nodes
    // (`remote_id` resolves an egress port to the remote's
    // (system GUID, node GUID)).
    pub fn recommend_path(
        &self,
        dest_lid: Lid,
        via_lid: Lid,
        ignore_existing: bool,
        mut spread: Option<&mut PathSpread>,
        remote_id: impl Fn(u8) -> Option<(Guid, Guid)>,
    ) -> u8 {
        let least = self.least_hops(via_lid);
        if least == NO_PATH {
            return NO_PATH;
        }
        // The switch's own LID terminates at the management port.
        if least == 0 {
            return 0;
        }

        if !ignore_existing {
            let installed = self.lft_get(dest_lid);
            if installed != NO_PATH
                && installed != 0
                && self.hop_count(via_lid, installed) == least
            {
                return installed;
            }
        }

        let candidates = (1..=self.num_ports)
            .filter(|&port_num| self.hop_count(via_lid, port_num) == least)
            .collect::<Vec<_>>();

        let pool = match &spread {
            Some(spread) => {
                // Prefer remotes on systems not yet used for this
                // destination, then nodes not yet used.
                let fresh_sys = candidates
                    .iter()
                    .copied()
                    .filter(|&port_num| {
                        remote_id(port_num).is_some_and(|(sys, _)| {
                            !spread.used_systems.contains(&sys)
                        })
                    })
                    .collect::<Vec<_>>();
                if !fresh_sys.is_empty() {
                    fresh_sys
                } else {
                    let fresh_node = candidates
                        .iter()
                        .copied()
                        .filter(|&port_num| {
                            remote_id(port_num).is_some_and(|(_, node)| {
                                !spread.used_nodes.contains(&node)
                            })
                        })
                        .collect::<Vec<_>>();
                    if !fresh_node.is_empty() {
                        fresh_node
                    } else {
                        candidates
                    }
                }
            }
            None => candidates,
        };

        let Some(best) = pool
            .into_iter()
            .min_by_key(|&port_num| (self.path_count(port_num), port_num))
        else {
            return NO_PATH;
        };

        if let Some(spread) = spread.as_deref_mut()
            && let Some((sys, node)) = remote_id(best)
        {
            spread.used_systems.push(sys);
            spread.used_nodes.push(node);
        }

        best
    }
}

// ===== global functions =====

// Number of 64-entry LFT blocks needed to cover LIDs `0..=max_lid`.
pub fn blocks_covering(max_lid: Lid) -> usize {
    (max_lid.0 as usize + LFT_BLOCK_SIZE) / LFT_BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use generational_arena::Arena;

    fn test_switch() -> Switch {
        let mut arena = Arena::new();
        let node_idx = arena.insert(());
        let mut sw = Switch::new(node_idx, Guid(0x10), 4);
        sw.prepare_path_rebuild(Lid(10));
        sw
    }

    #[test]
    fn hop_matrix() {
        let mut sw = test_switch();
        assert_eq!(sw.least_hops(Lid(5)), NO_PATH);
        sw.set_hops(Lid(5), 2, 3).unwrap();
        sw.set_hops(Lid(5), 3, 1).unwrap();
        assert_eq!(sw.hop_count(Lid(5), 2), 3);
        assert_eq!(sw.least_hops(Lid(5)), 1);
        assert!(sw.set_hops(Lid(100), 1, 1).is_err());
    }

    #[test]
    fn recommend_least_loaded() {
        let mut sw = test_switch();
        sw.set_hops(Lid(5), 1, 2).unwrap();
        sw.set_hops(Lid(5), 2, 2).unwrap();
        sw.set_hops(Lid(5), 3, 4).unwrap();
        sw.count_path(1);
        let port = sw.recommend_path(Lid(5), Lid(5), true, None, |_| None);
        assert_eq!(port, 2);
    }

    #[test]
    fn recommend_keeps_installed_entry() {
        let mut sw = test_switch();
        sw.set_hops(Lid(5), 1, 2).unwrap();
        sw.set_hops(Lid(5), 2, 2).unwrap();
        sw.set_lft_block(0, &{
            let mut block = [NO_PATH; LFT_BLOCK_SIZE];
            block[5] = 1;
            block
        });
        sw.count_path(1);
        // Port 2 is less loaded, but the installed entry still achieves
        // the minimal hop count and must be kept.
        let port = sw.recommend_path(Lid(5), Lid(5), false, None, |_| None);
        assert_eq!(port, 1);
    }
}
