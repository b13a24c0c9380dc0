//
// Copyright (c) The Ibsm Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ibsm_subnet::Subnet;
use ibsm_utils::ib::{Lid, NO_PATH};

use crate::error::Error;

// Writes the persisted-state files after a routing pass: the topology
// list, the per-switch LFTs and the hop matrices.
pub fn write_all(subnet: &Subnet, dir: &Path) -> Result<(), Error> {
    write_subnet_list(subnet, &dir.join("opensm-subnet.lst"))?;
    write_lfts(subnet, &dir.join("opensm-lfts.dump"))?;
    write_lid_matrix(subnet, &dir.join("opensm-lid-matrix.dump"))?;
    Ok(())
}

// One line per discovered link, both endpoint descriptors followed by
// the physical state.
pub fn write_subnet_list(subnet: &Subnet, path: &Path) -> Result<(), Error> {
    let mut file = BufWriter::new(File::create(path)?);

    for node_idx in subnet.node_indexes() {
        let node = &subnet.nodes[node_idx];
        for physp in node.data_ports() {
            let Some((remote_idx, remote_port)) =
                subnet.remote_of(node_idx, physp.port_num)
            else {
                continue;
            };
            let remote = &subnet.nodes[remote_idx];
            let lid = subnet.node_base_lid(node_idx).unwrap_or(Lid(0));
            let remote_lid =
                subnet.node_base_lid(remote_idx).unwrap_or(Lid(0));

            write!(
                file,
                "{{ {} Ports:{:02X} SystemGUID:{:016x} NodeGUID:{:016x} \
                 PortGUID:{:016x} {{{}}} LID:{:04X} PN:{:02X} }} ",
                node.node_type,
                node.num_ports,
                node.sys_guid.0,
                node.guid.0,
                physp.port_guid.0,
                node.description,
                lid.0,
                physp.port_num,
            )?;
            let remote_physp = remote.physp(remote_port);
            write!(
                file,
                "{{ {} Ports:{:02X} SystemGUID:{:016x} NodeGUID:{:016x} \
                 PortGUID:{:016x} {{{}}} LID:{:04X} PN:{:02X} }} ",
                remote.node_type,
                remote.num_ports,
                remote.sys_guid.0,
                remote.guid.0,
                remote_physp.map(|p| p.port_guid.0).unwrap_or(0),
                remote.description,
                remote_lid.0,
                remote_port,
            )?;
            writeln!(file, "LOG={}", physp.link_state)?;
        }
    }

    Ok(())
}

// Per-switch unicast forwarding tables.
pub fn write_lfts(subnet: &Subnet, path: &Path) -> Result<(), Error> {
    let mut file = BufWriter::new(File::create(path)?);

    for sw_idx in subnet.switch_indexes() {
        let sw = &subnet.switches[sw_idx];
        let base_lid = subnet.switch_base_lid(sw_idx).unwrap_or(Lid(0));
        writeln!(
            file,
            "Unicast lids [0x0-0x{:x}] of switch Lid {} guid {}:",
            sw.max_lid.0, base_lid, sw.guid,
        )?;

        let mut dumped = 0;
        for lid in 0..=sw.max_lid.0 {
            let lid = Lid(lid);
            let port_num = sw.new_lft_get(lid);
            if port_num == NO_PATH {
                continue;
            }
            write!(file, "0x{:04x} {:03} # ", lid.0, port_num)?;
            match subnet
                .port_by_lid(lid)
                .map(|port_idx| &subnet.ports[port_idx])
            {
                Some(port) => {
                    let node = &subnet.nodes[port.node_idx];
                    writeln!(
                        file,
                        "{} portguid {}: '{}'",
                        node.node_type, port.port_guid, node.description,
                    )?;
                }
                None => {
                    writeln!(file, "unknown node and type")?;
                }
            }
            dumped += 1;
        }
        writeln!(file, "{} lids dumped", dumped)?;
    }

    Ok(())
}

// Per-switch hop matrices, one row per reachable LID.
pub fn write_lid_matrix(subnet: &Subnet, path: &Path) -> Result<(), Error> {
    let mut file = BufWriter::new(File::create(path)?);

    for sw_idx in subnet.switch_indexes() {
        let sw = &subnet.switches[sw_idx];
        writeln!(file, "Switch: guid {}", sw.guid)?;
        for lid in 1..=sw.max_lid.0 {
            let lid = Lid(lid);
            if sw.least_hops(lid) == NO_PATH {
                continue;
            }
            write!(file, "0x{:04x}:", lid.0)?;
            for port_num in 0..=sw.num_ports {
                write!(file, " {:02x}", sw.hop_count(lid, port_num))?;
            }
            if let Some(port_idx) = subnet.port_by_lid(lid) {
                write!(
                    file,
                    " # portguid {}",
                    subnet.ports[port_idx].port_guid
                )?;
            }
            writeln!(file)?;
        }
    }

    Ok(())
}
