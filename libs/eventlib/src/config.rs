// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process parameters and orchestration payloads
//!
//! The collection layer drives every process through JSON transitions
//! (`connect`, `configure`, `beginrun`, `disconnect`, `reset`). This module
//! holds the parameter structs those transitions fill in and the parsing of
//! the `connect` payload: contributor ids and readout groups under `drp.*`,
//! trigger event builders under `teb.*`. Parse failures become
//! configuration errors that the process reports back in `err_info` without
//! any state change.

use serde_json::Value;

use crate::error::{EbError, Result};
use crate::monitor::MAX_EV_BUFFERS;
use crate::pulse::NUM_READOUT_GROUPS;

pub const MAX_DRPS: usize = 64;
pub const MAX_TEBS: usize = 64;
pub const MAX_MEBS: usize = 64;

/// Smallest usable transfer-buffer count; lower requests are clamped up.
pub const MIN_EV_BUFFERS: usize = 8;

/// Base of the port range used for monitor requests.
pub const MRQ_PORT_BASE: u16 = 32768;

/// Parameters shared by every event-builder role.
#[derive(Debug, Clone, Default)]
pub struct EbParams {
    /// Network interface override; empty selects the default NIC.
    pub if_addr: String,
    pub instrument: String,
    pub partition: u32,
    /// Unique name passed on the command line.
    pub alias: String,
    /// This process's instance id, assigned at connect.
    pub id: usize,
    /// Bit list of contributing processes.
    pub contributors: u64,
    /// Contributors providing inputs, per readout group.
    pub contractors: [u64; NUM_READOUT_GROUPS],
    /// Peer addresses to connect to.
    pub addrs: Vec<String>,
    /// Peer ports, parallel to `addrs`.
    pub ports: Vec<u16>,
    /// Max non-event datagram size per contributor.
    pub max_tr_size: Vec<usize>,
    /// Prometheus scrape-target directory; empty disables the file.
    pub prometheus_dir: String,
    /// Cores to pin the builder and auxiliary threads to; -1 disables.
    pub core: [i32; 2],
    pub verbose: u8,
}

/// Parameters of a monitor event-builder process.
#[derive(Debug, Clone, Default)]
pub struct MebParams {
    pub eb: EbParams,
    /// Transfer buffer size; must hold the largest built event or
    /// transition. Derived at connect from the contributors' declarations.
    pub max_buffer_size: usize,
    pub num_ev_buffers: usize,
}

impl MebParams {
    /// Groups that have at least one contractor.
    pub fn group_mask(&self) -> u16 {
        let mut mask = 0u16;
        for (group, &ctrbs) in self.eb.contractors.iter().enumerate() {
            if ctrbs != 0 {
                mask |= 1 << group;
            }
        }
        mask
    }
}

fn field<'v>(value: &'v Value, key: &str) -> Result<&'v Value> {
    value
        .get(key)
        .ok_or_else(|| EbError::Configuration(format!("missing required {key} section")))
}

fn as_u64(value: &Value, key: &str) -> Result<u64> {
    field(value, key)?
        .as_u64()
        .ok_or_else(|| EbError::Configuration(format!("{key} is not a number")))
}

fn as_str<'v>(value: &'v Value, key: &str) -> Result<&'v str> {
    field(value, key)?
        .as_str()
        .ok_or_else(|| EbError::Configuration(format!("{key} is not a string")))
}

/// Parse the `connect` payload body into monitor-EB parameters.
///
/// `collection_id` selects this process's own entry under `meb.*`.
pub fn parse_meb_connection(
    body: &Value,
    collection_id: &str,
    prms: &mut MebParams,
) -> Result<()> {
    let meb = field(field(body, "meb")?, collection_id)?;
    let id = as_u64(meb, "meb_id")? as usize;
    if id >= MAX_MEBS {
        return Err(EbError::Configuration(format!(
            "MEB ID {id} is out of range 0 - {}",
            MAX_MEBS - 1
        )));
    }
    prms.eb.id = id;
    prms.eb.if_addr = as_str(field(meb, "connect_info")?, "nic_ip")?.to_string();

    let drps = field(body, "drp")?
        .as_object()
        .ok_or_else(|| EbError::Configuration("drp section is not an object".into()))?;
    if drps.is_empty() {
        return Err(EbError::Configuration("missing required DRP specs".into()));
    }

    prms.eb.contributors = 0;
    prms.eb.contractors = [0; NUM_READOUT_GROUPS];
    prms.eb.max_tr_size = vec![0; MAX_DRPS];
    let mut total_ev_size = 0usize;
    let mut total_tr_size = 0usize;

    for drp in drps.values() {
        let drp_id = as_u64(drp, "drp_id")? as usize;
        if drp_id >= MAX_DRPS {
            return Err(EbError::Configuration(format!(
                "DRP ID {drp_id} is out of range 0 - {}",
                MAX_DRPS - 1
            )));
        }
        prms.eb.contributors |= 1 << drp_id;

        let group = as_u64(field(drp, "det_info")?, "readout")? as usize;
        if group >= NUM_READOUT_GROUPS {
            return Err(EbError::Configuration(format!(
                "readout group {group} is out of range 0 - {}",
                NUM_READOUT_GROUPS - 1
            )));
        }
        prms.eb.contractors[group] |= 1 << drp_id;

        let connect_info = field(drp, "connect_info")?;
        let tr_size = as_u64(connect_info, "max_tr_size")? as usize;
        prms.eb.max_tr_size[drp_id] = tr_size;
        total_tr_size += tr_size;
        total_ev_size += as_u64(connect_info, "max_ev_size")? as usize;
    }
    // Transfer buffers must fit both built events and worst-case transitions.
    prms.max_buffer_size = total_ev_size.max(total_tr_size);

    let tebs = field(body, "teb")?
        .as_object()
        .ok_or_else(|| EbError::Configuration("teb section is not an object".into()))?;
    if tebs.is_empty() {
        return Err(EbError::Configuration("missing required TEB specs".into()));
    }

    prms.eb.addrs.clear();
    prms.eb.ports.clear();
    for teb in tebs.values() {
        let teb_id = as_u64(teb, "teb_id")? as usize;
        if teb_id >= MAX_TEBS {
            return Err(EbError::Configuration(format!(
                "TEB ID {teb_id} is out of range 0 - {}",
                MAX_TEBS - 1
            )));
        }
        let addr = as_str(field(teb, "connect_info")?, "nic_ip")?.to_string();
        prms.eb.addrs.push(addr);
        prms.eb.ports.push(mrq_port(prms.eb.partition, teb_id));
    }

    validate_buffer_count(&mut prms.num_ev_buffers)?;
    Ok(())
}

/// The monitor-request port a TEB serves for a given partition.
pub fn mrq_port(partition: u32, teb_id: usize) -> u16 {
    MRQ_PORT_BASE + (partition as u16) * (MAX_TEBS as u16) + teb_id as u16
}

/// Clamp a requested transfer-buffer count to the supported range.
///
/// Counts below the minimum are raised to it; counts above 255 are
/// rejected outright because the environment-word encoding cannot name
/// them. Never silently truncated.
pub fn validate_buffer_count(num_ev_buffers: &mut usize) -> Result<()> {
    if *num_ev_buffers < MIN_EV_BUFFERS {
        tracing::warn!(
            requested = *num_ev_buffers,
            minimum = MIN_EV_BUFFERS,
            "transfer buffer count raised to minimum"
        );
        *num_ev_buffers = MIN_EV_BUFFERS;
    }
    if *num_ev_buffers > MAX_EV_BUFFERS {
        return Err(EbError::Configuration(format!(
            "number of event buffers > {MAX_EV_BUFFERS} is not supported: got {}",
            num_ev_buffers
        )));
    }
    Ok(())
}

/// This process's `connect_info` advertisement.
pub fn connection_info(nic_ip: &str, buf_count: usize) -> Value {
    serde_json::json!({
        "connect_info": {
            "nic_ip": nic_ip,
            "buf_count": buf_count,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Value {
        json!({
            "meb": {
                "7": { "meb_id": 2, "connect_info": { "nic_ip": "10.0.0.9" } }
            },
            "drp": {
                "3": {
                    "drp_id": 0,
                    "det_info": { "readout": 0 },
                    "connect_info": { "max_tr_size": 1024, "max_ev_size": 4096 }
                },
                "4": {
                    "drp_id": 1,
                    "det_info": { "readout": 1 },
                    "connect_info": { "max_tr_size": 2048, "max_ev_size": 8192 }
                }
            },
            "teb": {
                "5": { "teb_id": 0, "connect_info": { "nic_ip": "10.0.0.5" } }
            }
        })
    }

    #[test]
    fn test_parse_meb_connection() {
        let mut prms = MebParams {
            num_ev_buffers: 16,
            ..Default::default()
        };
        parse_meb_connection(&body(), "7", &mut prms).unwrap();
        assert_eq!(prms.eb.id, 2);
        assert_eq!(prms.eb.if_addr, "10.0.0.9");
        assert_eq!(prms.eb.contributors, 0b11);
        assert_eq!(prms.eb.contractors[0], 0b01);
        assert_eq!(prms.eb.contractors[1], 0b10);
        assert_eq!(prms.eb.max_tr_size[0], 1024);
        assert_eq!(prms.eb.max_tr_size[1], 2048);
        // Events dominate transitions here
        assert_eq!(prms.max_buffer_size, 4096 + 8192);
        assert_eq!(prms.eb.addrs, vec!["10.0.0.5".to_string()]);
        assert_eq!(prms.group_mask(), 0b11);
    }

    #[test]
    fn test_missing_drp_section_is_config_error() {
        let mut prms = MebParams::default();
        let mut b = body();
        b.as_object_mut().unwrap().remove("drp");
        let err = parse_meb_connection(&b, "7", &mut prms);
        assert!(matches!(err, Err(EbError::Configuration(_))));
    }

    #[test]
    fn test_out_of_range_ids_rejected() {
        let mut prms = MebParams::default();
        let mut b = body();
        b["drp"]["3"]["drp_id"] = json!(64);
        assert!(parse_meb_connection(&b, "7", &mut prms).is_err());

        let mut b = body();
        b["drp"]["3"]["det_info"]["readout"] = json!(16);
        assert!(parse_meb_connection(&b, "7", &mut prms).is_err());
    }

    #[test]
    fn test_buffer_count_validation() {
        let mut n = 4;
        validate_buffer_count(&mut n).unwrap();
        assert_eq!(n, MIN_EV_BUFFERS);

        let mut n = 255;
        validate_buffer_count(&mut n).unwrap();
        assert_eq!(n, 255);

        let mut n = 256;
        assert!(validate_buffer_count(&mut n).is_err());
    }

    #[test]
    fn test_connection_info_shape() {
        let info = connection_info("10.1.2.3", 16);
        assert_eq!(info["connect_info"]["nic_ip"], "10.1.2.3");
        assert_eq!(info["connect_info"]["buf_count"], 16);
    }
}
