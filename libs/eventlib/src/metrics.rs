// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Run-time monitoring counters
//!
//! Metric names used across the data path, recorded through the `metrics`
//! facade. The process binary decides where they go (normally a prometheus
//! exporter); the library only records.

use std::io::Write;
use std::path::Path;

use crate::error::Result;

pub const CTRB_EVENTS: &str = "ctrb_events_total";
pub const CTRB_BATCHES: &str = "ctrb_batches_posted_total";

pub const EB_EVENTS_BUILT: &str = "eb_events_built_total";
pub const EB_EVENTS_FIXED_UP: &str = "eb_events_fixed_up_total";
pub const EB_LATE_CONTRIBUTIONS: &str = "eb_late_contributions_total";
pub const EB_SOURCE_MISMATCHES: &str = "eb_source_mismatches_total";

pub const MON_EVENTS_PUBLISHED: &str = "mon_events_published_total";
pub const MON_REQUESTS_POSTED: &str = "mon_requests_posted_total";
pub const MON_REQUESTS_SKIPPED: &str = "mon_requests_skipped_total";
pub const MON_DOUBLE_FREES: &str = "mon_double_frees_total";

/// Register help text for every metric this crate records.
pub fn describe() {
    metrics::describe_counter!(CTRB_EVENTS, "Contributions fed to the poster");
    metrics::describe_counter!(CTRB_BATCHES, "Batches posted to event builders");
    metrics::describe_counter!(EB_EVENTS_BUILT, "Events dispatched downstream");
    metrics::describe_counter!(
        EB_EVENTS_FIXED_UP,
        "Events retired with missing contributions"
    );
    metrics::describe_counter!(
        EB_LATE_CONTRIBUTIONS,
        "Contributions arriving after retirement"
    );
    metrics::describe_counter!(
        EB_SOURCE_MISMATCHES,
        "Contributions whose source was not under contract"
    );
    metrics::describe_counter!(MON_EVENTS_PUBLISHED, "Built events handed to consumers");
    metrics::describe_counter!(MON_REQUESTS_POSTED, "Monitor buffer requests posted");
    metrics::describe_counter!(
        MON_REQUESTS_SKIPPED,
        "Monitor buffer requests skipped for lack of credit"
    );
    metrics::describe_counter!(MON_DOUBLE_FREES, "Rejected double frees of monitor buffers");
}

/// Write a prometheus scrape-target stanza for this process.
///
/// Deployments that discover scrape targets through a config directory get
/// one file per process, named after the host.
pub fn write_scrape_target(dir: &Path, instance: u32, port: u16) -> Result<std::path::PathBuf> {
    let host = hostname();
    let path = dir.join(format!("daqmon_{host}_{instance}.yaml"));
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "- targets:\n    - '{host}:{port}'")?;
    Ok(path)
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
