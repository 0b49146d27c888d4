//! Periodic progress monitor.
//!
//! An optional worker logging throughput and stage positions at a fixed
//! interval, driven by the executor's metrics snapshots.

use std::thread;
use std::time::Duration;

use log::info;

use tspipe_core::executor::MetricsHandle;
use tspipe_core::packet::TS_PACKET_SIZE;

/// Reporting interval.
const INTERVAL: Duration = Duration::from_secs(5);

/// Spawn the monitor thread. It stops by itself once the pipeline has
/// fully terminated.
pub fn spawn(metrics: MetricsHandle) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("ts-monitor".into())
        .spawn(move || run(metrics))
        .unwrap_or_else(|e| panic!("cannot spawn monitor thread: {e}"))
}

fn run(metrics: MetricsHandle) {
    let mut last_output = 0u64;
    while !metrics.finished() {
        thread::sleep(INTERVAL);
        let snap = metrics.metrics();
        let Some(output) = snap.stages.last() else {
            break;
        };
        let delta = output.cursor.saturating_sub(last_output);
        last_output = output.cursor;
        let rate = delta * TS_PACKET_SIZE as u64 * 8 / INTERVAL.as_secs();
        let positions: Vec<String> = snap
            .stages
            .iter()
            .map(|s| format!("{}={}", s.name, s.cursor))
            .collect();
        info!(
            "monitor: {} pkts out, {rate} b/s ({}), declared bitrate {} b/s",
            output.cursor,
            positions.join(" "),
            snap.bitrate
        );
    }
}
