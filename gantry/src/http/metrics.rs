//! Text metrics exposition and the host runtime snapshot.
//!
//! Metrics render one per line as `key{tag="v",…} value`. The `/metrics`
//! endpoint combines the server's request counters with host gauges
//! (memory, cpu, load, disk, TCP socket states) sampled via `sysinfo`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use super::HttpServer;

/// One metric line: key, value, and an ordered tag set.
#[derive(Debug, Clone, Default)]
pub struct MetricPoint {
    pub key: String,
    pub value: i64,
    pub tags: BTreeMap<String, String>,
}

impl MetricPoint {
    pub fn new(key: impl Into<String>, value: i64) -> Self {
        MetricPoint {
            key: key.into(),
            value,
            tags: BTreeMap::new(),
        }
    }

    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }
}

/// Render a single point as `key{tag="v"} value`. Empty keys render as
/// nothing.
pub fn format_metric(point: &MetricPoint) -> String {
    if point.key.is_empty() {
        return String::new();
    }
    if point.tags.is_empty() {
        return format!("{} {}", point.key, point.value);
    }
    let tags: Vec<String> = point.tags.iter().map(|(k, v)| format!(r#"{k}="{v}""#)).collect();
    format!("{}{{{}}} {}", point.key, tags.join(","), point.value)
}

/// Render the exposition document, one metric per line.
pub fn render(points: &[MetricPoint]) -> String {
    points
        .iter()
        .map(format_metric)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// TCP socket counts by state, read from `/proc/net/tcp{,6}` on Linux and
/// zero elsewhere.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TcpStats {
    pub connections: u64,
    pub listens: u64,
    pub timewaits: u64,
    pub closewaits: u64,
}

/// Point-in-time host information; also embedded in service registration
/// payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub hostname: Option<String>,
    pub cpu_count: usize,
    pub memory_total: u64,
    pub memory_used: u64,
    pub load_1: f64,
    pub load_5: f64,
    pub load_15: f64,
    pub disks: Vec<DiskInfo>,
    pub tcp: TcpStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    pub path: String,
    pub total: u64,
    pub used: u64,
}

/// Sample the host. This refreshes a fresh `sysinfo` snapshot and is not
/// cheap; callers on a hot path should sample on a timer.
pub fn runtime_info() -> RuntimeInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());
    let load = System::load_average();
    let disks = Disks::new_with_refreshed_list()
        .iter()
        .map(|disk| {
            let total = disk.total_space();
            DiskInfo {
                path: disk.mount_point().display().to_string(),
                total,
                used: total.saturating_sub(disk.available_space()),
            }
        })
        .collect();
    RuntimeInfo {
        hostname: System::host_name(),
        cpu_count: sys.cpus().len(),
        memory_total: sys.total_memory(),
        memory_used: sys.used_memory(),
        load_1: load.one,
        load_5: load.five,
        load_15: load.fifteen,
        disks,
        tcp: tcp_stats(),
    }
}

#[cfg(target_os = "linux")]
fn tcp_stats() -> TcpStats {
    let mut stats = TcpStats::default();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            // sl local_address rem_address st ...
            let Some(state) = line.split_whitespace().nth(3) else {
                continue;
            };
            match state {
                "01" => stats.connections += 1,
                "0A" => stats.listens += 1,
                "06" => stats.timewaits += 1,
                "08" => stats.closewaits += 1,
                _ => {}
            }
        }
    }
    stats
}

#[cfg(not(target_os = "linux"))]
fn tcp_stats() -> TcpStats {
    TcpStats::default()
}

/// Assemble the full metric set for one server.
pub fn collect(server: &HttpServer) -> Vec<MetricPoint> {
    let counters = server.counters();
    let runtime = runtime_info();

    let mut points = vec![
        MetricPoint::new("request_count", counters.total_count as i64),
        MetricPoint::new("request_time", counters.total_elapsed_ms as i64),
        MetricPoint::new("success_count", counters.success_count as i64),
        MetricPoint::new("success_time", counters.success_elapsed_ms as i64),
        MetricPoint::new("connections", runtime.tcp.connections as i64),
        MetricPoint::new("listens", runtime.tcp.listens as i64),
        MetricPoint::new("timewaits", runtime.tcp.timewaits as i64),
        MetricPoint::new("closewaits", runtime.tcp.closewaits as i64),
        MetricPoint::new("node_memory_total", runtime.memory_total as i64),
        MetricPoint::new("node_memory_used", runtime.memory_used as i64),
        MetricPoint::new("node_cpu_total", runtime.cpu_count as i64),
        MetricPoint::new("node_load_1", runtime.load_1 as i64),
        MetricPoint::new("node_load_5", runtime.load_5 as i64),
        MetricPoint::new("node_load_15", runtime.load_15 as i64),
    ];
    for disk in &runtime.disks {
        points.push(MetricPoint::new("current_disk_total", disk.total as i64).tag("path", &disk.path));
        points.push(MetricPoint::new("current_disk_used", disk.used as i64).tag("path", &disk.path));
    }
    points
}

/// Expose `GET /metrics` on the server.
pub fn register_metrics_service(server: &HttpServer) {
    let observed = server.clone();
    server.register_handler("/metrics", move |ctx| {
        let observed = observed.clone();
        async move {
            let body = render(&collect(&observed));
            let _ = ctx.ok("text/plain; charset=utf-8", body);
        }
    });
}
