/// Worker thread count for the tokio runtime and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerThreads {
    pub count: usize,
    pub source: &'static str,
}

/// Size the worker pool from the container CPU limit, so a gateway limited
/// to 2 cores on a 64-core host does not start 64 workers.
///
/// Detection order: `TOLLGATE_CPU_LIMIT` (`"2"`, `"1.5"` or `"1500m"`),
/// cgroup v2 `cpu.max`, cgroup v1 CFS quota, then the host CPU count.
/// Fractional limits round up.
pub fn worker_threads() -> WorkerThreads {
    let detected = std::env::var("TOLLGATE_CPU_LIMIT")
        .ok()
        .and_then(|v| parse_cpu_value(&v))
        .map(|n| (n, "env"))
        .or_else(|| {
            std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
                .ok()
                .and_then(|c| parse_cgroup_v2(&c))
                .map(|n| (n, "cgroup-v2"))
        })
        .or_else(|| {
            let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
            let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
            parse_cgroup_v1(&quota, &period).map(|n| (n, "cgroup-v1"))
        });

    let (count, source) = detected.unwrap_or_else(|| {
        let host = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        (host, "host")
    });

    // Runs before tracing is initialized.
    let threads = WorkerThreads {
        count: count.max(1),
        source,
    };
    eprintln!(
        "[runtime] worker threads: {} (source: {})",
        threads.count, threads.source
    );
    threads
}

fn ceil_div(quota: u64, period: u64) -> usize {
    quota.div_ceil(period) as usize
}

/// `"2"` or `"1.5"` (cores) or `"1500m"` (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(milli) = value.strip_suffix('m') {
        let milli: u64 = milli.parse().ok()?;
        return (milli > 0).then(|| ceil_div(milli, 1000));
    }
    let cores: f64 = value.parse().ok()?;
    (cores.is_finite() && cores > 0.0).then(|| cores.ceil() as usize)
}

/// cgroup v2 `cpu.max`: `"<quota> <period>"`, or `"max <period>"` when
/// unlimited.
fn parse_cgroup_v2(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: u64 = parts.next()?.parse().ok()?;
    if quota == "max" || period == 0 {
        return None;
    }
    let quota: u64 = quota.parse().ok()?;
    (quota > 0).then(|| ceil_div(quota, period))
}

/// cgroup v1 quota and period files; a quota of -1 means unlimited.
fn parse_cgroup_v1(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    (quota > 0 && period > 0).then(|| ceil_div(quota as u64, period as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_value_formats() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value(" 1.5 "), Some(2));
        assert_eq!(parse_cpu_value("2500m"), Some(3));
        assert_eq!(parse_cpu_value("500m"), Some(1));
        assert_eq!(parse_cpu_value("0"), None);
        assert_eq!(parse_cpu_value("0m"), None);
        assert_eq!(parse_cpu_value("lots"), None);
    }

    #[test]
    fn test_cgroup_v2() {
        assert_eq!(parse_cgroup_v2("400000 100000\n"), Some(4));
        assert_eq!(parse_cgroup_v2("150000 100000"), Some(2));
        assert_eq!(parse_cgroup_v2("max 100000"), None);
        assert_eq!(parse_cgroup_v2("100000 0"), None);
        assert_eq!(parse_cgroup_v2(""), None);
    }

    #[test]
    fn test_cgroup_v1() {
        assert_eq!(parse_cgroup_v1("200000\n", "100000\n"), Some(2));
        assert_eq!(parse_cgroup_v1("50000", "100000"), Some(1));
        assert_eq!(parse_cgroup_v1("-1", "100000"), None);
    }
}
