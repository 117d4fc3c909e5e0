//! Per-CPU utilization from `/proc/stat` deltas

use std::collections::HashMap;

/// Cumulative jiffies of one CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Parsed `/proc/stat`
#[derive(Debug, Default)]
pub(crate) struct ProcStat {
    pub cpus: HashMap<usize, CpuTimes>,
    pub context_switches: u64,
}

impl ProcStat {
    pub fn parse(contents: &str) -> Self {
        let mut stat = ProcStat::default();

        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let Some(label) = fields.next() else {
                continue;
            };

            if label == "ctxt" {
                stat.context_switches = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                continue;
            }

            let Some(cpu) = label.strip_prefix("cpu").and_then(|id| id.parse::<usize>().ok()) else {
                continue;
            };

            // user nice system idle iowait irq softirq steal
            let values: Vec<u64> = fields.take(8).filter_map(|v| v.parse().ok()).collect();
            if values.len() < 4 {
                continue;
            }
            let idle = values[3] + values.get(4).copied().unwrap_or(0);
            let total = values.iter().sum();
            stat.cpus.insert(cpu, CpuTimes { idle, total });
        }

        stat
    }
}

/// Utilization between two samples, 0.0 when no time elapsed
pub(crate) fn utilization(prev: CpuTimes, now: CpuTimes) -> f64 {
    let total = now.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let idle = now.idle.saturating_sub(prev.idle);
    (1.0 - idle as f64 / total as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_delta() {
        let first = ProcStat::parse(
            "cpu  10 0 10 80 0 0 0 0 0 0\ncpu0 10 0 10 80 0 0 0 0 0 0\nctxt 1000\nbtime 1\n",
        );
        let second = ProcStat::parse("cpu0 60 0 10 130 0 0 0 0 0 0\nctxt 1500\n");

        assert_eq!(first.cpus.len(), 1);
        assert_eq!(first.context_switches, 1000);

        let load = utilization(first.cpus[&0], second.cpus[&0]);
        assert!((load - 0.5).abs() < 1e-9);
        assert_eq!(utilization(first.cpus[&0], first.cpus[&0]), 0.0);
    }
}
