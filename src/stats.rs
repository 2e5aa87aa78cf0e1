//! Exchange statistics for diagnostics and `--stats` output.

use std::time::Duration;

use crate::layout::Axis;

const MIB: f64 = 1024.0 * 1024.0;

/// Counters accumulated by one exchange channel.
///
/// Read-only to callers; the channel updates it on every axis exchange.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeStats {
    /// Bytes sent plus bytes received, over all axes.
    pub bytes: u64,
    /// Wall time inside whole axis exchanges (pack, transfer, unpack).
    pub comm_time: Duration,
    /// Wall time inside transport primitives only.
    pub transport_time: Duration,
    /// Completed exchanges per axis, indexed by [`Axis::index`].
    pub exchanges: [u64; 3],
    /// Device fences issued.
    pub fences: u64,
    /// Element count of one buffer per axis (0 for inactive axes).
    pub message_len: [usize; 3],
}

impl ExchangeStats {
    pub(crate) fn record(&mut self, axis: Axis, bytes: u64, total: Duration, transport: Duration) {
        self.bytes += bytes;
        self.comm_time += total;
        self.transport_time += transport;
        self.exchanges[axis.index()] += 1;
    }

    pub fn total_exchanges(&self) -> u64 {
        self.exchanges.iter().sum()
    }

    /// Aggregate throughput over time spent in communication calls.
    pub fn throughput_mib_per_sec(&self) -> f64 {
        let secs = self.comm_time.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / MIB / secs
        } else {
            0.0
        }
    }

    /// Size of one message along `axis`, in MiB.
    pub fn message_mib(&self, axis: Axis) -> f64 {
        (self.message_len[axis.index()] * std::mem::size_of::<crate::Real>()) as f64 / MIB
    }

    /// Print the stats table to stderr.
    pub fn display(&self, title: &str) {
        eprintln!();
        eprintln!("=== {title} ===");
        eprintln!("  Bytes transferred:      {}", self.bytes);
        eprintln!("  Communication time:     {:>8.3}s", self.comm_time.as_secs_f64());
        eprintln!("    Transport:            {:>8.3}s", self.transport_time.as_secs_f64());
        for axis in Axis::ALL {
            if self.message_len[axis.index()] == 0 {
                continue;
            }
            eprintln!(
                "  {axis} exchanges:           {:<6} message {:.4} MiB",
                self.exchanges[axis.index()],
                self.message_mib(axis)
            );
        }
        eprintln!("  Device fences:          {}", self.fences);
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Throughput:             {:>8.2} MiB/s", self.throughput_mib_per_sec());
    }

    /// Sum of counters across ranks; message sizes are taken from the largest.
    pub fn merge(&mut self, other: &ExchangeStats) {
        self.bytes += other.bytes;
        self.comm_time = self.comm_time.max(other.comm_time);
        self.transport_time = self.transport_time.max(other.transport_time);
        for d in 0..3 {
            self.exchanges[d] += other.exchanges[d];
            self.message_len[d] = self.message_len[d].max(other.message_len[d]);
        }
        self.fences += other.fences;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn throughput_is_zero_without_time() {
        assert_eq!(ExchangeStats::default().throughput_mib_per_sec(), 0.0);
    }

    #[test]
    fn record_accumulates_per_axis() {
        let mut stats = ExchangeStats::default();
        stats.record(Axis::X1, 2 * 1024 * 1024, Duration::from_secs(2), Duration::from_secs(1));
        stats.record(Axis::X2, 0, Duration::ZERO, Duration::ZERO);
        stats.record(Axis::X1, 0, Duration::ZERO, Duration::ZERO);
        assert_eq!(stats.exchanges, [2, 1, 0]);
        assert_eq!(stats.total_exchanges(), 3);
        assert_relative_eq!(stats.throughput_mib_per_sec(), 1.0);
    }

    #[test]
    fn message_size_in_mib() {
        let stats = ExchangeStats {
            message_len: [131_072, 0, 0],
            ..Default::default()
        };
        assert_relative_eq!(stats.message_mib(Axis::X1), 1.0);
        assert_eq!(stats.message_mib(Axis::X2), 0.0);
    }

    #[test]
    fn merge_sums_counts_and_keeps_slowest_time() {
        let mut a = ExchangeStats {
            bytes: 10,
            comm_time: Duration::from_millis(5),
            exchanges: [1, 0, 0],
            message_len: [4, 0, 0],
            ..Default::default()
        };
        let b = ExchangeStats {
            bytes: 6,
            comm_time: Duration::from_millis(9),
            exchanges: [1, 0, 0],
            message_len: [4, 0, 0],
            fences: 1,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.bytes, 16);
        assert_eq!(a.comm_time, Duration::from_millis(9));
        assert_eq!(a.exchanges[0], 2);
        assert_eq!(a.fences, 1);
    }
}
