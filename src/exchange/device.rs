//! Data-parallel execution layer for the pack/unpack kernels.
//!
//! Kernels are expressed as a body applied to disjoint mutable rows of a
//! flat array. `Serial` runs them in order on the calling thread; `Rayon`
//! spreads the rows over a dedicated thread pool. Work dispatched to a
//! device is only guaranteed visible to the transport after [`Device::fence`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{HaloError, Result};
use crate::Real;

#[derive(Clone, Debug)]
enum Backend {
    Serial,
    Rayon(Arc<rayon::ThreadPool>),
}

#[derive(Clone, Debug)]
pub struct Device {
    backend: Backend,
    launches: Arc<AtomicU64>,
    fences: Arc<AtomicU64>,
}

impl Device {
    pub fn serial() -> Self {
        Self::with_backend(Backend::Serial)
    }

    /// Rayon pool with `threads` workers (0 lets rayon pick).
    pub fn rayon(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("gridhalo-device-{i}"))
            .build()
            .map_err(|e| HaloError::Config(format!("failed to build device thread pool: {e}")))?;
        Ok(Self::with_backend(Backend::Rayon(Arc::new(pool))))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            launches: Arc::new(AtomicU64::new(0)),
            fences: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.backend {
            Backend::Serial => "serial",
            Backend::Rayon(_) => "rayon",
        }
    }

    /// Apply `body(row_index, row)` to every `row_len`-sized chunk of `data`.
    pub fn for_each_row<F>(&self, label: &'static str, data: &mut [Real], row_len: usize, body: F)
    where
        F: Fn(usize, &mut [Real]) + Send + Sync,
    {
        if row_len == 0 || data.is_empty() {
            return;
        }
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kernel = label, rows = data.len() / row_len, "launch");
        match &self.backend {
            Backend::Serial => {
                for (row, chunk) in data.chunks_mut(row_len).enumerate() {
                    body(row, chunk);
                }
            }
            Backend::Rayon(pool) => pool.install(|| {
                data.par_chunks_mut(row_len)
                    .enumerate()
                    .for_each(|(row, chunk)| body(row, chunk));
            }),
        }
    }

    /// Apply `body` to each independent work item, e.g. disjoint rows
    /// gathered from a larger array.
    pub fn for_each_task<I, F>(&self, label: &'static str, tasks: Vec<I>, body: F)
    where
        I: Send,
        F: Fn(I) + Send + Sync,
    {
        if tasks.is_empty() {
            return;
        }
        self.launches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(kernel = label, tasks = tasks.len(), "launch");
        match &self.backend {
            Backend::Serial => tasks.into_iter().for_each(body),
            Backend::Rayon(pool) => pool.install(|| tasks.into_par_iter().for_each(body)),
        }
    }

    /// Block until all kernels dispatched so far have retired.
    pub fn fence(&self) {
        // Both backends retire work before `for_each_row` returns; the fence
        // is the point after which buffers may be handed to the transport.
        self.fences.fetch_add(1, Ordering::Release);
        tracing::trace!(device = self.name(), "fence");
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    pub fn fences(&self) -> u64 {
        self.fences.load(Ordering::Acquire)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::serial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_rows(device: &Device) -> Vec<f64> {
        let mut data = vec![0.0; 12];
        device.for_each_row("fill", &mut data, 4, |row, chunk| {
            for (i, v) in chunk.iter_mut().enumerate() {
                *v = (row * 10 + i) as f64;
            }
        });
        data
    }

    #[test]
    fn serial_and_rayon_agree() {
        let serial = fill_rows(&Device::serial());
        let parallel = fill_rows(&Device::rayon(2).unwrap());
        assert_eq!(serial, parallel);
        assert_eq!(serial[5], 11.0);
    }

    #[test]
    fn counts_launches_and_fences() {
        let device = Device::serial();
        fill_rows(&device);
        device.fence();
        assert_eq!(device.launches(), 1);
        assert_eq!(device.fences(), 1);
    }

    #[test]
    fn tasks_run_on_both_backends() {
        for device in [Device::serial(), Device::rayon(2).unwrap()] {
            let mut data = vec![0.0; 6];
            let (a, b) = data.split_at_mut(3);
            device.for_each_task("tasks", vec![(a, 1.0), (b, 2.0)], |(row, v)| row.fill(v));
            assert_eq!(data, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0], "{}", device.name());
            assert_eq!(device.launches(), 1);
        }
    }

    #[test]
    fn empty_dispatch_is_not_a_launch() {
        let device = Device::serial();
        let mut data: Vec<f64> = Vec::new();
        device.for_each_row("noop", &mut data, 4, |_, _| unreachable!());
        assert_eq!(device.launches(), 0);
    }
}
