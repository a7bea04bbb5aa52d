//! The compute device every plan runs on.
//! A dedicated worker pool for data-parallel kernel launches,
//! plus a ledger of how much workspace memory live plans hold.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use indexmap::IndexMap;

use crate::error::{AllocationError, ConfigurationError};

pub(crate) struct Device {
    pool: rayon::ThreadPool,
    ledger: Arc<Ledger>,
}

impl Device {
    pub(crate) fn new(threads: usize, memory_limit: Option<usize>) -> Result<Self, ConfigurationError> {
        if memory_limit == Some(0) {
            return Err(ConfigurationError::InvalidMemoryLimit);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lsqgrid-device-{i}"))
            .build()
            .map_err(|e| ConfigurationError::DevicePool(e.to_string()))?;
        Ok(Self {
            pool,
            ledger: Arc::new(Ledger {
                bytes: AtomicUsize::new(0),
                buffers: AtomicUsize::new(0),
                limit: memory_limit,
            }),
        })
    }

    pub(crate) fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub(crate) fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            bytes: self.ledger.bytes.load(Ordering::Acquire),
            buffers: self.ledger.buffers.load(Ordering::Acquire),
        }
    }

    /// Reserve workspace for a plan. Either the whole request fits or nothing is taken.
    pub(crate) fn reserve(&self, bytes: usize, buffers: usize) -> Result<Lease, AllocationError> {
        let ledger = &self.ledger;
        let mut current = ledger.bytes.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .ok_or(AllocationError::SizeOverflow)?;
            if let Some(limit) = ledger.limit.filter(|&limit| next > limit) {
                return Err(AllocationError::DeviceMemoryExhausted {
                    requested: bytes,
                    available: limit.saturating_sub(current),
                });
            }
            match ledger.bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        ledger.buffers.fetch_add(buffers, Ordering::AcqRel);
        Ok(Lease {
            ledger: Arc::clone(ledger),
            bytes,
            buffers,
        })
    }

    /// Run host orchestration on the device, so reductions use its workers.
    pub(crate) fn run<T, F>(&self, f: F) -> T
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        self.pool.install(f)
    }

    /// Run one kernel on the device, timing it if the plan collects timings.
    pub(crate) fn launch<T, F>(&self, timings: &mut Option<KernelTimings>, name: &str, kernel: F) -> T
    where
        T: Send,
        F: FnOnce() -> T + Send,
    {
        match timings {
            None => self.pool.install(kernel),
            Some(timings) => {
                let start = Instant::now();
                let out = self.pool.install(kernel);
                timings.record(name, start.elapsed());
                out
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("threads", &self.threads())
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

struct Ledger {
    bytes: AtomicUsize,
    buffers: AtomicUsize,
    limit: Option<usize>,
}

/// Workspace memory held by one plan.
/// Dropping it gives the memory back to the device.
pub(crate) struct Lease {
    ledger: Arc<Ledger>,
    bytes: usize,
    buffers: usize,
}

impl Lease {
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ledger.bytes.fetch_sub(self.bytes, Ordering::AcqRel);
        self.ledger.buffers.fetch_sub(self.buffers, Ordering::AcqRel);
    }
}

/// Workspace memory currently held by live plans on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MemoryUsage {
    /// Bytes reserved.
    pub bytes: usize,
    /// Buffers allocated.
    pub buffers: usize,
}

/// How long one kind of kernel has run.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct KernelTiming {
    /// Number of launches.
    pub launches: u64,
    /// Total wall time across every launch.
    pub total: Duration,
}

impl KernelTiming {
    /// Mean wall time of one launch.
    pub fn mean(&self) -> Duration {
        if self.launches == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.total.as_secs_f64() / self.launches as f64)
        }
    }
}

/// Per-kernel timings, in order of first launch.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct KernelTimings {
    kernels: IndexMap<String, KernelTiming>,
}

impl KernelTimings {
    fn record(&mut self, name: &str, elapsed: Duration) {
        let entry = match self.kernels.get_mut(name) {
            Some(entry) => entry,
            None => self.kernels.entry(name.to_owned()).or_default(),
        };
        entry.launches += 1;
        entry.total += elapsed;
    }

    /// Look up one kernel's timing.
    pub fn get(&self, name: &str) -> Option<&KernelTiming> {
        self.kernels.get(name)
    }

    /// Every kernel, in order of first launch.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KernelTiming)> {
        self.kernels.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// How many distinct kernels ran.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// True if nothing has run yet.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Total wall time across every kernel.
    pub fn total(&self) -> Duration {
        self.kernels.values().map(|t| t.total).sum()
    }
}

impl std::fmt::Display for KernelTimings {
    #[mutants::skip]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<24}  {:>8}  {:>12}  {:>12}",
            "kernel", "launches", "total", "mean"
        )?;
        for (name, t) in &self.kernels {
            writeln!(
                f,
                "{:<24}  {:>8}  {:>10.3}ms  {:>10.3}us",
                name,
                t.launches,
                t.total.as_secs_f64() * 1e3,
                t.mean().as_secs_f64() * 1e6
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_returned_on_drop() {
        let device = Device::new(1, None).unwrap();
        let lease = device.reserve(100, 3).unwrap();
        assert_eq!(
            device.usage(),
            MemoryUsage {
                bytes: 100,
                buffers: 3
            }
        );
        drop(lease);
        assert_eq!(device.usage(), MemoryUsage::default());
    }

    #[test]
    fn over_budget_takes_nothing() {
        let device = Device::new(1, Some(150)).unwrap();
        let _held = device.reserve(100, 1).unwrap();
        let err = device.reserve(100, 1).err().unwrap();
        assert_eq!(
            err,
            AllocationError::DeviceMemoryExhausted {
                requested: 100,
                available: 50
            }
        );
        assert_eq!(device.usage().bytes, 100);
    }

    #[test]
    fn zero_limit_is_rejected() {
        assert!(matches!(
            Device::new(1, Some(0)),
            Err(ConfigurationError::InvalidMemoryLimit)
        ));
    }

    #[test]
    fn launches_are_timed_when_asked() {
        let device = Device::new(2, None).unwrap();
        let mut off = None;
        assert_eq!(device.launch(&mut off, "k", || 3), 3);
        let mut on = Some(KernelTimings::default());
        device.launch(&mut on, "residual[0]", || ());
        device.launch(&mut on, "residual[0]", || ());
        device.launch(&mut on, "jacobian[0]", || ());
        let on = on.unwrap();
        assert_eq!(on.len(), 2);
        assert_eq!(on.get("residual[0]").unwrap().launches, 2);
        assert_eq!(on.iter().next().unwrap().0, "residual[0]");

        let json = serde_json::to_value(&on).unwrap();
        assert_eq!(json["kernels"]["residual[0]"]["launches"], 2);
    }

    #[test]
    fn mean_survives_huge_launch_counts() {
        let timing = KernelTiming {
            launches: 1 << 32,
            total: Duration::from_secs(1 << 33),
        };
        assert_eq!(timing.mean(), Duration::from_secs(2));
        assert_eq!(KernelTiming::default().mean(), Duration::ZERO);
    }
}
