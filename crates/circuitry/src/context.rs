// ExecContext — Explicit execution context for compile / forward / backward / update
//
// Nothing in circuitry reads ambient global state. Device choice, storage
// precision, the fused-dispatch threshold, the buffer pool and the kernel
// registry all travel in one value, so several circuits (or several
// differently-configured contexts over one circuit) coexist safely.
//
// USAGE:
//   let ctx = ExecContext::default()
//       .with_precision(DType::F64)
//       .with_fused_threshold(1 << 14);
//   let plan = circuitry::compile(&circuit, &ctx)?;
//   let lls = circuitry::forward(&plan, &batch, &ctx)?;

use std::fmt;
use std::sync::Arc;

use circuitry_core::{DType, Error, Result};

use crate::dispatch::KernelRegistry;
use crate::memory::BufferPool;

/// Default minimum `node_count × batch_size` for fused dispatch.
pub const DEFAULT_FUSED_THRESHOLD: usize = 4096;

/// Default largest sum/product arity the fused kernels accept.
pub const DEFAULT_MAX_FUSED_ARITY: usize = 256;

/// Where layers execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Host, single thread. Fused kernels are never selected.
    Cpu,
    /// Host, data-parallel over a rayon pool. `threads == 0` uses the global pool.
    Parallel { threads: usize },
}

impl Device {
    pub fn name(&self) -> String {
        match self {
            Device::Cpu => "cpu".to_string(),
            Device::Parallel { threads: 0 } => "cpu-parallel".to_string(),
            Device::Parallel { threads } => format!("cpu-parallel:{threads}"),
        }
    }

    /// What the dispatcher may assume about this device.
    pub fn capabilities(&self) -> DeviceCaps {
        match self {
            Device::Cpu => DeviceCaps {
                parallel: false,
                max_fused_arity: 0,
            },
            Device::Parallel { .. } => DeviceCaps {
                parallel: true,
                max_fused_arity: DEFAULT_MAX_FUSED_ARITY,
            },
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Device capabilities consulted by the kernel dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCaps {
    /// Whether data-parallel kernels can run.
    pub parallel: bool,
    /// Largest layer arity a fused kernel may be launched with.
    pub max_fused_arity: usize,
}

/// Execution context passed through every engine call.
#[derive(Clone)]
pub struct ExecContext {
    device: Device,
    precision: DType,
    fused_threshold: usize,
    pool: Arc<BufferPool>,
    kernels: Arc<KernelRegistry>,
    threads: Option<Arc<rayon::ThreadPool>>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            device: Device::Parallel { threads: 0 },
            precision: DType::F32,
            fused_threshold: DEFAULT_FUSED_THRESHOLD,
            pool: Arc::new(BufferPool::new()),
            kernels: Arc::new(KernelRegistry::standard()),
            threads: None,
        }
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("device", &self.device)
            .field("precision", &self.precision)
            .field("fused_threshold", &self.fused_threshold)
            .field("kernels", &self.kernels)
            .finish()
    }
}

impl ExecContext {
    /// Single-threaded host context.
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            ..Self::default()
        }
    }

    /// Context on the given device. Builds a dedicated thread pool when the
    /// device asks for a fixed number of threads.
    pub fn new(device: Device) -> Result<Self> {
        let threads = match device {
            Device::Parallel { threads } if threads > 0 => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| Error::msg(format!("thread pool creation failed: {e}")))?,
            )),
            _ => None,
        };
        Ok(Self {
            device,
            threads,
            ..Self::default()
        })
    }

    /// Set the storage precision used for persisted parameters.
    pub fn with_precision(mut self, precision: DType) -> Self {
        self.precision = precision;
        self
    }

    /// Fused kernels run once `node_count × batch_size` exceeds `threshold`.
    pub fn with_fused_threshold(mut self, threshold: usize) -> Self {
        self.fused_threshold = threshold;
        self
    }

    /// Share a buffer pool with other contexts.
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the kernel registry (e.g. to add a fused kernel).
    pub fn with_kernels(mut self, kernels: KernelRegistry) -> Self {
        self.kernels = Arc::new(kernels);
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn capabilities(&self) -> DeviceCaps {
        self.device.capabilities()
    }

    pub fn precision(&self) -> DType {
        self.precision
    }

    pub fn fused_threshold(&self) -> usize {
        self.fused_threshold
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn pool_handle(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    pub fn kernels(&self) -> &Arc<KernelRegistry> {
        &self.kernels
    }

    /// Run `op` on this context's thread pool (or the caller's pool).
    pub fn install<R, F>(&self, op: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.threads {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        assert!(!Device::Cpu.capabilities().parallel);
        assert_eq!(Device::Cpu.capabilities().max_fused_arity, 0);
        let caps = Device::Parallel { threads: 0 }.capabilities();
        assert!(caps.parallel);
        assert_eq!(caps.max_fused_arity, DEFAULT_MAX_FUSED_ARITY);
    }

    #[test]
    fn test_builder() {
        let ctx = ExecContext::cpu()
            .with_precision(DType::F64)
            .with_fused_threshold(10);
        assert_eq!(ctx.device(), Device::Cpu);
        assert_eq!(ctx.precision(), DType::F64);
        assert_eq!(ctx.fused_threshold(), 10);
    }

    #[test]
    fn test_dedicated_pool() {
        let ctx = ExecContext::new(Device::Parallel { threads: 2 }).unwrap();
        let n = ctx.install(rayon::current_num_threads);
        assert_eq!(n, 2);
        assert_eq!(ctx.device().to_string(), "cpu-parallel:2");
    }
}
