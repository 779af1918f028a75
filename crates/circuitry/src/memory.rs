// Memory — Buffer pool and layer-lifetime plan
//
// Every layer produces one node-major value buffer `[num_nodes × batch]`
// during forward. Backward adds a node-flow buffer per layer and an edge-flow
// buffer `[num_edges × batch]` per product/sum layer.
//
// Lifetimes are fixed by the layer order, so they are planned once at compile
// time:
//
//   forward  — a value buffer dies after its last consumer layer ran, unless
//              the pass retains values for backward (or sampling)
//   backward — an edge-flow buffer dies after the last child layer gathered
//              from it; a node-flow buffer dies right after its own layer
//              turned it into edge flows (unless node flows were requested)
//
// Released buffers go back to a `BufferPool`: free lists keyed by element
// count, so the next pass (or the next mini-batch of the same size) reuses
// them without touching the allocator.
//
// Usage:
//
//   let pool = BufferPool::new();
//   let buf = pool.alloc(1024);          // from cache if possible
//   pool.reclaim(buf);                   // back into the cache
//   let stats = pool.stats();
//   pool.empty_cache();

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::compile::Layer;

// Pool statistics

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes currently held in the cache.
    pub cached_bytes: usize,
    /// Number of buffers currently in the cache.
    pub cached_buffers: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that fell through to the allocator.
    pub misses: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BufferPool: {} buffers / {} bytes cached, {} hits, {} misses",
            self.cached_buffers, self.cached_bytes, self.hits, self.misses
        )
    }
}

// BufferPool

/// Caching allocator for layer buffers.
pub struct BufferPool {
    buckets: Mutex<HashMap<usize, Vec<Vec<f64>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stats())
    }
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            buckets: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    // A panic while holding the lock leaves only whole buffers behind.
    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Vec<Vec<f64>>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_pop(&self, n: usize) -> Option<Vec<f64>> {
        self.lock().get_mut(&n).and_then(|stack| stack.pop())
    }

    /// Allocate `n` elements. Contents are unspecified.
    pub fn alloc(&self, n: usize) -> Vec<f64> {
        if let Some(buf) = self.try_pop(n) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            vec![0.0; n]
        }
    }

    /// Allocate `n` zeroed elements.
    pub fn alloc_zeroed(&self, n: usize) -> Vec<f64> {
        let mut buf = self.alloc(n);
        buf.fill(0.0);
        buf
    }

    /// Return a buffer to the cache.
    pub fn reclaim(&self, buf: Vec<f64>) {
        if buf.is_empty() {
            return;
        }
        self.lock().entry(buf.len()).or_default().push(buf);
    }

    pub fn stats(&self) -> PoolStats {
        let map = self.lock();
        let mut cached_buffers = 0usize;
        let mut elems = 0usize;
        for (n, stack) in map.iter() {
            cached_buffers += stack.len();
            elems += n * stack.len();
        }
        PoolStats {
            cached_bytes: elems * std::mem::size_of::<f64>(),
            cached_buffers,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached buffer. Returns the number of bytes released.
    pub fn empty_cache(&self) -> usize {
        let mut map = self.lock();
        let mut elems = 0usize;
        for (n, stack) in map.drain() {
            elems += n * stack.len();
        }
        elems * std::mem::size_of::<f64>()
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

// MemoryPlan — compile-time buffer lifetimes

/// Buffer release points derived from the layer order.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlan {
    /// Value buffers that can be released once layer `l` has run forward.
    pub forward_free_after: Vec<Vec<usize>>,
    /// Edge-flow buffers that can be released once layer `l` gathered its flows.
    pub edge_free_after: Vec<Vec<usize>>,
    /// Largest number of live value cells per example in a non-retaining forward.
    pub peak_forward_cells: usize,
    /// Live value cells per example when every layer is retained.
    pub retained_cells: usize,
}

impl MemoryPlan {
    pub fn build(layers: &[Layer]) -> Self {
        let n = layers.len();

        // Forward: a value buffer is dead after its highest-indexed consumer.
        let mut forward_free_after = vec![Vec::new(); n];
        for layer in layers {
            if let Some(&c) = layer.consumers.last() {
                forward_free_after[c].push(layer.index);
            }
        }

        let mut live = 0usize;
        let mut peak = 0usize;
        for layer in layers {
            live += layer.num_nodes();
            peak = peak.max(live);
            for &dead in &forward_free_after[layer.index] {
                live -= layers[dead].num_nodes();
            }
        }

        // Backward runs layers in reverse: an edge-flow buffer of layer `p` is
        // read by each producer of `p`, the lowest-indexed one last.
        let mut edge_free_after = vec![Vec::new(); n];
        for layer in layers {
            if let Some(&c) = layer.producers.first() {
                edge_free_after[c].push(layer.index);
            }
        }

        MemoryPlan {
            forward_free_after,
            edge_free_after,
            peak_forward_cells: peak,
            retained_cells: layers.iter().map(Layer::num_nodes).sum(),
        }
    }
}

// LayerBuffers — runtime buffer table

/// One buffer slot per layer, backed by a pool. Anything still held on drop
/// goes back to the pool.
pub(crate) struct LayerBuffers {
    pool: Arc<BufferPool>,
    bufs: Vec<Option<Vec<f64>>>,
}

impl LayerBuffers {
    pub fn new(pool: Arc<BufferPool>, num_layers: usize) -> Self {
        Self {
            pool,
            bufs: vec![None; num_layers],
        }
    }

    pub fn alloc(&self, n: usize) -> Vec<f64> {
        self.pool.alloc(n)
    }

    pub fn put(&mut self, layer: usize, buf: Vec<f64>) {
        if let Some(old) = self.bufs[layer].replace(buf) {
            self.pool.reclaim(old);
        }
    }

    pub fn get(&self, layer: usize) -> Option<&[f64]> {
        self.bufs[layer].as_deref()
    }

    pub fn slots(&self) -> &[Option<Vec<f64>>] {
        &self.bufs
    }

    pub fn take(&mut self, layer: usize) -> Option<Vec<f64>> {
        self.bufs[layer].take()
    }

    pub fn release(&mut self, layer: usize) {
        if let Some(buf) = self.take(layer) {
            self.pool.reclaim(buf);
        }
    }

    pub fn recycle(&self, buf: Vec<f64>) {
        self.pool.reclaim(buf);
    }
}

impl Drop for LayerBuffers {
    fn drop(&mut self) {
        for buf in self.bufs.iter_mut().filter_map(Option::take) {
            self.pool.reclaim(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuse() {
        let pool = BufferPool::new();
        let a = pool.alloc(16);
        assert_eq!(pool.stats().misses, 1);
        pool.reclaim(a);
        assert_eq!(pool.stats().cached_buffers, 1);
        assert_eq!(pool.stats().cached_bytes, 16 * 8);

        let b = pool.alloc_zeroed(16);
        assert!(b.iter().all(|v| *v == 0.0));
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.cached_buffers, 0);

        // Different size misses.
        pool.reclaim(b);
        let _c = pool.alloc(8);
        assert_eq!(pool.stats().misses, 2);
        assert_eq!(pool.empty_cache(), 16 * 8);
        assert_eq!(pool.stats().cached_buffers, 0);
    }

    #[test]
    fn test_layer_buffers_return_on_drop() {
        let pool = Arc::new(BufferPool::new());
        {
            let mut bufs = LayerBuffers::new(pool.clone(), 2);
            let a = bufs.alloc(4);
            bufs.put(0, a);
            let b = bufs.alloc(6);
            bufs.put(1, b);
            assert_eq!(bufs.get(1).map(<[f64]>::len), Some(6));
            bufs.release(0);
            assert!(bufs.get(0).is_none());
        }
        assert_eq!(pool.stats().cached_buffers, 2);
    }
}
