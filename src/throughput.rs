//! Per-block confirmation counts and windowed averages

use parking_lot::Mutex;

/// Number of blocks kept in the ring
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    block: u64,
    count: u64,
}

#[derive(Debug)]
struct Ring {
    samples: Vec<Sample>,
    head: usize,
    len: usize,
}

/// Fixed-capacity ring of (block, confirmed count) samples
#[derive(Debug)]
pub struct ThroughputTracker {
    ring: Mutex<Ring>,
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ThroughputTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                samples: vec![Sample::default(); capacity],
                head: 0,
                len: 0,
            }),
        }
    }

    /// Add `count` confirmations to `block`, merging into an existing sample
    pub fn record_completion(&self, block: u64, count: u64) {
        let mut ring = self.ring.lock();
        let capacity = ring.samples.len();

        // Newest entries sit right behind the head; search backwards
        for offset in 1..=ring.len {
            let idx = (ring.head + capacity - offset) % capacity;
            if ring.samples[idx].block == block {
                ring.samples[idx].count += count;
                return;
            }
        }

        let head = ring.head;
        ring.samples[head] = Sample { block, count };
        ring.head = (head + 1) % capacity;
        if ring.len < capacity {
            ring.len += 1;
        }
    }

    /// Average confirmations per block over `(current_block - window, current_block]`.
    ///
    /// Divides by `window` rather than by the number of recorded blocks, so
    /// blocks without samples pull the average down.
    pub fn average_over(&self, window: u64, current_block: u64) -> f64 {
        if window == 0 || current_block == 0 {
            return 0.0;
        }
        let ring = self.ring.lock();
        if ring.len == 0 {
            return 0.0;
        }

        let capacity = ring.samples.len();
        let total: u64 = (1..=ring.len)
            .map(|offset| ring.samples[(ring.head + capacity - offset) % capacity])
            .filter(|s| s.block <= current_block && s.block + window > current_block)
            .map(|s| s.count)
            .sum();

        total as f64 / window as f64
    }

    /// Samples currently held
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
