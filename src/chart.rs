//! Bounded buffers of recent samples for live charts.
//!
//! The scheduler owns the only `ChartBuffer`; everything else reads through
//! cloned `ChartReader` handles.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::store::{Sample, SpeedTestResult};

/// Speed-test results kept for charting.
pub const SPEED_TEST_CAPACITY: usize = 50;

#[derive(Debug)]
struct Buffers {
    samples: VecDeque<Sample>,
    speed_tests: VecDeque<SpeedTestResult>,
    sample_capacity: usize,
}

/// Writer side of the chart buffers.
#[derive(Debug)]
pub struct ChartBuffer {
    inner: Arc<RwLock<Buffers>>,
}

/// Read-only view of the chart buffers.
#[derive(Debug, Clone)]
pub struct ChartReader {
    inner: Arc<RwLock<Buffers>>,
}

impl ChartBuffer {
    /// Create a buffer holding at most `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(Buffers {
                samples: VecDeque::with_capacity(capacity),
                speed_tests: VecDeque::with_capacity(SPEED_TEST_CAPACITY),
                sample_capacity: capacity,
            })),
        }
    }

    pub fn reader(&self) -> ChartReader {
        ChartReader {
            inner: self.inner.clone(),
        }
    }

    pub async fn push_sample(&self, sample: Sample) {
        let mut buffers = self.inner.write().await;
        if buffers.samples.len() == buffers.sample_capacity {
            buffers.samples.pop_front();
        }
        buffers.samples.push_back(sample);
    }

    pub async fn push_speed_test(&self, result: SpeedTestResult) {
        let mut buffers = self.inner.write().await;
        if buffers.speed_tests.len() == SPEED_TEST_CAPACITY {
            buffers.speed_tests.pop_front();
        }
        buffers.speed_tests.push_back(result);
    }

    pub async fn clear(&self) {
        let mut buffers = self.inner.write().await;
        buffers.samples.clear();
        buffers.speed_tests.clear();
    }
}

impl ChartReader {
    /// Samples oldest first.
    pub async fn samples(&self) -> Vec<Sample> {
        self.inner.read().await.samples.iter().cloned().collect()
    }

    /// Speed-test results oldest first.
    pub async fn speed_tests(&self) -> Vec<SpeedTestResult> {
        self.inner.read().await.speed_tests.iter().cloned().collect()
    }

    pub async fn latest(&self) -> Option<Sample> {
        self.inner.read().await.samples.back().cloned()
    }

    pub async fn capacity(&self) -> usize {
        self.inner.read().await.sample_capacity
    }
}
