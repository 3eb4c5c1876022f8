use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded ring of the most recent 16 kHz mono samples.
///
/// Ingress appends, the ASR windower snapshots. The mutex is held only across
/// the copy itself; callers must never perform I/O while holding it.
pub struct RollingBuffer {
    inner: Mutex<VecDeque<i16>>,
    capacity: usize,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append samples, discarding the oldest once past capacity.
    pub fn append(&self, samples: &[i16]) {
        let mut buf = self.inner.lock().unwrap();
        for &s in samples {
            if buf.len() == self.capacity {
                buf.pop_front();
            }
            buf.push_back(s);
        }
    }

    /// Copy of the entire buffer, oldest first.
    pub fn snapshot(&self) -> Vec<i16> {
        let buf = self.inner.lock().unwrap();
        buf.iter().copied().collect()
    }

    /// Copy of the most recent `n` samples (fewer if the buffer is shorter).
    pub fn tail(&self, n: usize) -> Vec<i16> {
        let buf = self.inner.lock().unwrap();
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
