//! Stepped progress observation.
//!
//! A [`ProgressTracker`] counts bytes against a declared total and reports a
//! percentage only when another `step` bytes have passed, which bounds the
//! callback rate independently of the read buffer size.

use std::io::{self, Read};

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u64,
    step: u64,
    read: u64,
    next_report: u64,
}

impl ProgressTracker {
    pub fn new(total: u64, step: u64) -> Self {
        let step = step.max(1);
        Self {
            total,
            step,
            read: 0,
            next_report: step,
        }
    }

    /// Record `n` more bytes. Returns the cumulative percentage when a step
    /// boundary was crossed.
    pub fn advance(&mut self, n: usize) -> Option<u8> {
        self.read += n as u64;
        if self.read < self.next_report {
            return None;
        }
        while self.next_report <= self.read {
            self.next_report += self.step;
        }
        Some(self.percent())
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.read.saturating_mul(100) / self.total).min(100) as u8
    }

    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// [`Read`] adapter that feeds a [`ProgressTracker`] and hands each reported
/// percentage to `callback`.
pub struct ProgressReader<R, F> {
    inner: R,
    tracker: ProgressTracker,
    callback: F,
}

impl<R, F> ProgressReader<R, F>
where
    R: Read,
    F: FnMut(u8),
{
    pub fn new(inner: R, total: u64, step: u64, callback: F) -> Self {
        Self {
            inner,
            tracker: ProgressTracker::new(total, step),
            callback,
        }
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R, F> Read for ProgressReader<R, F>
where
    R: Read,
    F: FnMut(u8),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(percent) = self.tracker.advance(n) {
            (self.callback)(percent);
        }
        Ok(n)
    }
}
