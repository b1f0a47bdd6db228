//! Bounded image sink between the image output target and storage.
//!
//! The sink never holds more than its capacity. Under the default
//! latest-wins policy an offered image replaces whatever has not been
//! drained yet, so a slow storage backend cannot build an unbounded
//! backlog. Every image leaving the sink is dropped after use, which
//! releases its device buffer even when persistence fails.

use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::timestamp::TimestampTranslator;
use crate::traits::{Image, Storage};

/// Retention policy for images not yet drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "capacity")]
pub enum SinkPolicy {
    /// Keep only the most recent image.
    #[default]
    Latest,
    /// Keep up to `capacity` images in arrival order, dropping the oldest.
    Fifo(usize),
}

impl SinkPolicy {
    /// Maximum images held at once.
    pub const fn capacity(self) -> usize {
        match self {
            Self::Latest => 1,
            Self::Fifo(capacity) => capacity,
        }
    }
}

/// Counters returned by [`ImageSink::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Images written successfully.
    pub persisted: u32,
    /// Images whose write failed.
    pub failed: u32,
}

/// Bounded consumer of produced images.
#[derive(Debug)]
pub struct ImageSink {
    policy: SinkPolicy,
    queue: VecDeque<Image>,
    discarded: u64,
}

impl ImageSink {
    /// Create an empty sink.
    pub fn new(policy: SinkPolicy) -> Self {
        Self {
            policy,
            queue: VecDeque::with_capacity(policy.capacity()),
            discarded: 0,
        }
    }

    /// Store `image`, discarding older undrained images beyond capacity.
    pub fn offer(&mut self, image: Image) {
        let capacity = self.policy.capacity().max(1);
        while self.queue.len() >= capacity {
            if let Some(stale) = self.queue.pop_front() {
                debug!(?stale, "discarding undrained image");
                self.discarded += 1;
            }
        }
        self.queue.push_back(image);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Images discarded by the retention policy so far.
    pub const fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Take every held image, oldest first.
    pub fn drain_all(&mut self) -> impl Iterator<Item = Image> + '_ {
        self.queue.drain(..)
    }

    /// Drain and persist every held image.
    ///
    /// Files are named by capture wall-clock time, falling back to the
    /// current time when the device timestamp cannot be translated.
    /// Persistence failures are logged and counted, never propagated.
    pub fn flush(
        &mut self,
        storage: &dyn Storage,
        translator: &TimestampTranslator,
        extension: &str,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        for image in self.drain_all() {
            let captured_at_ms = translator
                .translate_ms(image.timestamp_ns())
                .unwrap_or_else(|| Utc::now().timestamp_millis());

            match storage.persist(image.data(), captured_at_ms, extension) {
                Ok(path) => {
                    info!(path = %path.display(), bytes = image.data().len(), "saved image");
                    report.persisted += 1;
                }
                Err(err) => {
                    warn!(error = %err, "save failed, dropping image");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
