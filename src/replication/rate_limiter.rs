//! Node-wide byte-rate limiting for inbound segment chunks.
//!
//! `RateLimiter` converts bytes into a pause so that the admitted rate never
//! exceeds the configured bytes per second. `ChunkThrottle` is the shared
//! per-node front end: it accumulates chunk sizes across every attempt and
//! only consults the limiter once the accumulated delta crosses the limiter's
//! pause-check threshold.

use crate::constants::{MAX_PAUSE_CHECK_BYTES, MIN_PAUSE_CHECK_MS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
  bytes_per_sec: u64,
  min_pause_check_bytes: u64,
  next_free: Mutex<Instant>,
}

impl RateLimiter {
  /// `bytes_per_sec` must be positive.
  pub fn new(bytes_per_sec: u64) -> Self {
    let bytes_per_sec = bytes_per_sec.max(1);
    let per_check = bytes_per_sec.saturating_mul(MIN_PAUSE_CHECK_MS) / 1000;
    Self {
      bytes_per_sec,
      min_pause_check_bytes: per_check.clamp(1, MAX_PAUSE_CHECK_BYTES),
      next_free: Mutex::new(Instant::now()),
    }
  }

  pub fn bytes_per_sec(&self) -> u64 {
    self.bytes_per_sec
  }

  /// Bytes that may accumulate before `pause` is worth calling.
  pub fn min_pause_check_bytes(&self) -> u64 {
    self.min_pause_check_bytes
  }

  /// Account for `bytes` and block the calling thread until they fit the
  /// budget. Returns the time spent paused.
  pub fn pause(&self, bytes: u64) -> Duration {
    let cost = Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64);
    let now = Instant::now();
    let target = {
      let mut next_free = self.next_free.lock();
      let target = *next_free + cost;
      *next_free = target.max(now);
      target
    };

    let pause = target.saturating_duration_since(now);
    if !pause.is_zero() {
      std::thread::sleep(pause);
    }
    pause
  }
}

/// Shared throttle in front of the limiter; one instance per node.
#[derive(Debug)]
pub struct ChunkThrottle {
  limiter: Option<RateLimiter>,
  bytes_since_last_pause: AtomicU64,
}

impl ChunkThrottle {
  /// `bytes_per_sec == 0` disables throttling.
  pub fn new(bytes_per_sec: u64) -> Self {
    Self {
      limiter: (bytes_per_sec > 0).then(|| RateLimiter::new(bytes_per_sec)),
      bytes_since_last_pause: AtomicU64::new(0),
    }
  }

  pub fn unlimited() -> Self {
    Self::new(0)
  }

  pub fn is_enabled(&self) -> bool {
    self.limiter.is_some()
  }

  /// Admit `bytes` of chunk payload, pausing when the node-wide delta since
  /// the last pause crosses the limiter's threshold. Returns the throttle
  /// time this call spent blocked.
  pub fn admit(&self, bytes: usize) -> Duration {
    let Some(limiter) = self.limiter.as_ref() else {
      return Duration::ZERO;
    };

    let bytes = bytes as u64;
    let threshold = limiter.min_pause_check_bytes();
    // Crossing the threshold claims the whole delta and resets the counter in
    // one step, so concurrent callers never claim the same bytes twice. The
    // closure always returns `Some`, so the update cannot fail.
    let mut accumulated = 0u64;
    let _ = self.bytes_since_last_pause.fetch_update(
      Ordering::AcqRel,
      Ordering::Acquire,
      |current| {
        let total = current.saturating_add(bytes);
        if total > threshold {
          accumulated = total;
          Some(0)
        } else {
          accumulated = 0;
          Some(total)
        }
      },
    );
    if accumulated == 0 {
      return Duration::ZERO;
    }

    let paused = limiter.pause(accumulated);
    if !paused.is_zero() {
      tracing::trace!(
        bytes = accumulated,
        paused_ms = paused.as_millis() as u64,
        "replication throttled"
      );
    }
    paused
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Barrier};

  #[test]
  fn pause_check_threshold_is_bounded() {
    let fast = RateLimiter::new(1024 * 1024 * 1024);
    assert_eq!(fast.min_pause_check_bytes(), MAX_PAUSE_CHECK_BYTES);

    let slow = RateLimiter::new(100_000);
    assert_eq!(slow.min_pause_check_bytes(), 500);
  }

  #[test]
  fn limiter_pauses_once_budget_is_spent() {
    let limiter = RateLimiter::new(1_000_000);
    let start = Instant::now();
    limiter.pause(100_000);
    limiter.pause(100_000);
    assert!(
      start.elapsed() >= Duration::from_millis(150),
      "200KB at 1MB/s should take ~200ms, took {:?}",
      start.elapsed()
    );
  }

  #[test]
  fn disabled_throttle_never_blocks() {
    let throttle = ChunkThrottle::unlimited();
    assert!(!throttle.is_enabled());
    let start = Instant::now();
    for _ in 0..1_000 {
      assert_eq!(throttle.admit(1024 * 1024), Duration::ZERO);
    }
    assert!(start.elapsed() < Duration::from_secs(1));
  }

  #[test]
  fn small_chunks_accumulate_before_pausing() {
    let throttle = ChunkThrottle::new(1_000_000);
    // threshold is 5_000 bytes at 1MB/s
    assert_eq!(throttle.admit(1_000), Duration::ZERO);
    assert_eq!(throttle.admit(1_000), Duration::ZERO);
    assert_eq!(throttle.bytes_since_last_pause.load(Ordering::Acquire), 2_000);
  }

  #[test]
  fn concurrent_crossings_never_wrap_the_counter() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 20_000;

    // fast enough that the pauses themselves are negligible
    let throttle = Arc::new(ChunkThrottle::new(1 << 50));
    let threshold = MAX_PAUSE_CHECK_BYTES;
    let barrier = Arc::new(Barrier::new(THREADS));
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    for _ in 0..THREADS {
      let throttle = Arc::clone(&throttle);
      let barrier = Arc::clone(&barrier);
      let done_tx = done_tx.clone();
      std::thread::spawn(move || {
        barrier.wait();
        let mut longest = Duration::ZERO;
        for _ in 0..ROUNDS {
          longest = longest.max(throttle.admit(threshold as usize + 1));
        }
        let _ = done_tx.send(longest);
      });
    }

    for _ in 0..THREADS {
      let longest = done_rx
        .recv_timeout(Duration::from_secs(30))
        .expect("admit threads finish");
      assert!(longest < Duration::from_secs(1), "paused {longest:?}");
    }
    assert!(throttle.bytes_since_last_pause.load(Ordering::Acquire) <= threshold);
  }

  #[test]
  fn aggregate_rate_is_bounded_across_threads() {
    const BYTES_PER_SEC: u64 = 4 * 1024 * 1024;
    const THREADS: usize = 4;
    const CHUNKS: usize = 16;
    const CHUNK: usize = 16 * 1024;

    let throttle = Arc::new(ChunkThrottle::new(BYTES_PER_SEC));
    let barrier = Arc::new(Barrier::new(THREADS));
    let start = Instant::now();
    let handles: Vec<_> = (0..THREADS)
      .map(|_| {
        let throttle = Arc::clone(&throttle);
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || {
          barrier.wait();
          for _ in 0..CHUNKS {
            throttle.admit(CHUNK);
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().expect("join");
    }

    let total = (THREADS * CHUNKS * CHUNK) as u64;
    let threshold = MAX_PAUSE_CHECK_BYTES;
    let floor = Duration::from_secs_f64((total - 2 * threshold) as f64 / BYTES_PER_SEC as f64);
    assert!(
      start.elapsed() >= floor,
      "admitted {total} bytes in {:?}, expected at least {floor:?}",
      start.elapsed()
    );
  }
}
