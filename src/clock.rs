//! Simulation clock
//!
//! A single process-wide clock maps wall-clock time elapsed since the
//! start of the run onto the logical timeline of the dataset. Given a
//! dataset starting at `t0` and a speed multiplier `s`, a wall-clock
//! elapsed `e` corresponds to logical `t0 + s*e`. Every node runtime
//! paces its observation stream against this mapping, and consensus
//! deadlines are translated back into wall-clock instants for the
//! timeout sleeps.
//!
//! The clock is cooperative: nothing is pinned to a thread, waits are
//! plain tokio sleeps, and a process-wide shutdown signal causes all
//! pending waits to resolve immediately with [`WaitOutcome::Cancelled`].

use {
  chrono::{DateTime, TimeZone, Utc},
  serde::{Deserialize, Serialize},
  std::{ops::Add, time::Duration},
  tokio::sync::watch,
};

/// A point on the dataset's logical timeline, stored with millisecond
/// resolution. Dataset timestamps are seconds since the epoch; the
/// extra resolution exists for sub-second consensus deadlines and
/// batch flush timers.
#[derive(
  Copy,
  Clone,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Default,
  Serialize,
  Deserialize,
)]
#[serde(transparent)]
pub struct LogicalTime(u64);

impl LogicalTime {
  pub const ZERO: LogicalTime = LogicalTime(0);

  pub fn from_secs(secs: u64) -> Self {
    Self(secs * 1000)
  }

  pub fn from_millis(millis: u64) -> Self {
    Self(millis)
  }

  pub fn as_millis(&self) -> u64 {
    self.0
  }

  pub fn as_secs(&self) -> u64 {
    self.0 / 1000
  }

  /// Time elapsed since `earlier`, zero if `earlier` is in the future.
  pub fn since(&self, earlier: LogicalTime) -> Duration {
    Duration::from_millis(self.0.saturating_sub(earlier.0))
  }

  /// RFC 3339 UTC rendering used by the canonical block encoding.
  pub fn to_rfc3339(&self) -> String {
    let dt: DateTime<Utc> = Utc
      .timestamp_millis_opt(self.0 as i64)
      .single()
      .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
  }
}

impl Add<Duration> for LogicalTime {
  type Output = LogicalTime;

  fn add(self, rhs: Duration) -> Self::Output {
    LogicalTime(self.0 + rhs.as_millis() as u64)
  }
}

impl std::fmt::Debug for LogicalTime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "t+{}ms", self.0)
  }
}

impl std::fmt::Display for LogicalTime {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.to_rfc3339())
  }
}

/// Outcome of a paced wait.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
  /// The logical deadline was reached.
  Reached,
  /// The run is shutting down; the wait was abandoned.
  Cancelled,
}

/// The process-wide cancellation signal. Runtimes, the clock, timeout
/// waiters and fabric workers all observe the same flag and drain
/// once it flips.
#[derive(Debug, Clone)]
pub struct Shutdown {
  tx: watch::Sender<bool>,
  rx: watch::Receiver<bool>,
}

impl Shutdown {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self { tx, rx }
  }

  pub fn trigger(&self) {
    // receivers may have all dropped already, that is fine
    let _ = self.tx.send(true);
  }

  pub fn is_triggered(&self) -> bool {
    *self.rx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.rx.clone()
  }

  /// Resolves when the signal fires. Resolves immediately if it
  /// already has.
  pub async fn triggered(&self) {
    let mut rx = self.rx.clone();
    while !*rx.borrow() {
      if rx.changed().await.is_err() {
        return;
      }
    }
  }
}

impl Default for Shutdown {
  fn default() -> Self {
    Self::new()
  }
}

pub struct SimClock {
  t0: LogicalTime,
  speed: f64,
  started: tokio::time::Instant,
  shutdown: watch::Receiver<bool>,
}

impl SimClock {
  /// Starts the clock now: wall-clock zero corresponds to logical
  /// `t0`. Speed must already be validated by the configuration.
  pub fn start(t0: LogicalTime, speed: f64, shutdown: &Shutdown) -> Self {
    Self {
      t0,
      speed,
      started: tokio::time::Instant::now(),
      shutdown: shutdown.subscribe(),
    }
  }

  pub fn speed(&self) -> f64 {
    self.speed
  }

  /// The current point on the logical timeline.
  pub fn now(&self) -> LogicalTime {
    let elapsed = self.started.elapsed().as_secs_f64();
    LogicalTime::from_millis(
      self.t0.as_millis() + (elapsed * self.speed * 1000.0) as u64,
    )
  }

  /// The wall-clock instant at which logical time `t` is reached.
  /// Already-elapsed logical times map to an instant in the past.
  pub fn wall_instant(&self, t: LogicalTime) -> tokio::time::Instant {
    let offset_ms =
      t.as_millis().saturating_sub(self.t0.as_millis()) as f64 / self.speed;
    self.started + Duration::from_millis(offset_ms as u64)
  }

  /// Wall-clock duration corresponding to a logical duration.
  pub fn wall_duration(&self, logical: Duration) -> Duration {
    Duration::from_secs_f64(logical.as_secs_f64() / self.speed)
  }

  /// Suspends until the logical timeline reaches `t` or the run is
  /// cancelled.
  pub async fn wait_until(&self, t: LogicalTime) -> WaitOutcome {
    let mut shutdown = self.shutdown.clone();
    if *shutdown.borrow() {
      return WaitOutcome::Cancelled;
    }
    if self.now() >= t {
      return WaitOutcome::Reached;
    }
    let deadline = self.wall_instant(t);
    loop {
      tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {
          return WaitOutcome::Reached;
        }
        changed = shutdown.changed() => {
          if changed.is_err() || *shutdown.borrow() {
            return WaitOutcome::Cancelled;
          }
        }
      }
    }
  }
}
