//! Back-pressure signalling between producers and consumers.
//!
//! A *pressure pair* is a boolean signal: the owning side raises pressure
//! when its outbound queue grows past a high-water mark and releases it once
//! the queue drains below a low-water mark. The consuming side holds a
//! [`PressureValve`] and pauses its reads while the valve is engaged.
//!
//! The contract is deliberately loose: pressure must eventually clear when
//! the queue drains, nothing more. Hysteresis keeps the signal from
//! flapping on every write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Queue size at which a [`BacklogGauge`] raises pressure.
pub const QUEUE_PRESSURE: usize = 128 * 1024;

/// Create a connected pressure source/valve pair, initially released.
pub fn pressure() -> (PressureSource, PressureValve) {
    let (tx, rx) = watch::channel(false);
    (PressureSource { tx: Arc::new(tx) }, PressureValve { rx })
}

/// The raising side of a pressure signal.
#[derive(Clone, Debug)]
pub struct PressureSource {
    tx: Arc<watch::Sender<bool>>,
}

impl PressureSource {
    /// Raise or release pressure. Idempotent; waiters are only woken on an
    /// actual transition.
    pub fn set(&self, on: bool) {
        self.tx.send_if_modified(|state| {
            if *state != on {
                *state = on;
                true
            } else {
                false
            }
        });
    }

    pub fn engaged(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn valve(&self) -> PressureValve {
        PressureValve {
            rx: self.tx.subscribe(),
        }
    }
}

/// The observing side of a pressure signal.
#[derive(Clone, Debug)]
pub struct PressureValve {
    rx: watch::Receiver<bool>,
}

impl PressureValve {
    /// Whether pressure is currently raised. A dropped source counts as
    /// released; a dead producer cannot be congested.
    pub fn engaged(&self) -> bool {
        self.rx.has_changed().is_ok() && *self.rx.borrow()
    }

    /// Wait until pressure is released. Returns immediately when the source
    /// has gone away; a dropped producer can no longer be congested.
    pub async fn wait_released(&mut self) {
        while *self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Byte-counted backlog with hysteresis, driving a pressure source.
///
/// The producing side calls [`BacklogGauge::add`] as it enqueues, the
/// draining side calls [`BacklogGauge::sub`] as bytes hit the wire. Pressure
/// raises above `high` and releases under `high / 2`.
#[derive(Clone, Debug)]
pub struct BacklogGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Debug)]
struct GaugeInner {
    bytes: AtomicUsize,
    high: usize,
    source: PressureSource,
}

impl BacklogGauge {
    pub fn new(high: usize) -> Self {
        let (source, _) = pressure();
        Self {
            inner: Arc::new(GaugeInner {
                bytes: AtomicUsize::new(0),
                high,
                source,
            }),
        }
    }

    pub fn add(&self, amount: usize) {
        let level = self.inner.bytes.fetch_add(amount, Ordering::SeqCst) + amount;
        if level > self.inner.high {
            self.inner.source.set(true);
        }
    }

    pub fn sub(&self, amount: usize) {
        let level = self
            .inner
            .bytes
            .fetch_sub(amount, Ordering::SeqCst)
            .saturating_sub(amount);
        if level < self.inner.high / 2 {
            self.inner.source.set(false);
        }
    }

    pub fn level(&self) -> usize {
        self.inner.bytes.load(Ordering::SeqCst)
    }

    pub fn valve(&self) -> PressureValve {
        self.inner.source.valve()
    }
}

impl Default for BacklogGauge {
    fn default() -> Self {
        Self::new(QUEUE_PRESSURE)
    }
}

/// An aggregate of valves: engaged while any member valve is engaged.
///
/// One transport feeds many channels; each throttling channel contributes a
/// valve and the transport's read pump waits on the whole set.
#[derive(Clone, Debug, Default)]
pub struct PressureSet {
    valves: Arc<Mutex<Vec<PressureValve>>>,
}

impl PressureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, valve: PressureValve) {
        self.valves.lock().push(valve);
    }

    pub fn engaged(&self) -> bool {
        self.valves.lock().iter().any(|v| v.engaged())
    }

    /// Wait until every member valve is released.
    pub async fn wait_released(&self) {
        loop {
            let engaged = {
                let valves = self.valves.lock();
                valves.iter().find(|v| v.engaged()).cloned()
            };
            match engaged {
                None => return,
                Some(mut valve) => valve.wait_released().await,
            }
        }
    }
}
