//! Task liveness tracking shared across the agent's background tasks.
//!
//! Each subsystem (`collector`, `transport`, `dispatcher`, `watchdog`'s
//! own consumers) holds a [`TaskPulse`] and ticks it on every loop
//! iteration; [`HealthCollector`] aggregates the matching [`TaskMonitor`]s
//! for the watchdog to inspect.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

#[derive(Clone)]
pub struct TaskPulse {
    tx: watch::Sender<Instant>,
}

impl TaskPulse {
    pub fn tick(&self) {
        let _ = self.tx.send(Instant::now());
    }
}

pub struct TaskMonitor {
    pub name: String,
    rx: watch::Receiver<Instant>,
}

impl TaskMonitor {
    pub fn elapsed(&self) -> Duration {
        self.rx.borrow().elapsed()
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.elapsed() < timeout
    }
}

pub fn task_pulse(name: impl Into<String>) -> (TaskPulse, TaskMonitor) {
    let (tx, rx) = watch::channel(Instant::now());
    (
        TaskPulse { tx },
        TaskMonitor {
            name: name.into(),
            rx,
        },
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskHealth {
    pub name: String,
    pub alive: bool,
    pub last_pulse_ms: u64,
}

pub struct HealthCollector {
    pub start_time: Instant,
    pub monitors: std::sync::Mutex<Vec<TaskMonitor>>,
    /// Process RSS in megabytes, bit-packed f32, updated by the watchdog.
    pub memory_mb: AtomicU64,
    pub restart_count: AtomicU32,
}

impl HealthCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            monitors: std::sync::Mutex::new(Vec::new()),
            memory_mb: AtomicU64::new(0),
            restart_count: AtomicU32::new(0),
        }
    }

    pub fn register_monitor(&self, monitor: TaskMonitor) {
        self.monitors.lock().unwrap().push(monitor);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn memory_mb(&self) -> f32 {
        f32::from_bits(self.memory_mb.load(Ordering::Relaxed) as u32)
    }

    pub fn task_states(&self, liveness_timeout: Duration) -> Vec<TaskHealth> {
        self.monitors
            .lock()
            .unwrap()
            .iter()
            .map(|m| TaskHealth {
                name: m.name.clone(),
                alive: m.is_alive(liveness_timeout),
                last_pulse_ms: m.elapsed().as_millis() as u64,
            })
            .collect()
    }
}

impl Default for HealthCollector {
    fn default() -> Self {
        Self::new()
    }
}
