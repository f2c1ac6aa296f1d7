//! Process-wide low-memory signal.
//!
//! Listeners are invoked once per transition from normal to low memory,
//! on the thread that detected the transition and outside the monitor's
//! lock. Listeners must not block; buffers hand the actual flush to a
//! separate thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::resource::SystemResources;

pub type MemoryListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by `register`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct MonitorState {
    listeners: HashMap<ListenerId, MemoryListener>,
    next_id: u64,
    low: bool,
}

pub struct MemoryMonitor {
    state: Mutex<MonitorState>,
    threshold: f64,
}

impl MemoryMonitor {
    /// `threshold` is the memory pressure (0.0..=1.0) `poll` treats as low.
    pub fn new(threshold: f64) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                listeners: HashMap::new(),
                next_id: 0,
                low: false,
            }),
            threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, listener: MemoryListener) -> ListenerId {
        let mut s = self.lock();
        let id = ListenerId(s.next_id);
        s.next_id += 1;
        s.listeners.insert(id, listener);
        id
    }

    /// Returns false if the listener was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn is_memory_low(&self) -> bool {
        self.lock().low
    }

    /// Enter the low-memory state. Listeners run only on the transition.
    pub fn signal_low_memory(&self) {
        let listeners: Vec<MemoryListener> = {
            let mut s = self.lock();
            if s.low {
                return;
            }
            s.low = true;
            s.listeners.values().cloned().collect()
        };
        tracing::debug!("low memory, notifying {} listeners", listeners.len());
        for listener in listeners {
            listener();
        }
    }

    pub fn signal_normal(&self) {
        self.lock().low = false;
    }

    /// Probe system memory and signal accordingly. Returns the pressure seen.
    pub fn poll(&self) -> f64 {
        let pressure = SystemResources::detect().memory_pressure();
        if pressure >= self.threshold {
            self.signal_low_memory();
        } else {
            self.signal_normal();
        }
        pressure
    }
}
