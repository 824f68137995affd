//! Per-id lock table.
//!
//! Serializes mount, unmount, removal, and remapping for a single layer id
//! while letting distinct ids proceed concurrently. Entries are reclaimed as
//! soon as the last holder releases and nobody is waiting, so the table does
//! not grow with the number of layers ever touched.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct LockState {
    held: bool,
    waiters: usize,
}

pub struct Locker {
    inner: Mutex<HashMap<String, LockState>>,
    cond: Condvar,
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

impl Locker {
    pub fn new() -> Self {
        Locker {
            inner: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the lock for `id` is available and returns a guard that
    /// releases it on drop.
    pub fn lock(&self, id: &str) -> IdGuard<'_> {
        let mut map = self.inner.lock();
        loop {
            let state = map.entry(id.to_string()).or_default();
            if !state.held {
                state.held = true;
                return IdGuard {
                    locker: self,
                    id: id.to_string(),
                };
            }
            state.waiters += 1;
            self.cond.wait(&mut map);
            if let Some(state) = map.get_mut(id) {
                state.waiters = state.waiters.saturating_sub(1);
            }
        }
    }

    fn unlock(&self, id: &str) {
        let mut map = self.inner.lock();
        if let Some(state) = map.get_mut(id) {
            state.held = false;
            if state.waiters == 0 {
                map.remove(id);
            }
        }
        drop(map);
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct IdGuard<'a> {
    locker: &'a Locker,
    id: String,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.locker.unlock(&self.id);
    }
}
