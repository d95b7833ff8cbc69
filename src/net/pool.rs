//! Bounded cache of expensive-to-create objects (API sockets).
//!
//! `maxactive` bounds everything outstanding — handed out plus idle —
//! so a burst of workers cannot open an unbounded number of sockets.
//! When the pool is saturated, `get` blocks until a handle comes back;
//! it returns `None` only when the factory itself fails.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

type Factory<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;
type Destroyer<T> = Box<dyn Fn(T) + Send + Sync>;

struct PoolState<T> {
    idle: Vec<(T, Instant)>,
    /// Handed-out plus idle.
    active: usize,
}

pub struct Pool<T> {
    factory: Factory<T>,
    destroyer: Destroyer<T>,
    max_idle: usize,
    max_active: usize,
    max_idle_secs: u64,
    state: Mutex<PoolState<T>>,
    returned: Condvar,
}

fn lock<T>(state: &Mutex<PoolState<T>>) -> MutexGuard<'_, PoolState<T>> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl<T> Pool<T> {
    pub fn new(
        factory: Factory<T>,
        destroyer: Destroyer<T>,
        max_idle: usize,
        max_active: usize,
        max_idle_secs: u64,
    ) -> Pool<T> {
        Pool {
            factory,
            destroyer,
            max_idle,
            max_active,
            max_idle_secs,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: 0,
            }),
            returned: Condvar::new(),
        }
    }

    /// Take a handle: most-recently-returned idle first, a fresh one
    /// from the factory otherwise. Blocks while the pool is saturated.
    pub fn get(&self) -> Option<T> {
        let mut stale = Vec::new();
        let mut guard = lock(&self.state);
        let reused = loop {
            let now = Instant::now();
            while let Some(pos) = guard.idle.iter().position(|(_, since)| {
                now.duration_since(*since).as_secs() > self.max_idle_secs
            }) {
                let (dead, _) = guard.idle.swap_remove(pos);
                guard.active -= 1;
                stale.push(dead);
            }
            if let Some((item, _)) = guard.idle.pop() {
                break Some(item);
            }
            if guard.active < self.max_active {
                guard.active += 1;
                break None;
            }
            guard = self
                .returned
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        };
        drop(guard);
        for dead in stale {
            (self.destroyer)(dead);
        }
        match reused {
            Some(item) => Some(item),
            None => match (self.factory)() {
                Some(item) => Some(item),
                None => {
                    lock(&self.state).active -= 1;
                    self.returned.notify_one();
                    None
                }
            },
        }
    }

    /// Return a healthy handle for reuse.
    pub fn release(&self, item: T) {
        let evicted = {
            let mut guard = lock(&self.state);
            if guard.idle.len() >= self.max_idle {
                guard.active -= 1;
                Some(item)
            } else {
                guard.idle.push((item, Instant::now()));
                None
            }
        };
        if let Some(item) = evicted {
            (self.destroyer)(item);
        }
        self.returned.notify_one();
    }

    /// Return a handle that must not be reused (protocol desync, TLS
    /// mode change, read error).
    pub fn release_bad(&self, item: T) {
        (self.destroyer)(item);
        lock(&self.state).active -= 1;
        self.returned.notify_one();
    }

    /// Handed-out plus idle, for the saturation invariant.
    pub fn outstanding(&self) -> usize {
        lock(&self.state).active
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.state).idle.len()
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        let idle = std::mem::take(&mut lock(&self.state).idle);
        for (item, _) in idle {
            (self.destroyer)(item);
        }
    }
}
