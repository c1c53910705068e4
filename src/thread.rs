//! Spawn-join, CPU pinning and the synchronization points of a benchmark run.
//!
//! **You may not need to check this if it is OK to run benchmarks with [`std::thread`].**
//!
//! A store may need its worker threads to be created in a specific way (e.g., registered with a
//! runtime). In that case, its join handle should implement the [`JoinHandle`] trait and its spawn
//! struct needs to implement [`Thread`], which is then returned by [`crate::KVMap::thread`].

use crate::*;
use log::warn;
use parking_lot::Mutex;
use std::sync::Barrier;

/// A join handle returned by a spawn function.
pub trait JoinHandle {
    /// Join the thread, consume the boxed self.
    fn join(self: Box<Self>);
}

/// A thread management abstraction.
pub trait Thread: Send + Sync {
    /// Spawn a new thread using a boxed closure.
    fn spawn(&self, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle>;

    /// Pin the current thread according to its index among the workers.
    fn pin(&self, id: usize);
}

/// The CPU a worker is pinned to. Workers wrap around when there are more of them than cores.
pub fn core_for(id: usize, nr_cores: usize) -> usize {
    id % nr_cores
}

/// A zero-sized wrapper for [`std::thread`] functions.
#[derive(Clone)]
pub struct DefaultThread;

/// A wrapper for [`std::thread::JoinHandle`].
pub struct DefaultJoinHandle(std::thread::JoinHandle<()>);

impl JoinHandle for DefaultJoinHandle {
    fn join(self: Box<Self>) {
        let handle = self.0;
        assert!(handle.join().is_ok());
    }
}

impl Thread for DefaultThread {
    fn spawn(&self, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle> {
        let handle = std::thread::spawn(f);
        Box::new(DefaultJoinHandle(handle))
    }

    fn pin(&self, id: usize) {
        // pinning only reduces noise, the run is still valid without it
        let Some(cores) = core_affinity::get_core_ids() else {
            warn!("Cannot query core ids, worker {} is not pinned", id);
            return;
        };
        if cores.is_empty() {
            return;
        }
        let core = cores[core_for(id, cores.len())];
        if !core_affinity::set_for_current(core) {
            warn!("Failed to pin worker {} to core {}", id, core.id);
        }
    }
}

/// The worker that performs one-time setup and teardown.
pub const LEADER: usize = 0;

/// A barrier whose leader can run a one-time step that the other workers wait for.
///
/// [`Rendezvous::lead`] is the single-initializer primitive of a run: the leader runs the step,
/// everyone waits for it, and everyone gets the same outcome back, so a failed setup makes all
/// workers skip their operations consistently.
pub struct Rendezvous {
    barrier: Barrier,
    outcome: Mutex<Option<Result<()>>>,
}

impl Rendezvous {
    pub fn new(nr_threads: usize) -> Self {
        Self {
            barrier: Barrier::new(nr_threads),
            outcome: Mutex::new(None),
        }
    }

    /// Wait for all workers.
    pub fn wait(&self) {
        self.barrier.wait();
    }

    /// Run `f` on the leader only, then hand its result to every worker. All workers must call
    /// this the same number of times.
    pub fn lead(&self, id: usize, f: impl FnOnce() -> Result<()>) -> Result<()> {
        if id == LEADER {
            *self.outcome.lock() = Some(f());
        }
        self.barrier.wait();
        let outcome = self.outcome.lock().clone().unwrap_or(Ok(()));
        // nobody may start the next step before everyone has read this one
        self.barrier.wait();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn spawn_all(nr_threads: usize, f: impl Fn(usize) + Send + Sync + 'static) {
        let f = Arc::new(f);
        let thread = DefaultThread;
        let handles: Vec<_> = (0..nr_threads)
            .map(|id| {
                let f = f.clone();
                thread.spawn(Box::new(move || f(id)))
            })
            .collect();
        for h in handles {
            h.join();
        }
    }

    #[test]
    fn core_mapping_wraps_around() {
        assert_eq!(core_for(0, 4), 0);
        assert_eq!(core_for(3, 4), 3);
        assert_eq!(core_for(4, 4), 0);
        assert_eq!(core_for(9, 4), 1);
    }

    #[test]
    fn pin_does_not_fail() {
        let thread = DefaultThread;
        thread.spawn(Box::new(move || DefaultThread.pin(1024))).join();
    }

    #[test]
    fn leader_runs_once() {
        let rendezvous = Arc::new(Rendezvous::new(6));
        let calls = Arc::new(AtomicUsize::new(0));
        let ok = Arc::new(AtomicUsize::new(0));
        {
            let (rendezvous, calls, ok) = (rendezvous.clone(), calls.clone(), ok.clone());
            spawn_all(6, move |id| {
                let r = rendezvous.lead(id, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                if r.is_ok() {
                    ok.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ok.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn followers_wait_for_the_leader() {
        let rendezvous = Arc::new(Rendezvous::new(4));
        let ready = Arc::new(AtomicUsize::new(0));
        let (rendezvous2, ready2) = (rendezvous.clone(), ready.clone());
        spawn_all(4, move |id| {
            rendezvous2
                .lead(id, || {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                    ready2.store(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            assert_eq!(ready2.load(Ordering::SeqCst), 1);
        });
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        drop(rendezvous);
    }

    #[test]
    fn every_worker_sees_the_failure() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let failed = Arc::new(AtomicUsize::new(0));
        let (rendezvous2, failed2) = (rendezvous.clone(), failed.clone());
        spawn_all(3, move |id| {
            let r = rendezvous2.lead(id, || Err(Error::Setup("no space".to_string())));
            assert_eq!(r, Err(Error::Setup("no space".to_string())));
            failed2.fetch_add(1, Ordering::SeqCst);
            // a second step is not polluted by the first one
            assert!(rendezvous2.lead(id, || Ok(())).is_ok());
        });
        assert_eq!(failed.load(Ordering::SeqCst), 3);
        drop(rendezvous);
    }
}
