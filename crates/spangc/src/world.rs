//! Stopping and restarting mutator threads.
//!
//! A mutator is either running, parked at a safepoint, or blocking (inside
//! a call that may itself stop the world, such as a forced collection).
//! The world is stopped once every registered mutator is parked or
//! blocking. Blocking mutators may not touch the heap until they leave the
//! blocking state, which waits for the world to restart.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

/// Stop-the-world coordination between the collector and mutators.
pub trait World: Send + Sync {
    /// Returns once every registered mutator is parked or blocking.
    fn stop_the_world(&self);

    /// Releases the mutators parked by [`stop_the_world`](Self::stop_the_world).
    fn start_the_world(&self);

    /// Fast check mutators poll between heap operations.
    fn stop_requested(&self) -> bool;

    /// Parks the calling mutator until the world restarts, if a stop is
    /// in progress.
    fn safepoint(&self);

    /// Adds the calling thread as a running mutator. Waits out a stop in
    /// progress.
    fn register_mutator(&self);

    /// Removes a mutator.
    fn unregister_mutator(&self);

    /// Marks the calling mutator as blocking: it counts as stopped.
    fn enter_blocking(&self);

    /// Returns a blocking mutator to running, waiting out a stop in
    /// progress.
    fn exit_blocking(&self);

    /// Processors not occupied by running mutators.
    fn idle_procs(&self) -> usize;
}

#[derive(Debug, Default)]
struct WorldState {
    mutators: usize,
    blocking: usize,
    parked: usize,
    stopping: bool,
    epoch: u64,
}

/// [`World`] built on a mutex and two condition variables.
///
/// Parked mutators wait for the restart epoch to move, so a mutator that
/// wakes late is never counted as parked for the next stop.
#[derive(Debug)]
pub struct SafepointWorld {
    procs: usize,
    stop_flag: AtomicBool,
    state: Mutex<WorldState>,
    /// Signals the stopper that a mutator parked or left.
    parked_cond: Condvar,
    /// Signals mutators that the world restarted.
    resume_cond: Condvar,
}

impl SafepointWorld {
    /// Creates a world budgeting `procs` processors.
    #[must_use]
    pub fn new(procs: usize) -> Self {
        Self {
            procs: procs.max(1),
            stop_flag: AtomicBool::new(false),
            state: Mutex::new(WorldState::default()),
            parked_cond: Condvar::new(),
            resume_cond: Condvar::new(),
        }
    }

    /// Registered mutators.
    #[must_use]
    pub fn mutators(&self) -> usize {
        self.state.lock().mutators
    }

    /// Mutators currently blocking.
    #[must_use]
    pub fn blocking(&self) -> usize {
        self.state.lock().blocking
    }
}

impl World for SafepointWorld {
    fn stop_the_world(&self) {
        let mut state = self.state.lock();
        while state.stopping {
            self.resume_cond.wait(&mut state);
        }
        state.stopping = true;
        self.stop_flag.store(true, Ordering::SeqCst);
        while state.parked + state.blocking < state.mutators {
            self.parked_cond.wait(&mut state);
        }
    }

    fn start_the_world(&self) {
        let mut state = self.state.lock();
        state.stopping = false;
        state.parked = 0;
        state.epoch = state.epoch.wrapping_add(1);
        self.stop_flag.store(false, Ordering::SeqCst);
        self.resume_cond.notify_all();
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    fn safepoint(&self) {
        if !self.stop_requested() {
            return;
        }
        let mut state = self.state.lock();
        if !state.stopping {
            return;
        }
        state.parked += 1;
        self.parked_cond.notify_all();
        let epoch = state.epoch;
        while state.epoch == epoch {
            self.resume_cond.wait(&mut state);
        }
    }

    fn register_mutator(&self) {
        let mut state = self.state.lock();
        while state.stopping {
            self.resume_cond.wait(&mut state);
        }
        state.mutators += 1;
    }

    fn unregister_mutator(&self) {
        let mut state = self.state.lock();
        state.mutators = state.mutators.saturating_sub(1);
        self.parked_cond.notify_all();
    }

    fn enter_blocking(&self) {
        let mut state = self.state.lock();
        state.blocking += 1;
        self.parked_cond.notify_all();
    }

    fn exit_blocking(&self) {
        let mut state = self.state.lock();
        while state.stopping {
            self.resume_cond.wait(&mut state);
        }
        state.blocking = state.blocking.saturating_sub(1);
    }

    fn idle_procs(&self) -> usize {
        let state = self.state.lock();
        let running = state.mutators.saturating_sub(state.blocking);
        self.procs.saturating_sub(running)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_stop_waits_for_running_mutator() {
        let world = Arc::new(SafepointWorld::new(2));
        world.register_mutator();
        let progress = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let mutator = {
            let (world, progress, done) = (Arc::clone(&world), Arc::clone(&progress), Arc::clone(&done));
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    progress.fetch_add(1, Ordering::SeqCst);
                    world.safepoint();
                }
                world.unregister_mutator();
            })
        };

        world.stop_the_world();
        let frozen = progress.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(progress.load(Ordering::SeqCst), frozen);
        done.store(true, Ordering::SeqCst);
        world.start_the_world();
        mutator.join().unwrap();
        assert_eq!(world.mutators(), 0);
    }

    #[test]
    fn test_blocking_mutators_count_as_stopped() {
        let world = SafepointWorld::new(4);
        world.register_mutator();
        world.register_mutator();
        assert_eq!(world.idle_procs(), 2);
        world.enter_blocking();
        world.enter_blocking();
        assert_eq!(world.idle_procs(), 4);
        world.stop_the_world();
        assert!(world.stop_requested());
        world.start_the_world();
        world.exit_blocking();
        assert_eq!(world.blocking(), 1);
        assert!(!world.stop_requested());
    }

    #[test]
    fn test_safepoint_without_stop_returns() {
        let world = SafepointWorld::new(1);
        world.register_mutator();
        world.safepoint();
        world.unregister_mutator();
    }
}
