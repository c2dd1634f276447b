//! Serial execution of storage tasks on the shared worker pool.
//!
//! A collection clone hands every batch insert to a `TaskRunner`, which runs
//! the tasks on the worker pool but strictly one at a time in scheduling
//! order, so documents reach the bulk loader in the order they arrived from
//! the sync source.

use crate::error::{CloneError, Result};
use rayon::ThreadPool;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct RunnerState {
    queue: VecDeque<Task>,
    running: bool,
    first_error: Option<CloneError>,
}

pub struct TaskRunner {
    pool: Arc<ThreadPool>,
    state: Arc<(Mutex<RunnerState>, Condvar)>,
}

impl TaskRunner {
    pub fn new(pool: Arc<ThreadPool>) -> TaskRunner {
        TaskRunner {
            pool,
            state: Arc::new((
                Mutex::new(RunnerState {
                    queue: VecDeque::new(),
                    running: false,
                    first_error: None,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Queue a task. Tasks run on the pool, one at a time, in queue order.
    pub fn schedule(&self, task: impl FnOnce() -> Result<()> + Send + 'static) {
        let (lock, _) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.queue.push_back(Box::new(task));
        if !state.running {
            state.running = true;
            drop(state);
            let state = Arc::clone(&self.state);
            self.pool.spawn(move || drain(state));
        }
    }

    /// First error produced by a task so far, if any.
    pub fn first_error(&self) -> Option<CloneError> {
        let (lock, _) = &*self.state;
        lock.lock().unwrap().first_error.clone()
    }

    /// Wait until every scheduled task has run; returns the first task error.
    pub fn join(&self) -> Result<()> {
        let (lock, cond) = &*self.state;
        let mut state = lock.lock().unwrap();
        while state.running || !state.queue.is_empty() {
            state = cond.wait(state).unwrap();
        }
        match state.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn drain(state: Arc<(Mutex<RunnerState>, Condvar)>) {
    let (lock, cond) = &*state;
    loop {
        let task = {
            let mut state = lock.lock().unwrap();
            match state.queue.pop_front() {
                Some(task) => task,
                None => {
                    state.running = false;
                    cond.notify_all();
                    return;
                }
            }
        };
        if let Err(e) = task() {
            let mut state = lock.lock().unwrap();
            if state.first_error.is_none() {
                state.first_error = Some(e);
            }
        }
    }
}
