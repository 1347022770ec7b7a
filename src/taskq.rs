use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct TaskqState {
    queue: VecDeque<Task>,
    active: usize,
    shutdown: bool,
}

struct TaskqShared {
    state: Mutex<TaskqState>,
    work_cv: Condvar,
    drain_cv: Condvar,
}

/// A fixed pool of worker threads with dispatch/wait semantics: `wait`
/// blocks until every task dispatched so far has finished.
pub struct Taskq {
    shared: Arc<TaskqShared>,
    workers: Vec<JoinHandle<()>>,
}

impl Taskq {
    pub fn new(name: &str, nthreads: usize) -> Taskq {
        let shared = Arc::new(TaskqShared {
            state: Mutex::new(TaskqState {
                queue: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            drain_cv: Condvar::new(),
        });

        let workers = (0..nthreads.max(1))
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || Taskq::worker(shared))
                    .unwrap()
            })
            .collect();

        Taskq { shared, workers }
    }

    fn worker(shared: Arc<TaskqShared>) {
        let mut state = shared.state.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                state.active += 1;
                drop(state);
                task();
                state = shared.state.lock();
                state.active -= 1;
                if state.active == 0 && state.queue.is_empty() {
                    shared.drain_cv.notify_all();
                }
            } else if state.shutdown {
                return;
            } else {
                shared.work_cv.wait(&mut state);
            }
        }
    }

    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        assert!(!state.shutdown);
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.work_cv.notify_one();
    }

    /// Block until the queue is empty and no task is running.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while state.active != 0 || !state.queue.is_empty() {
            self.shared.drain_cv.wait(&mut state);
        }
    }
}

impl Drop for Taskq {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.work_cv.notify_all();
        for worker in self.workers.drain(..) {
            worker.join().unwrap();
        }
    }
}
