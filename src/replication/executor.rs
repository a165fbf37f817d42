//! Generic worker pool running replication attempts and continuations.

use crate::error::{Result, SegrepError};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool fed by an unbounded queue. A panicking task is logged and
/// the worker keeps serving the queue.
#[derive(Debug)]
pub struct WorkerPool {
  sender: Mutex<Option<Sender<Task>>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  name: String,
}

impl WorkerPool {
  pub fn new(name: &str, threads: usize) -> Result<Self> {
    let (sender, receiver) = unbounded::<Task>();
    let mut workers = Vec::with_capacity(threads.max(1));
    for index in 0..threads.max(1) {
      let receiver = receiver.clone();
      let thread_name = format!("{name}-{index}");
      let handle = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
          for task in receiver.iter() {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
              tracing::error!(worker = %thread_name, "replication task panicked");
            }
          }
        })?;
      workers.push(handle);
    }

    Ok(Self {
      sender: Mutex::new(Some(sender)),
      workers: Mutex::new(workers),
      name: name.to_string(),
    })
  }

  /// Queue `task`; fails once the pool has been shut down.
  pub fn execute<F>(&self, task: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    let sender = self.sender.lock();
    let sender = sender.as_ref().ok_or_else(|| {
      SegrepError::InvalidReplication(format!("worker pool {} is shut down", self.name))
    })?;
    sender.send(Box::new(task)).map_err(|_| {
      SegrepError::InvalidReplication(format!("worker pool {} is shut down", self.name))
    })
  }

  /// Stop accepting work, drain the queue and join the workers.
  pub fn shutdown(&self) {
    drop(self.sender.lock().take());
    let workers = std::mem::take(&mut *self.workers.lock());
    let current = std::thread::current().id();
    for worker in workers {
      // a task may shut the pool down from one of its own workers
      if worker.thread().id() == current {
        continue;
      }
      if worker.join().is_err() {
        tracing::warn!(pool = %self.name, "worker exited abnormally");
      }
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[test]
  fn runs_every_queued_task() {
    let pool = WorkerPool::new("test-pool", 3).expect("pool");
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
      let counter = Arc::clone(&counter);
      pool
        .execute(move || {
          counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("execute");
    }
    pool.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 100);
  }

  #[test]
  fn panicking_task_does_not_kill_worker() {
    let pool = WorkerPool::new("test-pool", 1).expect("pool");
    pool.execute(|| panic!("boom")).expect("execute");
    let (tx, rx) = crossbeam_channel::bounded(1);
    pool
      .execute(move || {
        tx.send(42).expect("send");
      })
      .expect("execute");
    assert_eq!(
      rx.recv_timeout(std::time::Duration::from_secs(5))
        .expect("task ran"),
      42
    );
  }

  #[test]
  fn execute_after_shutdown_fails() {
    let pool = WorkerPool::new("test-pool", 1).expect("pool");
    pool.shutdown();
    assert!(pool.execute(|| {}).is_err());
  }
}
