use crate::error::Error;
use std::thread;
use tracing::debug;

/// A unit of background work, such as a connection's process loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs background tasks for clients and servers.
///
/// Each task loops until its connection or server closes, so an executor
/// must be able to run at least one task per active connection at the same
/// time. Closures with the signature `Fn(Task) -> Result<(), Error>` are
/// executors too.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), Error>;
}

impl<F> Executor for F
where
    F: Fn(Task) -> Result<(), Error> + Send + Sync,
{
    fn execute(&self, task: Task) -> Result<(), Error> {
        self(task)
    }
}

/// Runs every task on a new named OS thread. The default executor.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    name: String,
}

impl ThreadExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("peerlink")
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) -> Result<(), Error> {
        let handle = thread::Builder::new().name(self.name.clone()).spawn(task)?;
        debug!(thread = %self.name, id = ?handle.thread().id(), "Spawned worker thread");
        Ok(())
    }
}
