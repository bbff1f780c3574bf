//! A named background thread that runs a task on a fixed interval until stopped.
use std::ops::ControlFlow;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

/// Handle to a repeating background task.
///
/// The task runs first after `initial_delay` and then every `interval`, until it returns
/// [ControlFlow::Break] or the handle is stopped. Dropping the handle stops the task without
/// waiting for it.
pub struct RepeatingTask {
    name: String,
    // Sync channel so the handle can be shared between threads. A buffer of one is enough: if it
    // is full, a stop command is already pending.
    stop_sender: SyncSender<()>,
    join_handle: Option<JoinHandle<()>>,
}

impl RepeatingTask {
    /// Spawn the task thread.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread could not be spawned.
    pub fn start<F>(
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        mut task: F,
    ) -> std::io::Result<RepeatingTask>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let (stop_sender, stop_receiver) = mpsc::sync_channel::<()>(1);
        let thread_name = name.to_owned();

        let join_handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let mut delay = initial_delay;
                loop {
                    match stop_receiver.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {
                            if task().is_break() {
                                debug!("{} finished", thread_name);
                                return;
                            }
                        }
                        Ok(()) => {
                            debug!("{} received stop command", thread_name);
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            debug!("{} handle was dropped", thread_name);
                            return;
                        }
                    }
                    delay = interval;
                }
            })?;

        Ok(RepeatingTask {
            name: name.to_owned(),
            stop_sender,
            join_handle: Some(join_handle),
        })
    }

    /// The thread name given at start.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the task to stop. Does not wait; calling it more than once is harmless.
    pub fn stop(&self) {
        // Errors mean the thread already exited or a stop is already queued.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the task and wait for its thread to exit.
    ///
    /// Called from the task's own thread this only stops it, since joining would deadlock.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the task panicked.
    pub fn shutdown(mut self) -> thread::Result<()> {
        self.stop();
        match self.join_handle.take() {
            Some(handle) if handle.thread().id() != thread::current().id() => handle.join(),
            _ => Ok(()),
        }
    }

    /// True once the task thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::RepeatingTask;
    use std::ops::ControlFlow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn counting_task(
        initial_delay: Duration,
        stop_after: usize,
    ) -> (RepeatingTask, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = RepeatingTask::start(
            "test-task",
            initial_delay,
            Duration::from_millis(10),
            move || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= stop_after {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        )
        .unwrap();
        (task, runs)
    }

    #[test]
    fn runs_repeatedly_until_break() {
        let (task, runs) = counting_task(Duration::ZERO, 3);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(task.is_finished());
        assert!(task.shutdown().is_ok());
    }

    #[test]
    fn shutdown_stops_before_first_run() {
        let (task, runs) = counting_task(Duration::from_secs(60), usize::MAX);
        assert_eq!(task.name(), "test-task");
        task.stop();
        task.stop();
        assert!(task.shutdown().is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_stops_the_task() {
        let (task, runs) = counting_task(Duration::ZERO, usize::MAX);
        thread::sleep(Duration::from_millis(50));
        drop(task);
        thread::sleep(Duration::from_millis(50));
        let after_drop = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), after_drop);
    }
}
