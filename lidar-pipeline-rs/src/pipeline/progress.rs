//! Incremental execution of multi-frame operations.
//!
//! A [`Progress`] performs one unit of work (usually one frame) per call to
//! `next()` and yields the percentage completed so far. Nothing runs until the
//! iterator is driven, and a drained iterator cannot be restarted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use super::processor::{LidarProcessor, PipelineError, Result};

/// Shared flag requesting cooperative cancellation of a running operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The running operation stops before its next step.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear a previous cancellation request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// One incremental operation over the orchestrator.
pub trait ProgressTask: Send {
    /// Perform step `index` of the operation.
    fn step(&mut self, processor: &mut LidarProcessor, index: usize) -> Result<()>;

    /// Called exactly once: after the last step with `completed == true`, or
    /// with `false` when the run is cancelled, a step fails or the iterator is
    /// dropped early.
    fn finish(&mut self, _processor: &mut LidarProcessor, _completed: bool) -> Result<()> {
        Ok(())
    }
}

/// Adapts a closure into a [`ProgressTask`].
pub(crate) struct FnTask<F>(pub F);

impl<F> ProgressTask for FnTask<F>
where
    F: FnMut(&mut LidarProcessor, usize) -> Result<()> + Send,
{
    fn step(&mut self, processor: &mut LidarProcessor, index: usize) -> Result<()> {
        (self.0)(processor, index)
    }
}

/// Lazy, finite sequence of completion percentages.
///
/// Yields `Ok(percent)` after every step. A failed step yields its error and
/// ends the sequence; a cancelled run yields [`PipelineError::Cancelled`] once
/// and ends. Work completed before an error or cancellation is kept.
pub struct Progress<'a> {
    processor: &'a mut LidarProcessor,
    task: Box<dyn ProgressTask + 'a>,
    total: usize,
    done: usize,
    cancel: Option<CancelToken>,
    finished: bool,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(
        processor: &'a mut LidarProcessor,
        total: usize,
        task: impl ProgressTask + 'a,
    ) -> Self {
        let cancel = processor.cancel_token().cloned();
        Self {
            processor,
            task: Box::new(task),
            total,
            done: 0,
            cancel,
            finished: false,
        }
    }

    /// Number of steps in the operation.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Steps completed so far.
    pub fn done(&self) -> usize {
        self.done
    }

    /// Drive the operation to completion, discarding progress values.
    pub fn run(self) -> Result<()> {
        for step in self {
            step?;
        }
        Ok(())
    }
}

impl Iterator for Progress<'_> {
    type Item = Result<f32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.done >= self.total {
            self.finished = true;
            return match self.task.finish(self.processor, true) {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            };
        }

        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            self.finished = true;
            debug!("cancelled after {}/{} steps", self.done, self.total);
            if let Err(e) = self.task.finish(self.processor, false) {
                return Some(Err(e));
            }
            return Some(Err(PipelineError::Cancelled));
        }

        if let Err(e) = self.task.step(self.processor, self.done) {
            self.finished = true;
            if let Err(finish_err) = self.task.finish(self.processor, false) {
                warn!("cleanup after failed step also failed: {finish_err}");
            }
            return Some(Err(e));
        }
        self.done += 1;
        Some(Ok(self.done as f32 * 100.0 / self.total as f32))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            (0, Some(0))
        } else {
            let remaining = self.total - self.done;
            (0, Some(remaining + 1))
        }
    }
}

impl Drop for Progress<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        debug!("dropped after {}/{} steps", self.done, self.total);
        if let Err(e) = self.task.finish(self.processor, false) {
            warn!("cleanup of abandoned operation failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<std::sync::Mutex<Vec<usize>>>;

    fn counting_task(
        log: Log,
    ) -> FnTask<impl FnMut(&mut LidarProcessor, usize) -> Result<()> + Send> {
        FnTask(move |_p: &mut LidarProcessor, i: usize| -> Result<()> {
            log.lock().unwrap().push(i);
            Ok(())
        })
    }

    #[test]
    fn test_progress_yields_percentages() {
        let mut processor = LidarProcessor::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let values: Vec<f32> = Progress::new(&mut processor, 4, counting_task(log.clone()))
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(values, vec![25.0, 50.0, 75.0, 100.0]);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_progress_is_lazy() {
        let mut processor = LidarProcessor::new();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut progress = Progress::new(&mut processor, 3, counting_task(log.clone()));
        assert!(log.lock().unwrap().is_empty());
        progress.next();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_cancellation_stops_between_steps() {
        let mut processor = LidarProcessor::new();
        let token = CancelToken::new();
        processor.set_cancel_token(Some(token.clone()));

        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut progress = Progress::new(&mut processor, 5, counting_task(log.clone()));
        assert!(progress.next().unwrap().is_ok());
        assert!(progress.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(progress.next(), Some(Err(PipelineError::Cancelled))));
        assert!(progress.next().is_none());
        assert_eq!(*log.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_failed_step_ends_sequence() {
        let mut processor = LidarProcessor::new();
        let task = FnTask(|_p: &mut LidarProcessor, i: usize| -> Result<()> {
            if i == 1 {
                Err(PipelineError::NotConfigured("clustering"))
            } else {
                Ok(())
            }
        });
        let results: Vec<_> = Progress::new(&mut processor, 3, task).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(PipelineError::NotConfigured(_))));
    }

    /// Records each `finish` call.
    struct FinishRecorder {
        fail_at: Option<usize>,
        finished: Arc<std::sync::Mutex<Vec<bool>>>,
    }

    impl ProgressTask for FinishRecorder {
        fn step(&mut self, _processor: &mut LidarProcessor, index: usize) -> Result<()> {
            match self.fail_at {
                Some(at) if at == index => Err(PipelineError::NotConfigured("tracking")),
                _ => Ok(()),
            }
        }

        fn finish(&mut self, _processor: &mut LidarProcessor, completed: bool) -> Result<()> {
            self.finished.lock().unwrap().push(completed);
            Ok(())
        }
    }

    #[test]
    fn test_finish_runs_once_on_every_exit() {
        let mut processor = LidarProcessor::new();

        // Drained to the end.
        let finished = Arc::new(std::sync::Mutex::new(Vec::new()));
        let task = FinishRecorder { fail_at: None, finished: finished.clone() };
        Progress::new(&mut processor, 2, task).run().unwrap();
        assert_eq!(*finished.lock().unwrap(), vec![true]);

        // Failing step.
        let finished = Arc::new(std::sync::Mutex::new(Vec::new()));
        let task = FinishRecorder { fail_at: Some(1), finished: finished.clone() };
        assert!(Progress::new(&mut processor, 3, task).run().is_err());
        assert_eq!(*finished.lock().unwrap(), vec![false]);

        // Dropped part-way.
        let finished = Arc::new(std::sync::Mutex::new(Vec::new()));
        let task = FinishRecorder { fail_at: None, finished: finished.clone() };
        let mut progress = Progress::new(&mut processor, 3, task);
        assert!(progress.next().unwrap().is_ok());
        drop(progress);
        assert_eq!(*finished.lock().unwrap(), vec![false]);

        // Dropped before the first step.
        let finished = Arc::new(std::sync::Mutex::new(Vec::new()));
        let task = FinishRecorder { fail_at: None, finished: finished.clone() };
        drop(Progress::new(&mut processor, 3, task));
        assert_eq!(*finished.lock().unwrap(), vec![false]);
    }

    #[test]
    fn test_empty_operation() {
        let mut processor = LidarProcessor::new();
        let task = FnTask(|_p: &mut LidarProcessor, _i: usize| -> Result<()> { Ok(()) });
        assert_eq!(Progress::new(&mut processor, 0, task).count(), 0);
    }
}
