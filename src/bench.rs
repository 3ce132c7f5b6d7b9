//! Timing harness: submits the request pool and measures until the last
//! completion.

use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopStats};
use crate::session::{Question, Session};
use crate::tracker::CompletionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Submit everything up front, then run the loop once.
    #[default]
    Concurrent,
    /// Resolve each query to completion before submitting the next.
    Sequential,
}

/// N copies of the same question.
#[derive(Debug, Clone)]
pub struct RequestPool {
    question: Question,
    count: NonZeroUsize,
}

impl RequestPool {
    pub fn new(question: Question, count: NonZeroUsize) -> Self {
        RequestPool { question, count }
    }

    pub fn count(&self) -> usize {
        self.count.get()
    }

    pub fn question(&self) -> &Question {
        &self.question
    }

    /// Submits `n` queries back to back.
    fn submit<S: Session + ?Sized>(&self, session: &mut S, n: usize) {
        for _ in 0..n {
            session.submit(&self.question);
        }
    }
}

/// The outcome of one benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub count: usize,
    pub elapsed: Duration,
    pub succeeded: usize,
    pub failed: usize,
    pub loop_stats: LoopStats,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total time: {:.6} s ({} resolutions)",
            self.elapsed.as_secs_f64(),
            self.count
        )
    }
}

/// Runs the pool through `session` and reports the time from the first
/// submission to the last completion. Session setup is not measured.
pub fn run<S: Session + ?Sized>(
    session: &mut S,
    event_loop: &mut EventLoop,
    pool: &RequestPool,
    mode: Mode,
) -> Result<Report> {
    info!(question = %pool.question(), count = pool.count(), ?mode, "starting benchmark");

    let report = match mode {
        Mode::Concurrent => run_concurrent(session, event_loop, pool)?,
        Mode::Sequential => run_sequential(session, event_loop, pool)?,
    };

    info!(
        elapsed = ?report.elapsed,
        succeeded = report.succeeded,
        failed = report.failed,
        iterations = report.loop_stats.iterations,
        "benchmark done"
    );
    Ok(report)
}

fn run_concurrent<S: Session + ?Sized>(
    session: &mut S,
    event_loop: &mut EventLoop,
    pool: &RequestPool,
) -> Result<Report> {
    let mut tracker = CompletionTracker::new(pool.count());

    let start = Instant::now();
    pool.submit(session, pool.count());
    let loop_stats = event_loop.run(session, &mut tracker)?;
    let end = end_time(&tracker)?;

    Ok(Report {
        count: pool.count(),
        elapsed: end.duration_since(start),
        succeeded: tracker.succeeded(),
        failed: tracker.failed(),
        loop_stats,
    })
}

fn run_sequential<S: Session + ?Sized>(
    session: &mut S,
    event_loop: &mut EventLoop,
    pool: &RequestPool,
) -> Result<Report> {
    let mut loop_stats = LoopStats::default();
    let (mut succeeded, mut failed) = (0, 0);

    let start = Instant::now();
    let mut end = start;
    for _ in 0..pool.count() {
        let mut tracker = CompletionTracker::new(1);
        pool.submit(session, 1);
        let stats = event_loop.run(session, &mut tracker)?;

        loop_stats.iterations += stats.iterations;
        loop_stats.timer_only += stats.timer_only;
        loop_stats.ready_events += stats.ready_events;
        succeeded += tracker.succeeded();
        failed += tracker.failed();
        end = end_time(&tracker)?;
    }

    Ok(Report {
        count: pool.count(),
        elapsed: end.duration_since(start),
        succeeded,
        failed,
        loop_stats,
    })
}

fn end_time(tracker: &CompletionTracker) -> Result<Instant> {
    tracker.end_time().ok_or(Error::Incomplete {
        completed: tracker.completed(),
        total: tracker.total(),
    })
}
