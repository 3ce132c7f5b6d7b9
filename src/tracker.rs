//! Completion accounting for one benchmark run.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::session::{CompletionHandler, Outcome, QueryId};

/// Counts completions and records the instant the last one arrived.
///
/// The tracker is the handler passed into every `process_ready` call, so it
/// is the only place completions are counted. Misbehaving sessions (a query
/// completing twice, or more completions than submissions) are remembered
/// and surfaced by [`CompletionTracker::check`].
#[derive(Debug)]
pub struct CompletionTracker {
    total: usize,
    completed: usize,
    succeeded: usize,
    failed: usize,
    done: bool,
    end_time: Option<Instant>,
    seen: HashSet<QueryId>,
    violation: Option<Error>,
}

impl CompletionTracker {
    pub fn new(total: usize) -> Self {
        CompletionTracker {
            total,
            completed: 0,
            succeeded: 0,
            failed: 0,
            done: total == 0,
            end_time: None,
            seen: HashSet::with_capacity(total),
            violation: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// When the last query completed, once all have.
    pub fn end_time(&self) -> Option<Instant> {
        self.end_time
    }

    /// Returns the first accounting violation seen since the last check.
    pub fn check(&mut self) -> Result<()> {
        match self.violation.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn violate(&mut self, err: Error) {
        if self.violation.is_none() {
            self.violation = Some(err);
        }
    }
}

impl CompletionHandler for CompletionTracker {
    fn on_complete(&mut self, id: QueryId, outcome: Outcome) {
        if !self.seen.insert(id) {
            self.violate(Error::DuplicateCompletion(id));
            return;
        }
        if self.done {
            self.violate(Error::UnexpectedCompletion(id));
            return;
        }

        match &outcome {
            Ok(response) => {
                trace!(
                    %id,
                    msg_id = response.id,
                    answers = response.answers,
                    attempts = response.attempts,
                    over_tcp = response.over_tcp,
                    "query answered"
                );
                self.succeeded += 1;
            }
            Err(err) => {
                debug!(%id, %err, "query failed");
                self.failed += 1;
            }
        }

        self.completed += 1;
        if self.completed == self.total {
            self.end_time = Some(Instant::now());
            self.done = true;
        }
    }
}
