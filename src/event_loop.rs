//! The single-threaded readiness loop that drives a [`Session`].

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::session::{Interest, Ready, Session, SocketKey};
use crate::tracker::CompletionTracker;

/// Default number of sockets a single wait may cover.
pub const DEFAULT_CAPACITY: usize = 1024;

/// What one run of the loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: usize,
    /// Iterations that found no socket of interest and only waited on the
    /// session's timer.
    pub timer_only: usize,
    pub ready_events: usize,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    capacity: usize,
    /// What each descriptor is currently registered for, and for which
    /// socket. Descriptors get reused once closed, keys do not.
    registered: HashMap<RawFd, (SocketKey, mio::Interest)>,
}

impl EventLoop {
    pub fn new(capacity: usize) -> Result<Self> {
        let poll = Poll::new().map_err(Error::Init)?;
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(capacity.clamp(1, DEFAULT_CAPACITY)),
            capacity,
            registered: HashMap::new(),
        })
    }

    /// Drives `session` until `tracker` has seen every completion.
    pub fn run<S: Session + ?Sized>(
        &mut self,
        session: &mut S,
        tracker: &mut CompletionTracker,
    ) -> Result<LoopStats> {
        let mut stats = LoopStats::default();

        while !tracker.is_done() {
            stats.iterations += 1;

            let interests = session.interest_set();
            if interests.len() > self.capacity {
                return Err(Error::TooManySockets {
                    wanted: interests.len(),
                    capacity: self.capacity,
                });
            }
            let budget = session.min_timeout(Instant::now());
            self.reconcile(&interests)?;

            let ready = if interests.is_empty() {
                // Queries may legitimately wait on retransmission timers only.
                if budget.is_none() {
                    return Err(Error::Stalled {
                        pending: session.pending(),
                    });
                }
                stats.timer_only += 1;
                self.wait(budget)?;
                Vec::new()
            } else {
                self.wait(budget)?;
                self.ready_set()
            };

            trace!(
                iteration = stats.iterations,
                sockets = interests.len(),
                ?budget,
                ready = ready.len(),
                "loop iteration"
            );
            stats.ready_events += ready.len();
            session.process_ready(&ready, tracker);
            tracker.check()?;
        }

        self.reconcile(&[])?;
        debug!(
            iterations = stats.iterations,
            timer_only = stats.timer_only,
            "event loop done"
        );
        Ok(stats)
    }

    /// Blocks until a registered socket is ready or `budget` elapsed.
    fn wait(&mut self, budget: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, budget) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                self.events.clear();
                Ok(())
            }
            Err(err) => Err(Error::Wait(err)),
        }
    }

    fn ready_set(&self) -> Vec<Ready> {
        self.events
            .iter()
            .map(|event| Ready {
                key: SocketKey(event.token().0),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed() || event.is_error(),
            })
            .collect()
    }

    /// Brings the poller's registrations in line with a fresh interest set.
    fn reconcile(&mut self, interests: &[Interest]) -> Result<()> {
        let mut desired: HashMap<RawFd, (SocketKey, mio::Interest)> =
            HashMap::with_capacity(interests.len());
        for interest in interests {
            let Some(wanted) = mio_interest(interest) else {
                continue;
            };
            desired
                .entry(interest.fd)
                .and_modify(|(_, current)| *current = *current | wanted)
                .or_insert((interest.key, wanted));
        }

        let registry = self.poll.registry();

        // A closed descriptor has already left the poller, so failures here
        // are expected and harmless.
        self.registered.retain(|fd, (key, _)| match desired.get(fd) {
            Some((wanted_key, _)) if wanted_key == key => true,
            _ => {
                let _ = registry.deregister(&mut SourceFd(fd));
                false
            }
        });

        for (fd, (key, wanted)) in desired {
            let token = Token(key.0);
            match self.registered.get(&fd) {
                Some((_, current)) if *current == wanted => continue,
                Some(_) => registry
                    .reregister(&mut SourceFd(&fd), token, wanted)
                    .map_err(Error::Register)?,
                None => registry
                    .register(&mut SourceFd(&fd), token, wanted)
                    .map_err(Error::Register)?,
            }
            self.registered.insert(fd, (key, wanted));
        }
        Ok(())
    }
}

fn mio_interest(interest: &Interest) -> Option<mio::Interest> {
    match (interest.read, interest.write) {
        (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Some(mio::Interest::READABLE),
        (false, true) => Some(mio::Interest::WRITABLE),
        (false, false) => None,
    }
}
