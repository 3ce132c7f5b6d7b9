//! The contract between the event loop and a resolver.
//!
//! A session owns every outstanding query and all sockets. The loop only
//! learns which descriptors to watch and how long it may sleep, then hands
//! readiness back. Completions are delivered through a [`CompletionHandler`]
//! passed into [`Session::process_ready`].

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::dns_hdr::{DNSHdr, NameError, Query, RRClass, RRType};

/// Identifies one submitted query for the lifetime of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Identifies one socket. Never reused within a session, unlike descriptors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketKey(pub usize);

/// A socket the session wants monitored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Interest {
    pub key: SocketKey,
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

/// Readiness reported for a socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Ready {
    pub key: SocketKey,
    pub readable: bool,
    pub writable: bool,
}

/// The question every query of a benchmark run asks.
#[derive(Debug, Clone)]
pub struct Question {
    name: String,
    qtype: RRType,
    qclass: RRClass,
    template: Bytes,
}

impl Question {
    pub fn new(name: &str, qtype: RRType) -> Result<Self, NameError> {
        let query = Query::new(name, qtype, RRClass::IN)?;
        let template = DNSHdr::query(0, query).to_bytes();
        Ok(Question {
            name: name.to_string(),
            qtype,
            qclass: RRClass::IN,
            template,
        })
    }

    /// The encoded query message with the given id.
    pub fn message(&self, id: u16) -> Bytes {
        let mut buf = BytesMut::from(&self.template[..]);
        buf[..2].copy_from_slice(&id.to_be_bytes());
        buf.freeze()
    }

    /// Whether a response echoes exactly this question.
    pub fn is_answered_by(&self, response: &DNSHdr<'_>) -> bool {
        match (Query::new(&self.name, self.qtype, self.qclass), &response.queries[..]) {
            (Ok(ours), [theirs]) => ours.matches(theirs),
            _ => false,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} IN {}", self.name, self.qtype)
    }
}

/// What a successful query reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u16,
    pub answers: usize,
    pub attempts: usize,
    pub over_tcp: bool,
}

/// Why a query finished without an answer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("no response before the last attempt timed out")]
    Timeout,
    #[error("server answered with rcode {0}")]
    Rcode(u8),
    #[error("socket error: {0}")]
    Io(io::ErrorKind),
    #[error("cannot open socket: {0}")]
    Socket(io::ErrorKind),
}

pub type Outcome = Result<Response, QueryError>;

/// Receives the outcome of every query, exactly once each.
pub trait CompletionHandler {
    fn on_complete(&mut self, id: QueryId, outcome: Outcome);
}

/// A resolver that can be driven by a readiness loop.
pub trait Session {
    /// Enqueues a query. Never blocks and never calls a handler.
    fn submit(&mut self, question: &Question) -> QueryId;

    /// The sockets that currently need watching. May be empty while queries
    /// wait on timers only.
    fn interest_set(&self) -> Vec<Interest>;

    /// Time until the earliest internal deadline, or `None` if nothing is
    /// outstanding.
    fn min_timeout(&self, now: Instant) -> Option<Duration>;

    /// Handles readiness and expired deadlines. Must also be called with an
    /// empty `ready` set when the wait timed out.
    fn process_ready(&mut self, ready: &[Ready], handler: &mut dyn CompletionHandler);

    /// Number of submitted queries that have not completed yet.
    fn pending(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::dns_hdr::Flags;

    #[test]
    fn test_message_sets_id() -> Result<()> {
        let question = Question::new("example.com", RRType::A)?;
        let first = question.message(1);
        let second = question.message(0xabcd);

        assert_eq!(&first[..2], &[0, 1]);
        assert_eq!(&second[..2], &[0xab, 0xcd]);
        assert_eq!(first[2..], second[2..]);

        let (_, hdr) = DNSHdr::from_bytes(&second).map_err(|e| e.to_owned())?;
        assert_eq!(hdr.id, 0xabcd);
        assert_eq!(hdr.flags, Flags::query());
        assert!(question.is_answered_by(&hdr));
        Ok(())
    }

    #[test]
    fn test_other_question_does_not_answer() -> Result<()> {
        let question = Question::new("example.com", RRType::A)?;
        let other = Question::new("example.net", RRType::A)?;
        let msg = other.message(3);
        let (_, hdr) = DNSHdr::from_bytes(&msg).map_err(|e| e.to_owned())?;
        assert!(!question.is_answered_by(&hdr));
        assert_eq!(question.to_string(), "example.com IN A");
        Ok(())
    }
}
