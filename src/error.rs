use std::io;

use thiserror::Error;

use crate::session::QueryId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no name servers configured")]
    NoNameServers,
    #[error("cannot create readiness poller: {0}")]
    Init(#[source] io::Error),
    #[error("{wanted} sockets of interest exceed the capacity of {capacity}")]
    TooManySockets { wanted: usize, capacity: usize },
    #[error("cannot register socket for readiness: {0}")]
    Register(#[source] io::Error),
    #[error("waiting for socket readiness failed: {0}")]
    Wait(#[source] io::Error),
    #[error("{pending} queries pending with no socket and no deadline")]
    Stalled { pending: usize },
    #[error("query {0} completed more than once")]
    DuplicateCompletion(QueryId),
    #[error("query {0} completed after all queries were done")]
    UnexpectedCompletion(QueryId),
    #[error("loop ended with {completed} of {total} queries completed")]
    Incomplete { completed: usize, total: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
