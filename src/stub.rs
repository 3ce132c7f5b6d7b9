//! A stub resolver session over non-blocking sockets.
//!
//! Queries to the same server share a connected UDP socket and are told
//! apart by message id. Every attempt has its own deadline; an expired
//! attempt moves on to the next server until all attempts are used up. A
//! truncated UDP answer is repeated over a fresh TCP connection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mio::net::{TcpStream, UdpSocket};
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::conf::{ResolvConf, ResolvOptions};
use crate::dns_hdr::{DNSHdr, RCode};
use crate::error::{Error, Result};
use crate::session::{
    CompletionHandler, Interest, Outcome, QueryError, QueryId, Question, Ready, Response,
    Session, SocketKey,
};

const RECV_BUF_SIZE: usize = 4096;

/// Queries in flight on one UDP socket before another one is opened, which
/// keeps random message ids cheap to pick.
const MAX_INFLIGHT_PER_SOCKET: usize = 4096;

struct UdpConn {
    socket: UdpSocket,
    server: usize,
    inflight: HashMap<u16, QueryId>,
    /// Messages the socket refused with `WouldBlock`.
    outbox: VecDeque<(u16, Bytes)>,
}

impl UdpConn {
    fn free_id(&self) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u16 = rng.gen();
            if !self.inflight.contains_key(&id) {
                return id;
            }
        }
    }
}

struct TcpConn {
    stream: TcpStream,
    query: QueryId,
    msg_id: u16,
    connected: bool,
    outgoing: Bytes,
    incoming: BytesMut,
}

impl TcpConn {
    /// Advances connect, write and read as far as the socket allows.
    ///
    /// Returns a complete response message once one has arrived.
    fn drive(&mut self, ready: &Ready) -> io::Result<Option<Bytes>> {
        if !self.connected {
            if let Some(err) = self.stream.take_error()? {
                return Err(err);
            }
            if !ready.writable {
                return Ok(None);
            }
            match self.stream.peer_addr() {
                Ok(_) => self.connected = true,
                Err(err) if err.kind() == io::ErrorKind::NotConnected => return Ok(None),
                Err(err) => return Err(err),
            }
        }

        while !self.outgoing.is_empty() {
            match self.stream.write(&self.outgoing) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outgoing.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    self.incoming.extend_from_slice(&buf[..n]);
                    if let Some(message) = self.take_message() {
                        return Ok(Some(message));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn take_message(&mut self) -> Option<Bytes> {
        if self.incoming.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.incoming[0], self.incoming[1]]) as usize;
        if self.incoming.len() < len + 2 {
            return None;
        }
        self.incoming.advance(2);
        Some(self.incoming.split_to(len).freeze())
    }
}

enum Conn {
    Udp(UdpConn),
    Tcp(TcpConn),
}

/// Where the current attempt of a query lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Idle,
    Udp { key: SocketKey, msg_id: u16 },
    Tcp { key: SocketKey },
}

struct PendingQuery {
    question: Question,
    first_server: usize,
    tries: usize,
    server: usize,
    deadline: Instant,
    transport: Transport,
    last_error: Option<QueryError>,
}

pub struct StubSession {
    servers: Vec<SocketAddr>,
    options: ResolvOptions,
    queries: HashMap<QueryId, PendingQuery>,
    sockets: BTreeMap<SocketKey, Conn>,
    /// Outcomes waiting for the next `process_ready`.
    finished: Vec<(QueryId, Outcome)>,
    next_query: u64,
    next_socket: usize,
}

impl StubSession {
    pub fn new(conf: ResolvConf) -> Result<Self> {
        if conf.servers.is_empty() {
            return Err(Error::NoNameServers);
        }
        let mut options = conf.options;
        options.attempts = options.attempts.max(1);
        debug!(servers = ?conf.servers, ?options, "stub session ready");

        Ok(StubSession {
            servers: conf.servers,
            options,
            queries: HashMap::new(),
            sockets: BTreeMap::new(),
            finished: Vec::new(),
            next_query: 0,
            next_socket: 0,
        })
    }

    fn new_key(&mut self) -> SocketKey {
        let key = SocketKey(self.next_socket);
        self.next_socket += 1;
        key
    }

    /// Sends the next attempt of a query, or finishes it once every attempt
    /// has been used.
    fn start_attempt(&mut self, id: QueryId, now: Instant) {
        let max_tries = self.options.attempts * self.servers.len();
        loop {
            let Some(query) = self.queries.get_mut(&id) else {
                return;
            };
            if query.tries >= max_tries {
                let err = query.last_error.take().unwrap_or(QueryError::Timeout);
                self.finish(id, Err(err));
                return;
            }
            let server = (query.first_server + query.tries) % self.servers.len();
            query.tries += 1;
            query.server = server;
            query.deadline = now + self.options.timeout;

            match self.send_udp(id, server) {
                Ok(()) => return,
                Err(err) => {
                    warn!(%id, server = %self.servers[server], %err, "cannot send query");
                    if let Some(query) = self.queries.get_mut(&id) {
                        query.last_error = Some(QueryError::Socket(err.kind()));
                    }
                }
            }
        }
    }

    fn send_udp(&mut self, id: QueryId, server: usize) -> io::Result<()> {
        let key = self.udp_conn_for(server)?;
        let Some(query) = self.queries.get_mut(&id) else {
            return Ok(());
        };
        let Some(Conn::Udp(conn)) = self.sockets.get_mut(&key) else {
            return Err(io::ErrorKind::NotFound.into());
        };

        let msg_id = conn.free_id();
        let message = query.question.message(msg_id);
        conn.inflight.insert(msg_id, id);
        query.transport = Transport::Udp { key, msg_id };

        if !conn.outbox.is_empty() {
            conn.outbox.push_back((msg_id, message));
            return Ok(());
        }
        match conn.socket.send(&message) {
            Ok(_) => {
                trace!(%id, msg_id, attempt = query.tries, "sent query");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                conn.outbox.push_back((msg_id, message));
                Ok(())
            }
            Err(err) => {
                conn.inflight.remove(&msg_id);
                query.transport = Transport::Idle;
                Err(err)
            }
        }
    }

    /// Finds a UDP socket for the server with room for another query, or
    /// opens one.
    fn udp_conn_for(&mut self, server: usize) -> io::Result<SocketKey> {
        let found = self.sockets.iter().find_map(|(key, conn)| match conn {
            Conn::Udp(udp)
                if udp.server == server && udp.inflight.len() < MAX_INFLIGHT_PER_SOCKET =>
            {
                Some(*key)
            }
            _ => None,
        });
        if let Some(key) = found {
            return Ok(key);
        }

        let addr = self.servers[server];
        let local = match addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(addr)?;

        let key = self.new_key();
        debug!(server = %addr, socket = key.0, "opened UDP socket");
        self.sockets.insert(
            key,
            Conn::Udp(UdpConn {
                socket,
                server,
                inflight: HashMap::new(),
                outbox: VecDeque::new(),
            }),
        );
        Ok(key)
    }

    /// Repeats a truncated query over TCP to the same server.
    fn start_tcp(&mut self, id: QueryId, now: Instant) {
        self.abandon_attempt(id);
        let key = self.new_key();
        let Some(query) = self.queries.get_mut(&id) else {
            return;
        };
        let addr = self.servers[query.server];
        query.deadline = now + self.options.timeout;

        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                self.fail_attempt(id, QueryError::Io(err.kind()), now);
                return;
            }
        };

        let msg_id: u16 = rand::random();
        let message = query.question.message(msg_id);
        let mut outgoing = BytesMut::with_capacity(message.len() + 2);
        outgoing.put_u16(message.len() as u16);
        outgoing.extend_from_slice(&message);
        query.transport = Transport::Tcp { key };

        debug!(%id, server = %addr, "response truncated, retrying over TCP");
        self.sockets.insert(
            key,
            Conn::Tcp(TcpConn {
                stream,
                query: id,
                msg_id,
                connected: false,
                outgoing: outgoing.freeze(),
                incoming: BytesMut::new(),
            }),
        );
    }

    /// Drops whatever the current attempt holds on to.
    fn abandon_attempt(&mut self, id: QueryId) {
        let Some(query) = self.queries.get_mut(&id) else {
            return;
        };
        match mem::replace(&mut query.transport, Transport::Idle) {
            Transport::Idle => {}
            Transport::Udp { key, msg_id } => {
                if let Some(Conn::Udp(conn)) = self.sockets.get_mut(&key) {
                    if conn.inflight.get(&msg_id) == Some(&id) {
                        conn.inflight.remove(&msg_id);
                        conn.outbox.retain(|(pending, _)| *pending != msg_id);
                    }
                }
            }
            Transport::Tcp { key } => {
                self.sockets.remove(&key);
            }
        }
    }

    fn fail_attempt(&mut self, id: QueryId, err: QueryError, now: Instant) {
        self.abandon_attempt(id);
        if let Some(query) = self.queries.get_mut(&id) {
            debug!(%id, attempt = query.tries, %err, "attempt failed");
            query.last_error = Some(err);
        }
        self.start_attempt(id, now);
    }

    fn finish(&mut self, id: QueryId, outcome: Outcome) {
        self.abandon_attempt(id);
        if self.queries.remove(&id).is_some() {
            self.finished.push((id, outcome));
        }
    }

    /// Validates a response for the current attempt of `id`.
    ///
    /// Returns `false` if the message does not answer the query, in which
    /// case nothing changed.
    fn handle_response(
        &mut self,
        id: QueryId,
        msg: &[u8],
        expected_id: u16,
        over_tcp: bool,
        now: Instant,
    ) -> bool {
        let Some(query) = self.queries.get(&id) else {
            return false;
        };
        let (flags, answers, attempts) = match DNSHdr::from_bytes(msg) {
            Ok((_, hdr))
                if hdr.id == expected_id
                    && hdr.flags.qr == 1
                    && query.question.is_answered_by(&hdr) =>
            {
                (hdr.flags, hdr.answers.len(), query.tries)
            }
            Ok((_, hdr)) => {
                warn!(%id, msg_id = hdr.id, "response does not match the query");
                return false;
            }
            Err(err) => {
                warn!(%id, %err, "malformed response");
                return false;
            }
        };

        if flags.tc == 1 && !over_tcp {
            self.start_tcp(id, now);
            return true;
        }

        let outcome = if flags.rcode == RCode::OK as u8 {
            Ok(Response {
                id: expected_id,
                answers,
                attempts,
                over_tcp,
            })
        } else {
            Err(QueryError::Rcode(flags.rcode))
        };
        self.finish(id, outcome);
        true
    }

    fn read_udp(&mut self, key: SocketKey, now: Instant) {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            let Some(Conn::Udp(conn)) = self.sockets.get_mut(&key) else {
                return;
            };
            let len = match conn.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close_udp(key, err, now);
                    return;
                }
            };

            let Some(msg_id) = DNSHdr::peek_id(&buf[..len]) else {
                warn!(len, "dropping runt datagram");
                continue;
            };
            let Some(&id) = conn.inflight.get(&msg_id) else {
                debug!(msg_id, "dropping response for no outstanding attempt");
                continue;
            };
            self.handle_response(id, &buf[..len], msg_id, false, now);
        }
    }

    fn flush_udp(&mut self, key: SocketKey, now: Instant) {
        loop {
            let Some(Conn::Udp(conn)) = self.sockets.get_mut(&key) else {
                return;
            };
            let Some((msg_id, message)) = conn.outbox.pop_front() else {
                return;
            };
            let Some(&id) = conn.inflight.get(&msg_id) else {
                continue;
            };
            match conn.socket.send(&message) {
                Ok(_) => trace!(%id, msg_id, "sent queued query"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    conn.outbox.push_front((msg_id, message));
                    return;
                }
                Err(err) => self.fail_attempt(id, QueryError::Io(err.kind()), now),
            }
        }
    }

    /// Closes a UDP socket that reported an error and moves all its queries
    /// on to their next attempt.
    fn close_udp(&mut self, key: SocketKey, err: io::Error, now: Instant) {
        let Some(Conn::Udp(conn)) = self.sockets.remove(&key) else {
            return;
        };
        debug!(socket = key.0, server = %self.servers[conn.server], %err, "closing UDP socket");
        let mut ids: Vec<QueryId> = conn.inflight.into_values().collect();
        ids.sort_unstable();
        for id in ids {
            self.fail_attempt(id, QueryError::Io(err.kind()), now);
        }
    }

    fn drive_tcp(&mut self, key: SocketKey, ready: &Ready, now: Instant) {
        let Some(Conn::Tcp(conn)) = self.sockets.get_mut(&key) else {
            return;
        };
        let (id, msg_id) = (conn.query, conn.msg_id);
        match conn.drive(ready) {
            Ok(None) => {}
            Ok(Some(message)) => {
                if !self.handle_response(id, &message, msg_id, true, now) {
                    self.fail_attempt(id, QueryError::Io(io::ErrorKind::InvalidData), now);
                }
            }
            Err(err) => {
                debug!(%id, %err, "TCP attempt failed");
                self.fail_attempt(id, QueryError::Io(err.kind()), now);
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let mut expired: Vec<QueryId> = self
            .queries
            .iter()
            .filter(|(_, query)| query.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in expired {
            self.fail_attempt(id, QueryError::Timeout, now);
        }
    }
}

impl Session for StubSession {
    fn submit(&mut self, question: &Question) -> QueryId {
        let id = QueryId(self.next_query);
        self.next_query += 1;

        let first_server = if self.options.rotate {
            (id.0 % self.servers.len() as u64) as usize
        } else {
            0
        };
        let now = Instant::now();
        self.queries.insert(
            id,
            PendingQuery {
                question: question.clone(),
                first_server,
                tries: 0,
                server: first_server,
                deadline: now,
                transport: Transport::Idle,
                last_error: None,
            },
        );
        self.start_attempt(id, now);
        id
    }

    fn interest_set(&self) -> Vec<Interest> {
        self.sockets
            .iter()
            .filter_map(|(key, conn)| {
                let (fd, read, write) = match conn {
                    Conn::Udp(udp) => (
                        udp.socket.as_raw_fd(),
                        !udp.inflight.is_empty(),
                        !udp.outbox.is_empty(),
                    ),
                    Conn::Tcp(tcp) => (
                        tcp.stream.as_raw_fd(),
                        tcp.connected && tcp.outgoing.is_empty(),
                        !tcp.connected || !tcp.outgoing.is_empty(),
                    ),
                };
                (read || write).then_some(Interest {
                    key: *key,
                    fd,
                    read,
                    write,
                })
            })
            .collect()
    }

    fn min_timeout(&self, now: Instant) -> Option<Duration> {
        if !self.finished.is_empty() {
            return Some(Duration::ZERO);
        }
        self.queries
            .values()
            .map(|query| query.deadline.saturating_duration_since(now))
            .min()
    }

    fn process_ready(&mut self, ready: &[Ready], handler: &mut dyn CompletionHandler) {
        let now = Instant::now();
        for event in ready {
            match self.sockets.get(&event.key) {
                Some(Conn::Udp(_)) => {
                    if event.writable {
                        self.flush_udp(event.key, now);
                    }
                    if event.readable {
                        self.read_udp(event.key, now);
                    }
                }
                Some(Conn::Tcp(_)) => self.drive_tcp(event.key, event, now),
                None => trace!(socket = event.key.0, "readiness for a closed socket"),
            }
        }

        self.expire(Instant::now());

        for (id, outcome) in mem::take(&mut self.finished) {
            handler.on_complete(id, outcome);
        }
    }

    fn pending(&self) -> usize {
        self.queries.len() + self.finished.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::UdpSocket as StdUdpSocket;

    use anyhow::Result;

    use super::*;
    use crate::dns_hdr::RRType;
    use crate::dns_server::{Behavior, DNSServer};
    use crate::event_loop::EventLoop;
    use crate::tracker::CompletionTracker;

    fn conf(servers: Vec<SocketAddr>, timeout_ms: u64, attempts: usize) -> ResolvConf {
        ResolvConf {
            servers,
            options: ResolvOptions {
                timeout: Duration::from_millis(timeout_ms),
                attempts,
                rotate: false,
            },
        }
    }

    fn resolve(session: &mut StubSession, n: usize) -> Result<CompletionTracker> {
        let question = Question::new("example.com", RRType::A)?;
        let mut tracker = CompletionTracker::new(n);
        for _ in 0..n {
            session.submit(&question);
        }
        EventLoop::new(64)?.run(session, &mut tracker)?;
        Ok(tracker)
    }

    #[test]
    fn test_answers_all_queries() -> Result<()> {
        let server = DNSServer::start(Behavior::Answer)?;
        let mut session = StubSession::new(conf(vec![server.addr()], 2000, 2))?;

        let tracker = resolve(&mut session, 50)?;
        assert_eq!(tracker.completed(), 50);
        assert_eq!(tracker.succeeded(), 50);
        assert_eq!(server.received(), 50);
        assert_eq!(session.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_queries_share_one_socket_per_server() -> Result<()> {
        let server = DNSServer::start(Behavior::Silent)?;
        let mut session = StubSession::new(conf(vec![server.addr()], 2000, 1))?;
        let question = Question::new("example.com", RRType::A)?;
        for _ in 0..3 {
            session.submit(&question);
        }

        let interests = session.interest_set();
        assert_eq!(interests.len(), 1);
        assert!(interests[0].read);
        assert_eq!(session.pending(), 3);
        let wait = session.min_timeout(Instant::now());
        assert!(wait.is_some_and(|w| w <= Duration::from_millis(2000)));
        Ok(())
    }

    #[test]
    fn test_dropped_queries_are_retried() -> Result<()> {
        let server = DNSServer::start(Behavior::DropFirst(10))?;
        let mut session = StubSession::new(conf(vec![server.addr()], 100, 3))?;

        let tracker = resolve(&mut session, 50)?;
        assert_eq!(tracker.completed(), 50);
        assert_eq!(tracker.succeeded(), 50);
        assert_eq!(server.received(), 60);
        Ok(())
    }

    #[test]
    fn test_silent_server_times_out() -> Result<()> {
        let server = DNSServer::start(Behavior::Silent)?;
        let mut session = StubSession::new(conf(vec![server.addr()], 50, 2))?;

        let tracker = resolve(&mut session, 5)?;
        assert_eq!(tracker.completed(), 5);
        assert_eq!(tracker.failed(), 5);
        assert_eq!(server.received(), 10);
        Ok(())
    }

    #[test]
    fn test_error_rcode_counts_as_completion() -> Result<()> {
        let server = DNSServer::start(Behavior::Rcode(RCode::NameError as u8))?;
        let mut session = StubSession::new(conf(vec![server.addr()], 2000, 2))?;

        let tracker = resolve(&mut session, 10)?;
        assert_eq!(tracker.completed(), 10);
        assert_eq!(tracker.failed(), 10);
        assert_eq!(server.received(), 10);
        Ok(())
    }

    #[test]
    fn test_truncated_response_falls_back_to_tcp() -> Result<()> {
        let server = DNSServer::start(Behavior::Truncate)?;
        let mut session = StubSession::new(conf(vec![server.addr()], 2000, 1))?;

        let tracker = resolve(&mut session, 5)?;
        assert_eq!(tracker.succeeded(), 5);
        assert_eq!(server.received(), 5);
        assert_eq!(server.tcp_served(), 5);
        Ok(())
    }

    #[test]
    fn test_mismatched_id_is_ignored() -> Result<()> {
        let server = DNSServer::start(Behavior::WrongIdFirst)?;
        let mut session = StubSession::new(conf(vec![server.addr()], 2000, 1))?;

        let tracker = resolve(&mut session, 10)?;
        assert_eq!(tracker.succeeded(), 10);
        assert_eq!(server.received(), 10);
        Ok(())
    }

    #[test]
    fn test_rotate_spreads_first_attempts() -> Result<()> {
        let first = DNSServer::start(Behavior::Answer)?;
        let second = DNSServer::start(Behavior::Answer)?;
        let mut conf = conf(vec![first.addr(), second.addr()], 2000, 1);
        conf.options.rotate = true;
        let mut session = StubSession::new(conf)?;

        let tracker = resolve(&mut session, 10)?;
        assert_eq!(tracker.succeeded(), 10);
        assert_eq!(first.received(), 5);
        assert_eq!(second.received(), 5);
        Ok(())
    }

    #[test]
    fn test_dead_server_fails_over() -> Result<()> {
        let dead = StdUdpSocket::bind("127.0.0.1:0")?.local_addr()?;
        let live = DNSServer::start(Behavior::Answer)?;
        let mut session = StubSession::new(conf(vec![dead, live.addr()], 200, 1))?;

        let tracker = resolve(&mut session, 5)?;
        assert_eq!(tracker.succeeded(), 5);
        assert_eq!(live.received(), 5);
        Ok(())
    }

    #[test]
    fn test_no_servers_is_an_error() {
        let err = StubSession::new(ResolvConf::new()).err();
        assert!(matches!(err, Some(Error::NoNameServers)));
    }
}
