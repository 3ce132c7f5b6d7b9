//! An in-process DNS server for exercising sessions against real sockets.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::dns_hdr::{Answer, DNSHdr, Flags, RCode, RRClass, RRType};

/// How the server treats incoming UDP queries. TCP queries are always
/// answered.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Answer,
    /// Ignore the first n datagrams, answer the rest.
    DropFirst(usize),
    /// Never answer.
    Silent,
    Rcode(u8),
    /// Answer with the TC bit set and no records.
    Truncate,
    /// Send a response with a wrong id before the real one.
    WrongIdFirst,
}

pub struct DNSServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    received: Arc<AtomicUsize>,
    tcp_served: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl DNSServer {
    pub fn start(behavior: Behavior) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").context("Failed to bind to address")?;
        socket.set_read_timeout(Some(Duration::from_millis(20)))?;
        let addr = socket.local_addr()?;
        let listener = TcpListener::bind(addr).context("Failed to bind TCP to address")?;
        listener.set_nonblocking(true)?;

        let stop = Arc::new(AtomicBool::new(false));
        let received = Arc::new(AtomicUsize::new(0));
        let tcp_served = Arc::new(AtomicUsize::new(0));

        let udp = {
            let (stop, received) = (stop.clone(), received.clone());
            thread::spawn(move || serve_udp(socket, behavior, &stop, &received))
        };
        let tcp = {
            let (stop, served) = (stop.clone(), tcp_served.clone());
            thread::spawn(move || serve_tcp(listener, &stop, &served))
        };

        Ok(Self {
            addr,
            stop,
            received,
            tcp_served,
            handles: vec![udp, tcp],
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// UDP datagrams seen so far, including ignored ones.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn tcp_served(&self) -> usize {
        self.tcp_served.load(Ordering::SeqCst)
    }
}

impl Drop for DNSServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn respond(request: &DNSHdr<'_>, rcode: u8, tc: u8) -> Bytes {
    let data = Ipv4Addr::new(192, 0, 2, 1).octets();
    let answers = if rcode == RCode::OK as u8 && tc == 0 {
        request
            .queries
            .iter()
            .take(1)
            .map(|q| Answer::new(q.name.clone(), RRType::A, RRClass::IN, 60, &data))
            .collect()
    } else {
        vec![]
    };

    DNSHdr::new(
        request.id,
        Flags {
            qr: 1,
            aa: 0,
            tc,
            ra: 1,
            rcode,
            ..request.flags
        },
        request.queries.clone(),
        answers,
    )
    .to_bytes()
}

fn serve_udp(socket: UdpSocket, behavior: Behavior, stop: &AtomicBool, received: &AtomicUsize) {
    let mut buf = [0; 512];

    while !stop.load(Ordering::SeqCst) {
        let (size, source) = match socket.recv_from(&mut buf) {
            Ok(ok) => ok,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) => {
                eprintln!("Error receiving data: {}", e);
                break;
            }
        };
        let seen = received.fetch_add(1, Ordering::SeqCst) + 1;

        let Ok((_, request)) = DNSHdr::from_bytes(&buf[..size]) else {
            continue;
        };
        let response = match behavior {
            Behavior::Silent => continue,
            Behavior::DropFirst(n) if seen <= n => continue,
            Behavior::Answer | Behavior::DropFirst(_) => respond(&request, RCode::OK as u8, 0),
            Behavior::Rcode(rcode) => respond(&request, rcode, 0),
            Behavior::Truncate => respond(&request, RCode::OK as u8, 1),
            Behavior::WrongIdFirst => {
                let wrong = DNSHdr {
                    id: request.id.wrapping_add(1),
                    ..DNSHdr::new(request.id, request.flags, request.queries.clone(), vec![])
                };
                let _ = socket.send_to(&respond(&wrong, RCode::OK as u8, 0), source);
                respond(&request, RCode::OK as u8, 0)
            }
        };

        let _ = socket.send_to(&response, source);
    }
}

fn serve_tcp(listener: TcpListener, stop: &AtomicBool, served: &AtomicUsize) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let _ = answer_tcp(stream, served);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5))
            }
            Err(_) => break,
        }
    }
}

fn answer_tcp(mut stream: TcpStream, served: &AtomicUsize) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut len = [0u8; 2];
    stream.read_exact(&mut len)?;
    let mut msg = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut msg)?;

    let (_, request) = DNSHdr::from_bytes(&msg)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
    let response = respond(&request, RCode::OK as u8, 0);
    served.fetch_add(1, Ordering::SeqCst);
    stream.write_all(&(response.len() as u16).to_be_bytes())?;
    stream.write_all(&response)
}
