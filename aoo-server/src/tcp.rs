//! The TCP session loop and the UDP socket runner.
//!
//! Single threaded: one poll set holds the listening socket, a waker for
//! cross-thread signalling (quit, push notifications, deferred request
//! completion) and one registration per client connection. Messages are
//! length prefixed; partial writes are buffered per connection and flushed
//! on writability.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use aoo_wire::framing::MessageReceiver;
use aoo_wire::{Id, MAX_PACKET_SIZE};

use crate::{error_code, AddressFamily, Server, ServerResult};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: Token = Token(2);

struct Connection {
    stream: TcpStream,
    client: Id,
    receiver: MessageReceiver,
    reply: Receiver<Vec<u8>>,
    outbuf: Vec<u8>,
}

/// Accept errors that must not stop the server: connection churn, signal
/// interruption, firewall rejections and descriptor exhaustion.
fn transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::PermissionDenied
    ) || matches!(e.raw_os_error(), Some(23) | Some(24)) // ENFILE / EMFILE
}

impl Server {
    /// Run the TCP session loop until [`Server::quit`]. Blocking; call
    /// from a dedicated thread.
    pub fn run(&self, port: u16) -> ServerResult<()> {
        let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
        let listener = TcpListener::bind(addr)?;
        self.run_loop(listener)
    }

    pub(crate) fn run_loop(&self, mut listener: TcpListener) -> ServerResult<()> {
        let mut poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        *self.waker.lock() = Some(waker);
        self.quit_flag.store(false, Ordering::Release);

        let mut events = Events::with_capacity(128);
        let mut connections: HashMap<Token, Connection> = HashMap::new();
        let mut tokens: HashMap<Id, Token> = HashMap::new();
        let mut next_token = FIRST_CLIENT.0;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            if self.quit_flag.load(Ordering::Acquire) {
                break;
            }
            // ping timers define the poll deadline
            let wait = self.update_ping_timers();
            self.dispatch_notifications();
            let mut broken = Vec::new();
            for (token, conn) in connections.iter_mut() {
                if !flush_connection(conn) {
                    broken.push(*token);
                }
            }
            for token in broken {
                if let Some(conn) = connections.remove(&token) {
                    tokens.remove(&conn.client);
                    self.on_client_disconnect(conn.client, error_code::OK, "send failed");
                }
            }
            // close sessions the server gave up on
            for id in self.closed.lock().drain(..) {
                if let Some(token) = tokens.remove(&id) {
                    connections.remove(&token);
                }
            }

            let timeout = if wait == f64::MAX {
                None
            } else {
                Some(Duration::from_secs_f64(wait.clamp(0.001, 3600.0)))
            };
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    *self.waker.lock() = None;
                    return Err(e.into());
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => loop {
                        match listener.accept() {
                            Ok((mut stream, peer)) => {
                                if let Err(e) = stream.set_nodelay(true) {
                                    log::warn!("server: couldn't set TCP_NODELAY: {}", e);
                                }
                                let token = Token(next_token);
                                next_token += 1;
                                if let Err(e) = poll.registry().register(
                                    &mut stream,
                                    token,
                                    Interest::READABLE | Interest::WRITABLE,
                                ) {
                                    log::error!("server: register failed: {}", e);
                                    continue;
                                }
                                let (tx, rx) = unbounded();
                                let client = self.add_client(tx);
                                connections.insert(
                                    token,
                                    Connection {
                                        stream,
                                        client,
                                        receiver: MessageReceiver::new(),
                                        reply: rx,
                                        outbuf: Vec::new(),
                                    },
                                );
                                tokens.insert(client, token);
                                log::debug!("server: accepted {} as client {}", peer, client);
                            }
                            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(ref e) if transient_accept_error(e) => {
                                log::debug!("server: accept() failed: {}", e);
                                if matches!(e.raw_os_error(), Some(23) | Some(24)) {
                                    // out of descriptors; back off instead
                                    // of spinning
                                    std::thread::sleep(Duration::from_millis(1));
                                }
                            }
                            Err(e) => {
                                log::error!("server: accept() failed: {}", e);
                                self.quit_flag.store(true, Ordering::Release);
                                break;
                            }
                        }
                    },
                    WAKER => {
                        // nothing to do here; the work happens at the top
                        // of the loop
                    }
                    token => {
                        let mut gone = false;
                        if event.is_readable() {
                            if let Some(conn) = connections.get_mut(&token) {
                                gone = !self.read_connection(conn, &mut buf);
                            }
                        }
                        if !gone && event.is_writable() {
                            if let Some(conn) = connections.get_mut(&token) {
                                if !flush_connection(conn) {
                                    self.on_client_disconnect(
                                        conn.client,
                                        error_code::OK,
                                        "send failed",
                                    );
                                    gone = true;
                                }
                            }
                        }
                        if gone {
                            if let Some(conn) = connections.remove(&token) {
                                tokens.remove(&conn.client);
                            }
                        }
                    }
                }
            }
        }

        *self.waker.lock() = None;
        // closing the sockets is enough; peers keep talking to each other
        connections.clear();
        Ok(())
    }

    /// Returns false when the connection is gone.
    fn read_connection(&self, conn: &mut Connection, buf: &mut [u8]) -> bool {
        loop {
            match conn.stream.read(buf) {
                Ok(0) => {
                    log::debug!("server: client {} disconnected", conn.client);
                    self.on_client_disconnect(conn.client, error_code::OK, "");
                    return false;
                }
                Ok(n) => {
                    let client = conn.client;
                    let mut messages: Vec<Vec<u8>> = Vec::new();
                    if conn
                        .receiver
                        .handle(&buf[..n], |m| {
                            messages.push(m.to_vec());
                            Ok(())
                        })
                        .is_err()
                    {
                        self.on_client_disconnect(
                            client,
                            error_code::BAD_FORMAT,
                            "bad message framing",
                        );
                        return false;
                    }
                    for message in messages {
                        if let Err((code, text)) = self.handle_client_message(client, &message) {
                            log::warn!("server: client {}: {}", client, text);
                            self.on_client_disconnect(client, code, &text);
                            return false;
                        }
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("server: recv() failed: {}", e);
                    self.on_client_disconnect(
                        conn.client,
                        error_code::OK,
                        &format!("socket error: {}", e),
                    );
                    return false;
                }
            }
        }
    }

    /// Receive UDP packets until [`Server::quit`]. Blocking; call from the
    /// network receive thread.
    pub fn run_udp(&self, port: u16) -> ServerResult<()> {
        let family = self.udp_family();
        let socket = bind_udp(port, family)?;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while !self.quit_flag.load(Ordering::Acquire) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    self.handle_udp_packet(&buf[..n], from, |data, dst| {
                        if let Err(e) = socket.send_to(data, dst) {
                            log::warn!("server: send_to({}) failed: {}", dst, e);
                        }
                    });
                }
                Err(ref e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn udp_family(&self) -> AddressFamily {
        // mirrors the relay configuration
        let config = self.udp_config.lock();
        config.family
    }
}

/// Drain the reply channel into the socket; false when the peer is gone.
fn flush_connection(conn: &mut Connection) -> bool {
    while let Ok(chunk) = conn.reply.try_recv() {
        conn.outbuf.extend_from_slice(&chunk);
    }
    while !conn.outbuf.is_empty() {
        match conn.stream.write(&conn.outbuf) {
            Ok(0) => return false,
            Ok(n) => {
                conn.outbuf.drain(..n);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("server: send() failed for client {}: {}", conn.client, e);
                return false;
            }
        }
    }
    true
}

/// Create the server UDP socket: address reuse, large buffers, a read
/// timeout for clean shutdown.
fn bind_udp(port: u16, family: AddressFamily) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let (domain, addr): (Domain, SocketAddr) = match family {
        AddressFamily::Ipv4 => (
            Domain::IPV4,
            (std::net::Ipv4Addr::UNSPECIFIED, port).into(),
        ),
        AddressFamily::Ipv6 | AddressFamily::DualStack => (
            Domain::IPV6,
            (std::net::Ipv6Addr::UNSPECIFIED, port).into(),
        ),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if family == AddressFamily::DualStack {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoo_wire::framing::write_frame;
    use aoo_wire::osc::{OscMessage, OscWriter};

    fn framed(msg: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_frame(&mut out, msg);
        out
    }

    fn read_reply(stream: &mut std::net::TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).expect("reply header");
        let size = i32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; size];
        stream.read_exact(&mut body).expect("reply body");
        body
    }

    #[test]
    fn test_tcp_session_login_and_join() {
        let server = Arc::new(Server::new());
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = {
            let server = server.clone();
            std::thread::spawn(move || server.run_loop(listener))
        };

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut w = OscWriter::new("/aoo/server/login");
        w.int32(1)
            .string(crate::VERSION)
            .string("")
            .metadata(None)
            .int32(0);
        client.write_all(&framed(&w.to_bytes())).unwrap();

        let reply = read_reply(&mut client);
        let msg = OscMessage::parse(&reply).unwrap();
        assert_eq!(msg.address(), "/aoo/client/login");
        let mut args = msg.args();
        assert_eq!(args.int32().unwrap(), 1);
        assert_eq!(args.int32().unwrap(), error_code::OK);
        assert_eq!(args.string().unwrap(), crate::VERSION);

        let mut w = OscWriter::new("/aoo/server/group/join");
        w.int32(2)
            .string("jam")
            .string("")
            .metadata(None)
            .string("solo")
            .string("")
            .metadata(None)
            .host(None);
        client.write_all(&framed(&w.to_bytes())).unwrap();

        let reply = read_reply(&mut client);
        let msg = OscMessage::parse(&reply).unwrap();
        assert_eq!(msg.address(), "/aoo/client/group/join");
        let mut args = msg.args();
        assert_eq!(args.int32().unwrap(), 2);
        assert_eq!(args.int32().unwrap(), error_code::OK);

        server.quit();
        handle.join().unwrap().unwrap();
    }
}
