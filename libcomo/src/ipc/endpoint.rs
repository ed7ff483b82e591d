//! Cooperative IPC endpoint.
//!
//! Each process owns exactly one `Endpoint`. It polls the listening socket
//! and every peer socket, reads complete frames, and dispatches them to the
//! handler registered for the message type. Handlers queue replies on a
//! `Mailbox`; the endpoint drains the mailbox after each handler returns so
//! that at most one handler runs at a time and writes complete before the
//! next message is read.

use crate::buffer::Buffer;
use crate::error::{ComoError, ComoResult, Outcome};
use crate::ipc::frame::{self, msg, FrameHeader, CONNECT_SIZE, HEADER_SIZE};
use crate::ipc::peer::PeerId;
use crate::logging::{self, Logger};
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use std::io::Write;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

const READ_BUF_SIZE: usize = 65536;
const WRITE_BUF_SIZE: usize = 65536;
const LISTENER_TOKEN: mio::Token = mio::Token(0);

/// Index of a connected peer within the endpoint.
pub type PeerSlot = usize;

/// Handler for one message type. Returns the outcome the event loop acts on;
/// replies go through the mailbox, never directly to a socket.
pub type Handler<C> = fn(&mut C, &mut Mailbox, &Envelope, &[u8]) -> ComoResult<Outcome>;

/// Sender context delivered to a handler alongside the payload.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub slot: PeerSlot,
    pub sender: PeerId,
    pub mtype: u16,
    /// Sender uses the opposite byte order; multi-byte payload fields must
    /// be swapped by the handler's decoder.
    pub swap: bool,
}

/// Outgoing messages queued by a handler.
pub struct Mailbox {
    out: Vec<(PeerSlot, u16, Vec<u8>)>,
}

impl Mailbox {
    fn new() -> Mailbox {
        Mailbox { out: Vec::new() }
    }

    #[inline]
    pub fn send(&mut self, to: PeerSlot, mtype: u16, payload: Vec<u8>) {
        self.out.push((to, mtype, payload));
    }
}

enum ChannelState {
    /// Socket is up, CONNECT not yet received.
    Greeting,
    /// CONNECT received; the peer identity and byte order are latched.
    Connected(PeerId),
    Closed,
}

struct Channel {
    stream: Option<TcpStream>,
    state: ChannelState,
    swap: bool,
    read_buffer: Buffer,
    write_buffer: Buffer,
}

impl Channel {
    fn new(stream: TcpStream) -> Channel {
        Channel {
            stream: Some(stream),
            state: ChannelState::Greeting,
            swap: false,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
        }
    }

    fn peer(&self) -> Option<&PeerId> {
        match &self.state {
            ChannelState::Connected(peer) => Some(peer),
            _ => None,
        }
    }

    fn is_open(&self) -> bool {
        !matches!(self.state, ChannelState::Closed)
    }

    /// Pulls all available data off the socket. Returns true on EOF.
    fn fill(&mut self) -> ComoResult<bool> {
        let stream = self.stream.as_ref().expect("channel must have a stream");
        loop {
            self.read_buffer.ensure_capacity(READ_BUF_SIZE);
            match self.read_buffer.ingress(stream) {
                Ok((_, true)) => return Ok(true),
                Ok((_, false)) => continue,
                Err(err) => {
                    let folded: ComoError = err.into();
                    return match folded {
                        ComoError::Again => Ok(false),
                        other => Err(other),
                    };
                }
            }
        }
    }

    /// Parses one complete frame from the read buffer, if present.
    fn next_frame(&mut self) -> ComoResult<Option<(FrameHeader, Vec<u8>)>> {
        let data = self.read_buffer.data_slice();
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }

        // The CONNECT header arrives before the swap flag exists; its type
        // is 0, which reads the same in either byte order, and its fixed
        // payload length probes the sender's byte order.
        let swap = if frame::raw_type(data) == msg::CONNECT {
            frame::probe_connect_order(frame::raw_len(data))?
        } else {
            self.swap
        };
        let header = FrameHeader::read(data, swap)?;

        let total = HEADER_SIZE + header.len as usize;
        if data.len() < total {
            return Ok(None);
        }

        let payload = data[HEADER_SIZE..total].to_vec();
        self.read_buffer.consume(total);

        if header.mtype == msg::CONNECT {
            if header.len as usize != CONNECT_SIZE {
                return Err(ComoError::Malformed("invalid connect message"));
            }
            self.swap = swap;
            self.state = ChannelState::Connected(header.sender);
        }

        Ok(Some((header, payload)))
    }

    /// Queues a frame and drains the write buffer. Local peers drain fast;
    /// a persistently full socket buffer means the peer stalled, and the
    /// short sleep keeps this loop cooperative rather than spinning.
    fn send(&mut self, me: &PeerId, mtype: u16, payload: &[u8]) -> ComoResult<()> {
        let header = FrameHeader {
            mtype,
            sender: *me,
            len: payload.len() as u32,
        };

        let mut head = [0u8; HEADER_SIZE];
        header.write(&mut head)?;

        self.write_buffer.ensure_capacity(HEADER_SIZE + payload.len());
        self.write_buffer.push_bytes(&head);
        self.write_buffer.push_bytes(payload);

        self.flush()
    }

    fn flush(&mut self) -> ComoResult<()> {
        let deadline = Instant::now() + Duration::from_secs(30);

        while !self.write_buffer.is_empty() {
            let stream = self.stream.as_ref().expect("channel must have a stream");
            match self.write_buffer.egress(stream) {
                Ok(_) => {}
                Err(err) => {
                    let folded: ComoError = err.into();
                    match folded {
                        ComoError::Again => {
                            if Instant::now() >= deadline {
                                return Err(ComoError::Io(std::io::ErrorKind::TimedOut));
                            }
                            thread::sleep(Duration::from_millis(1));
                        }
                        other => return Err(other),
                    }
                }
            }
        }

        let stream = self.stream.as_mut().expect("channel must have a stream");
        drop(stream.flush());
        Ok(())
    }

    fn close(&mut self) {
        self.state = ChannelState::Closed;
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.stream.take();
    }
}

pub struct Endpoint<C> {
    me: PeerId,
    listener: Option<TcpListener>,
    poll: mio::Poll,
    events: mio::Events,
    channels: Vec<Channel>,
    free: Vec<PeerSlot>,
    live: IndexSet<PeerSlot>,
    handlers: HashMap<u16, Handler<C>>,
    /// Frames set aside while a blocking `request` was in flight.
    pending: Vec<(Envelope, Vec<u8>)>,
    log: Logger,
}

impl<C> Endpoint<C> {
    pub fn new(me: PeerId, log: &Logger) -> ComoResult<Endpoint<C>> {
        Ok(Endpoint {
            me,
            listener: None,
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(1024),
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            handlers: HashMap::new(),
            pending: Vec::new(),
            log: log.new(logging::o!("peer" => me.to_string())),
        })
    }

    pub fn me(&self) -> &PeerId {
        &self.me
    }

    /// Registers the handler for a message type. Registration happens once
    /// per process during startup; re-registration is a programming error.
    pub fn register(&mut self, mtype: u16, handler: Handler<C>) {
        if self.handlers.insert(mtype, handler).is_some() {
            panic!("Duplicate IPC handler for message type {}", mtype);
        }
    }

    /// Binds the listening socket other processes connect to.
    pub fn listen(&mut self, address: &str) -> ComoResult<SocketAddr> {
        let listener = TcpListener::bind(&address.parse::<SocketAddr>()?)?;
        let local = listener.local_addr()?;

        self.poll.register(
            &listener,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;
        self.listener = Some(listener);

        logging::info!(self.log, "listening for peers"; "address" => %local);
        Ok(local)
    }

    /// Connects to a peer's listening socket and announces this endpoint
    /// with a CONNECT frame. The handshake is one-directional: the caller
    /// dialed a known process, so `expect` latches the peer identity on
    /// this side. Returns the slot the peer occupies.
    pub fn connect(&mut self, address: &str, expect: PeerId) -> ComoResult<PeerSlot> {
        let addr = address.parse::<SocketAddr>()?;

        // mio streams connect asynchronously; retry until the peer accepts.
        let deadline = Instant::now() + Duration::from_secs(10);
        let stream = loop {
            match std::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    break TcpStream::from_stream(stream)?;
                }
                Err(_) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20))
                }
                Err(err) => return Err(err.into()),
            }
        };

        let slot = self.install(stream)?;
        let connect = frame::connect_frame(&self.me);

        let channel = &mut self.channels[slot];
        channel.state = ChannelState::Connected(expect);
        channel.write_buffer.push_bytes(&connect);
        channel.flush()?;

        logging::info!(self.log, "connected to peer"; "address" => %addr, "slot" => slot);
        Ok(slot)
    }

    /// Sends one message to a connected peer.
    pub fn send(&mut self, to: PeerSlot, mtype: u16, payload: &[u8]) -> ComoResult<()> {
        let me = self.me;
        let channel = self
            .channels
            .get_mut(to)
            .ok_or(ComoError::Malformed("bad peer slot"))?;
        if !channel.is_open() {
            return Err(ComoError::PeerGone);
        }
        channel.send(&me, mtype, payload)
    }

    /// Finds the slot of the first connected peer of the given class.
    pub fn peer_of_class(&self, class: u8) -> Option<PeerSlot> {
        self.live.iter().copied().find(|&slot| {
            self.channels[slot]
                .peer()
                .map(|peer| peer.class == class)
                .unwrap_or(false)
        })
    }

    pub fn peer_id(&self, slot: PeerSlot) -> Option<PeerId> {
        self.channels.get(slot).and_then(|c| c.peer().copied())
    }

    /// Runs one cooperative iteration: accept new peers, read frames,
    /// dispatch handlers, flush replies. `timeout` bounds the poll wait.
    pub fn poll_once(&mut self, ctx: &mut C, timeout: Option<Duration>) -> ComoResult<()> {
        // Frames parked by a blocking request() run first.
        let parked: Vec<_> = self.pending.drain(..).collect();
        for (envelope, payload) in parked {
            self.dispatch(ctx, envelope, &payload)?;
        }

        self.poll
            .poll(&mut self.events, timeout)
            .map_err(ComoError::from)?;

        let mut ready: Vec<PeerSlot> = Vec::new();
        let mut accept = false;
        for event in &self.events {
            if event.token() == LISTENER_TOKEN {
                accept = true;
            } else {
                ready.push(event.token().0 - 1);
            }
        }

        if accept {
            self.accept_peers()?;
        }

        for slot in ready {
            self.service(ctx, slot)?;
        }

        Ok(())
    }

    /// Blocking round-trip with a single peer: send `mtype` and wait for a
    /// reply of type `expect`. Unrelated frames arriving meanwhile are
    /// parked for the next `poll_once`.
    pub fn request(
        &mut self,
        to: PeerSlot,
        mtype: u16,
        payload: &[u8],
        expect: u16,
        timeout: Duration,
    ) -> ComoResult<(Envelope, Vec<u8>)> {
        self.send(to, mtype, payload)?;
        self.wait_for(to, expect, timeout)
    }

    /// Waits for a frame of type `expect` from `from`, parking anything else.
    pub fn wait_for(
        &mut self,
        from: PeerSlot,
        expect: u16,
        timeout: Duration,
    ) -> ComoResult<(Envelope, Vec<u8>)> {
        let deadline = Instant::now() + timeout;

        loop {
            loop {
                let channel = self
                    .channels
                    .get_mut(from)
                    .ok_or(ComoError::Malformed("bad peer slot"))?;
                if !channel.is_open() {
                    return Err(ComoError::PeerGone);
                }

                let frame = channel.next_frame()?;
                let swap = channel.swap;

                match frame {
                    Some((header, payload)) => {
                        let envelope = Envelope {
                            slot: from,
                            sender: header.sender,
                            mtype: header.mtype,
                            swap,
                        };
                        if header.mtype == expect {
                            return Ok((envelope, payload));
                        }
                        self.pending.push((envelope, payload));
                    }
                    None => break,
                }
            }

            let channel = &mut self.channels[from];
            let eof = channel.fill()?;
            if eof && channel.read_buffer.is_empty() {
                channel.close();
                self.live.remove(&from);
                self.free.push(from);
                return Err(ComoError::PeerGone);
            }

            if !channel.read_buffer.is_empty() {
                continue;
            }

            if Instant::now() >= deadline {
                return Err(ComoError::Io(std::io::ErrorKind::TimedOut));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn accept_peers(&mut self) -> ComoResult<()> {
        loop {
            let listener = self.listener.as_ref().expect("accept without listener");
            match listener.accept() {
                Ok((stream, addr)) => {
                    let slot = self.install(stream)?;
                    logging::debug!(self.log, "accepted peer connection";
                                    "address" => %addr, "slot" => slot);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn install(&mut self, stream: TcpStream) -> ComoResult<PeerSlot> {
        stream.set_nodelay(true).ok();

        let slot = match self.free.pop() {
            Some(slot) => {
                self.channels[slot] = Channel::new(stream);
                slot
            }
            None => {
                self.channels.push(Channel::new(stream));
                self.channels.len() - 1
            }
        };

        self.poll.register(
            self.channels[slot].stream.as_ref().expect("fresh channel has a stream"),
            mio::Token(slot + 1),
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;
        self.live.insert(slot);

        Ok(slot)
    }

    /// Reads and dispatches everything available on one peer socket.
    fn service(&mut self, ctx: &mut C, slot: PeerSlot) -> ComoResult<()> {
        if slot >= self.channels.len() || !self.channels[slot].is_open() {
            return Ok(());
        }

        let eof = match self.channels[slot].fill() {
            Ok(eof) => eof,
            Err(err) => {
                logging::warn!(self.log, "peer read failed";
                               "slot" => slot, "error" => ?err);
                self.teardown(slot);
                return Ok(());
            }
        };

        loop {
            let frame = match self.channels[slot].next_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    // Partial or malformed frames tear the peer down, never
                    // the process.
                    logging::warn!(self.log, "malformed frame from peer";
                                   "slot" => slot, "error" => ?err);
                    self.teardown(slot);
                    return Ok(());
                }
            };

            let (header, payload) = match frame {
                Some(frame) => frame,
                None => break,
            };

            if header.mtype == msg::CONNECT {
                let peer = self
                    .channels[slot]
                    .peer()
                    .copied()
                    .expect("connect frame latches the peer");
                logging::info!(self.log, "peer identified";
                               "slot" => slot, "name" => peer.to_string());
                continue;
            }

            let peer = match self.channels[slot].peer().copied() {
                Some(peer) => peer,
                None => {
                    logging::warn!(self.log, "message before connect"; "slot" => slot);
                    self.teardown(slot);
                    return Ok(());
                }
            };

            if peer.class != header.sender.class {
                return Err(ComoError::Fatal("peer class mismatch"));
            }

            let envelope = Envelope {
                slot,
                sender: header.sender,
                mtype: header.mtype,
                swap: self.channels[slot].swap,
            };

            self.dispatch(ctx, envelope, &payload)?;

            if slot >= self.channels.len() || !self.channels[slot].is_open() {
                return Ok(());
            }
        }

        if eof && self.channels[slot].read_buffer.is_empty() {
            logging::info!(self.log, "peer closed connection"; "slot" => slot);
            self.teardown(slot);
        }

        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut C, envelope: Envelope, payload: &[u8]) -> ComoResult<()> {
        let handler = match self.handlers.get(&envelope.mtype) {
            Some(handler) => *handler,
            None => {
                logging::info!(self.log, "unhandled message type";
                               "type" => envelope.mtype,
                               "from" => envelope.sender.to_string());
                return Ok(());
            }
        };

        let mut mailbox = Mailbox::new();
        let outcome = match handler(ctx, &mut mailbox, &envelope, payload) {
            Ok(outcome) => outcome,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                logging::warn!(self.log, "handler failed";
                               "type" => envelope.mtype, "error" => ?err);
                Outcome::Err
            }
        };

        // Writes queued by the handler complete before the next message is
        // read anywhere.
        for (to, mtype, bytes) in mailbox.out {
            if let Err(err) = self.send(to, mtype, &bytes) {
                logging::warn!(self.log, "reply failed";
                               "to" => to, "type" => mtype, "error" => ?err);
                self.teardown(to);
            }
        }

        match outcome {
            Outcome::Ok | Outcome::Again => {}
            Outcome::Eof | Outcome::Close | Outcome::Err => self.teardown(envelope.slot),
        }

        Ok(())
    }

    /// Closes a peer and drops all pending traffic to it. Other peers are
    /// unaffected.
    pub fn teardown(&mut self, slot: PeerSlot) {
        if let Some(channel) = self.channels.get_mut(slot) {
            if channel.is_open() {
                if let Some(stream) = channel.stream.as_ref() {
                    drop(self.poll.deregister(stream));
                }
                channel.close();
                self.live.remove(&slot);
                self.free.push(slot);
                self.pending.retain(|(envelope, _)| envelope.slot != slot);
            }
        }
    }

    /// Number of currently connected peers.
    pub fn live_peers(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::peer::class;

    struct TestCtx {
        seen: Vec<(u16, Vec<u8>)>,
    }

    fn record_and_ack(
        ctx: &mut TestCtx,
        mail: &mut Mailbox,
        env: &Envelope,
        payload: &[u8],
    ) -> ComoResult<Outcome> {
        ctx.seen.push((env.mtype, payload.to_vec()));
        mail.send(env.slot, msg::ACK, Vec::new());
        Ok(Outcome::Ok)
    }

    fn record_only(
        ctx: &mut TestCtx,
        _mail: &mut Mailbox,
        env: &Envelope,
        payload: &[u8],
    ) -> ComoResult<Outcome> {
        ctx.seen.push((env.mtype, payload.to_vec()));
        Ok(Outcome::Ok)
    }

    fn pump<C>(server: &mut Endpoint<C>, ctx: &mut C, rounds: usize) {
        for _ in 0..rounds {
            server
                .poll_once(ctx, Some(Duration::from_millis(10)))
                .unwrap();
        }
    }

    #[test]
    fn test_connect_and_dispatch() {
        let log = logging::discard();

        let mut server: Endpoint<TestCtx> = Endpoint::new(PeerId::supervisor(), &log).unwrap();
        server.register(msg::SYNC, record_and_ack);
        let addr = server.listen("127.0.0.1:0").unwrap();

        let mut client: Endpoint<TestCtx> = Endpoint::new(PeerId::capture(), &log).unwrap();
        let slot = client
            .connect(&addr.to_string(), PeerId::supervisor())
            .unwrap();

        let mut server_ctx = TestCtx { seen: Vec::new() };
        let mut client_ctx = TestCtx { seen: Vec::new() };

        // Let the server pick up the connection and the CONNECT frame.
        pump(&mut server, &mut server_ctx, 3);

        client.send(slot, msg::SYNC, b"ready").unwrap();

        // Server dispatches SYNC and replies with ACK; the client waits for it.
        let mut got_ack = false;
        for _ in 0..50 {
            pump(&mut server, &mut server_ctx, 1);
            match client.wait_for(slot, msg::ACK, Duration::from_millis(20)) {
                Ok((env, _)) => {
                    assert_eq!(env.sender.class, class::SUPERVISOR);
                    got_ack = true;
                    break;
                }
                Err(ComoError::Io(_)) => continue,
                Err(err) => panic!("unexpected error {:?}", err),
            }
        }

        assert!(got_ack);
        assert_eq!(server_ctx.seen, vec![(msg::SYNC, b"ready".to_vec())]);
        drop(client_ctx);
    }

    #[test]
    fn test_peer_teardown_on_disconnect() {
        let log = logging::discard();

        let mut server: Endpoint<TestCtx> = Endpoint::new(PeerId::storage(), &log).unwrap();
        server.register(msg::SYNC, record_only);
        let addr = server.listen("127.0.0.1:0").unwrap();

        let mut ctx = TestCtx { seen: Vec::new() };

        {
            let mut client: Endpoint<TestCtx> =
                Endpoint::new(PeerId::query(), &log).unwrap();
            client
                .connect(&addr.to_string(), PeerId::storage())
                .unwrap();
            pump(&mut server, &mut ctx, 3);
            assert_eq!(server.live_peers(), 1);
        }

        // Dropping the client closes its socket; the server sees EOF and
        // cleans up that peer without affecting the process.
        pump(&mut server, &mut ctx, 5);
        assert_eq!(server.live_peers(), 0);
    }
}
