//! Per-socket listeners and the TCP framing state machines.
//!
//! A UDP port turns each datagram into one request. A TCP port accepts
//! connections; each connection reads one length-prefixed frame through a
//! [FrameReader] and writes its answer back through a [FrameWriter].

#[cfg(feature = "logging")]
use crate::log::{trace, warn};
use crate::{
    buffer::Buffer,
    error::{e_fmt, Error, Result},
    request::RequestHandler,
    rope::Rope,
};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream, UdpSocket as MioUdpSocket};
use socket2::Socket;
use std::{
    fmt,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, UdpSocket},
};

/// Size of the 16-bit length prefix in front of every TCP message.
pub const TCP_LENGTH_PREFIX: usize = 2;

/// Chunk size for each read from a TCP connection.
const TCP_READ_CHUNK: usize = 4096;

/// Handle to a port opened on a [DnsServer](crate::DnsServer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub(crate) usize);

pub(crate) enum PortSocket {
    Udp(MioUdpSocket),
    Tcp(MioTcpListener),
}

pub(crate) struct Port {
    pub(crate) socket: PortSocket,
    pub(crate) handler: Box<dyn RequestHandler + Send>,
}

impl Port {
    pub(crate) fn new(
        socket: Socket,
        is_tcp: bool,
        handler: Box<dyn RequestHandler + Send>,
    ) -> Result<Self> {
        socket
            .set_nonblocking(true)
            .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;

        let socket = if is_tcp {
            PortSocket::Tcp(MioTcpListener::from_std(TcpListener::from(socket)))
        } else {
            PortSocket::Udp(MioUdpSocket::from_std(UdpSocket::from(socket)))
        };
        Ok(Self { socket, handler })
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.socket {
            PortSocket::Udp(sock) => sock.local_addr(),
            PortSocket::Tcp(listener) => listener.local_addr(),
        }
    }

    pub(crate) const fn is_tcp(&self) -> bool {
        matches!(self.socket, PortSocket::Tcp(_))
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.socket {
            PortSocket::Udp(sock) => write!(f, "UdpPort({:?})", sock.local_addr()),
            PortSocket::Tcp(listener) => write!(f, "TcpPort({:?})", listener.local_addr()),
        }
    }
}

/// Creates a UDP socket bound to `addr`, ready for [DnsServer::open_port](crate::DnsServer::open_port).
pub fn new_udp_socket(addr: SocketAddr) -> Result<Socket> {
    new_socket(addr, socket2::Type::DGRAM)
}

/// Creates a TCP socket bound to `addr` and listening with `backlog`.
pub fn new_tcp_listener(addr: SocketAddr, backlog: i32) -> Result<Socket> {
    let sock = new_socket(addr, socket2::Type::STREAM)?;
    sock.listen(backlog)
        .map_err(|e| e_fmt!("listen on {} failed: {}", &addr, e))?;
    Ok(sock)
}

fn new_socket(addr: SocketAddr, ty: socket2::Type) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let fd = Socket::new(domain, ty, None).map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.set_reuse_address(true)
        .map_err(|e| e_fmt!("set ReuseAddr failed: {}", e))?;
    fd.set_nonblocking(true)
        .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;
    fd.bind(&addr.into())
        .map_err(|e| e_fmt!("socket bind to {} failed: {}", &addr, e))?;

    trace!("new socket bind to {}", &addr);
    Ok(fd)
}

/// Where a TCP request is in its life.
///
/// `Accepted -> AwaitingLength -> AwaitingBody -> Complete`, with `TimedOut`
/// and `Aborted` reachable from any state that is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRequestState {
    Accepted,
    AwaitingLength,
    AwaitingBody,
    Complete,
    TimedOut,
    Aborted,
}

impl TcpRequestState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::TimedOut | Self::Aborted)
    }
}

/// Reassembles one length-prefixed DNS message from a TCP stream.
#[derive(Debug)]
pub struct FrameReader {
    rope: Rope,
    expected_len: Option<usize>,
    state: TcpRequestState,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of draining a readable TCP connection.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// No complete frame yet; wait for the next readiness.
    Pending,

    /// A complete message, without its length prefix.
    Frame(Buffer),

    /// The peer closed the connection before the frame completed.
    Closed,

    Failed(Error),
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            rope: Rope::new(),
            expected_len: None,
            state: TcpRequestState::Accepted,
        }
    }

    pub const fn state(&self) -> TcpRequestState {
        self.state
    }

    /// Length of the message body once the prefix has arrived.
    pub const fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    /// Number of bytes buffered so far, prefix included.
    pub fn buffered(&self) -> usize {
        self.rope.len()
    }

    /// Appends `bytes` read from the stream.
    ///
    /// Returns the message body once `expected length + 2` bytes are
    /// buffered. Bytes beyond the declared length are dropped with a warning.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<Buffer>> {
        if self.state.is_terminal() {
            return Err(Error::GeneralFailure(format!(
                "frame reader is already {:?}",
                self.state
            )));
        }

        self.rope.append_bytes(bytes)?;
        if self.state == TcpRequestState::Accepted {
            self.state = TcpRequestState::AwaitingLength;
        }

        if self.expected_len.is_none() && self.rope.len() >= TCP_LENGTH_PREFIX {
            let prefix = self.rope.slice(0, TCP_LENGTH_PREFIX as isize)?;
            let expected = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
            trace!("TCP frame length prefix: {}", expected);
            self.expected_len = Some(expected);
            self.state = TcpRequestState::AwaitingBody;
        }

        let expected = match self.expected_len {
            Some(expected) if self.rope.len() >= expected + TCP_LENGTH_PREFIX => expected,
            _ => return Ok(None),
        };

        let frame = self.rope.flatten()?;
        let extra = frame.len() - expected - TCP_LENGTH_PREFIX;
        if extra > 0 {
            warn!("TCP frame of {} bytes followed by {} extra bytes, ignored", expected, extra);
        }
        self.state = TcpRequestState::Complete;
        self.rope = Rope::new();

        Buffer::from_slice(&frame[TCP_LENGTH_PREFIX..TCP_LENGTH_PREFIX + expected]).map(Some)
    }

    /// Reads everything currently available from `stream`.
    pub(crate) fn read_from<R: Read>(&mut self, stream: &mut R) -> ReadOutcome {
        let mut buf = [0u8; TCP_READ_CHUNK];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.state = TcpRequestState::Aborted;
                    return ReadOutcome::Closed;
                }
                Ok(sz) => match self.push(&buf[..sz]) {
                    Ok(Some(frame)) => return ReadOutcome::Frame(frame),
                    Ok(None) => continue,
                    Err(e) => {
                        self.state = TcpRequestState::Aborted;
                        return ReadOutcome::Failed(e);
                    }
                },
                Err(e) if is_retryable(&e) => return ReadOutcome::Pending,
                Err(e) => {
                    self.state = TcpRequestState::Aborted;
                    return ReadOutcome::Failed(e_fmt!("TCP read failed: {}", e));
                }
            }
        }
    }

    pub(crate) fn time_out(&mut self) {
        if !self.state.is_terminal() {
            self.state = TcpRequestState::TimedOut;
        }
    }
}

/// Writes one encoded frame to a TCP stream across as many writable events as needed.
#[derive(Debug)]
pub struct FrameWriter {
    frame: Buffer,
    sent: usize,
}

impl FrameWriter {
    pub fn new(frame: Buffer) -> Self {
        Self { frame, sent: 0 }
    }

    pub const fn sent(&self) -> usize {
        self.sent
    }

    pub fn is_done(&self) -> bool {
        self.sent == self.frame.len()
    }

    /// Writes as many remaining bytes as `stream` accepts.
    ///
    /// Returns `Ok(true)` once the whole frame is out, `Ok(false)` if the
    /// stream would block first.
    pub(crate) fn write_to<W: Write>(&mut self, stream: &mut W) -> Result<bool> {
        while !self.is_done() {
            match stream.write(&self.frame[self.sent..]) {
                Ok(0) => return Err(e_fmt!("TCP write returned 0 bytes")),
                Ok(sz) => self.sent += sz,
                Err(e) if is_retryable(&e) => return Ok(false),
                Err(e) => return Err(e_fmt!("TCP write failed: {}", e)),
            }
        }
        Ok(true)
    }
}

/// One accepted TCP connection: reading its request, then writing its response.
#[derive(Debug)]
pub(crate) struct TcpConnection {
    pub(crate) stream: MioTcpStream,
    pub(crate) peer: SocketAddr,
    pub(crate) port: PortId,

    /// UNIX time in millis after which the connection is dropped.
    pub(crate) deadline: u64,
    pub(crate) phase: ConnectionPhase,
}

#[derive(Debug)]
pub(crate) enum ConnectionPhase {
    Reading(FrameReader),

    /// The frame was read and handed to the handler; no response yet.
    Handling,
    Writing(FrameWriter),
}

impl TcpConnection {
    pub(crate) fn new(stream: MioTcpStream, peer: SocketAddr, port: PortId, deadline: u64) -> Self {
        Self {
            stream,
            peer,
            port,
            deadline,
            phase: ConnectionPhase::Reading(FrameReader::new()),
        }
    }
}

/// EAGAIN and EINTR: nothing happened, try again on the next readiness.
pub(crate) fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::{FrameReader, FrameWriter, ReadOutcome, TcpRequestState};
    use crate::{buffer::Buffer, dns_message::Message, error::Error};
    use std::io::{self, Read, Write};
    use test_log::test;

    const WWW_QUERY: [u8; 21] = [
        0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, b'w', b'w',
        b'w', 0x00, 0x00, 0x01, 0x00, 0x01,
    ];

    fn framed(msg: &[u8]) -> Vec<u8> {
        let mut data = (msg.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(msg);
        data
    }

    /// Hands out its data in fixed-size pieces, then reports WouldBlock.
    struct Trickle {
        data: Vec<u8>,
        offset: usize,
        piece: usize,
        reads_left: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.reads_left == 0 || self.offset == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.reads_left -= 1;
            let n = self.piece.min(buf.len()).min(self.data.len() - self.offset);
            buf[..n].copy_from_slice(&self.data[self.offset..self.offset + n]);
            self.offset += n;
            Ok(n)
        }
    }

    /// Accepts at most `budget` bytes per readiness.
    struct Choked {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Choked {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.budget.min(buf.len());
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_in_one_push() {
        let mut reader = FrameReader::new();
        assert_eq!(reader.state(), TcpRequestState::Accepted);
        let frame = reader.push(&framed(&WWW_QUERY)).unwrap().unwrap();
        assert_eq!(frame.data(), &WWW_QUERY[..]);
        assert_eq!(reader.state(), TcpRequestState::Complete);
        assert!(reader.push(b"x").is_err());
    }

    #[test]
    fn test_frame_one_byte_at_a_time() {
        let data = framed(&WWW_QUERY);
        let mut reader = FrameReader::new();
        for (i, byte) in data.iter().enumerate() {
            let result = reader.push(&[*byte]).unwrap();
            match i {
                0 => assert_eq!(reader.state(), TcpRequestState::AwaitingLength),
                _ if i + 1 < data.len() => {
                    assert!(result.is_none());
                    assert_eq!(reader.state(), TcpRequestState::AwaitingBody);
                    assert_eq!(reader.expected_len(), Some(WWW_QUERY.len()));
                }
                _ => {
                    let frame = result.unwrap();
                    assert_eq!(Message::parse(frame.data()).unwrap().id, 1);
                }
            }
        }
        assert_eq!(reader.state(), TcpRequestState::Complete);
    }

    #[test]
    fn test_frame_random_splits_match_single_read() {
        let data = framed(&WWW_QUERY);
        let whole = FrameReader::new().push(&data).unwrap().unwrap();

        for _ in 0..100 {
            let mut reader = FrameReader::new();
            let mut rest = &data[..];
            let mut frames = Vec::new();
            while !rest.is_empty() {
                let n = fastrand::usize(1..=rest.len());
                if let Some(frame) = reader.push(&rest[..n]).unwrap() {
                    frames.push(frame);
                }
                rest = &rest[n..];
            }
            assert_eq!(frames, vec![whole.clone()]);
        }
    }

    #[test]
    fn test_frame_with_extra_bytes() {
        let mut data = framed(&WWW_QUERY);
        data.extend_from_slice(&[0xde, 0xad]);
        let frame = FrameReader::new().push(&data).unwrap().unwrap();
        assert_eq!(frame.data(), &WWW_QUERY[..]);
    }

    #[test]
    fn test_zero_length_frame_fails_to_parse() {
        let frame = FrameReader::new().push(&[0, 0]).unwrap().unwrap();
        assert!(frame.is_empty());
        assert_eq!(Message::parse(frame.data()), Err(Error::BodyTooShort));
    }

    #[test]
    fn test_read_from_across_readiness_events() {
        let mut stream = Trickle {
            data: framed(&WWW_QUERY),
            offset: 0,
            piece: 3,
            reads_left: 2,
        };
        let mut reader = FrameReader::new();
        assert!(matches!(reader.read_from(&mut stream), ReadOutcome::Pending));
        assert_eq!(reader.buffered(), 6);

        stream.reads_left = usize::MAX;
        match reader.read_from(&mut stream) {
            ReadOutcome::Frame(frame) => assert_eq!(frame.data(), &WWW_QUERY[..]),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_read_from_peer_closed() {
        let mut stream = io::Cursor::new(vec![0u8, 30, 1, 2]);
        let mut reader = FrameReader::new();
        assert!(matches!(reader.read_from(&mut stream), ReadOutcome::Closed));
        assert_eq!(reader.state(), TcpRequestState::Aborted);
    }

    #[test]
    fn test_time_out_keeps_terminal_state() {
        let mut reader = FrameReader::new();
        reader.push(&[0]).unwrap();
        reader.time_out();
        assert_eq!(reader.state(), TcpRequestState::TimedOut);

        let mut done = FrameReader::new();
        done.push(&framed(&WWW_QUERY)).unwrap();
        done.time_out();
        assert_eq!(done.state(), TcpRequestState::Complete);
    }

    #[test]
    fn test_frame_writer_partial_writes() {
        let frame = Buffer::from_slice(&framed(&WWW_QUERY)).unwrap();
        let mut writer = FrameWriter::new(frame.clone());
        let mut stream = Choked {
            out: Vec::new(),
            budget: 10,
        };

        assert!(!writer.write_to(&mut stream).unwrap());
        assert_eq!(writer.sent(), 10);

        stream.budget = 5;
        assert!(!writer.write_to(&mut stream).unwrap());
        assert_eq!(writer.sent(), 15);

        stream.budget = 100;
        assert!(writer.write_to(&mut stream).unwrap());
        assert!(writer.is_done());
        assert_eq!(stream.out, frame.data());
    }
}
