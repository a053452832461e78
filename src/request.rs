//! Pairing of an inbound message with where it came from, and the answer built for it.

use crate::{
    buffer::Buffer,
    dns_message::{Message, ResourceRecord},
    error::{Error, Result},
    port::PortId,
};
use std::{convert::TryFrom, net::SocketAddr};

/// Identifies one accepted TCP connection within a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) usize);

/// The transport a message arrived on, and how to reach the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Udp {
        peer: SocketAddr,
    },
    Tcp {
        peer: SocketAddr,
        connection: ConnectionId,
    },
}

impl Origin {
    pub const fn peer(&self) -> SocketAddr {
        match self {
            Self::Udp { peer } | Self::Tcp { peer, .. } => *peer,
        }
    }

    pub const fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }
}

/// A parsed inbound message and its transport origin.
#[derive(Debug, Clone)]
pub struct Request {
    message: Message,
    origin: Origin,
    port: PortId,
}

impl Request {
    pub fn new(message: Message, origin: Origin, port: PortId) -> Self {
        Self {
            message,
            origin,
            port,
        }
    }

    /// Decodes `bytes` into a request.
    pub fn parse(bytes: &[u8], origin: Origin, port: PortId) -> Result<Self> {
        Ok(Self::new(Message::parse(bytes)?, origin, port))
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    pub const fn port(&self) -> PortId {
        self.port
    }
}

/// The answer to one [Request].
///
/// A response holds its own copy of the request message and origin, so the
/// request can go away independently. The wire form is encoded lazily and
/// cached until the message is changed again.
#[derive(Debug, Clone)]
pub struct Response {
    message: Message,
    origin: Origin,
    port: PortId,
    encoded: Option<Buffer>,
}

impl Response {
    /// Creates a response to `request`: same id, same questions, response flag set.
    pub fn from_request(request: &Request) -> Self {
        let mut message = request.message.clone();
        message.is_response = true;
        Self {
            message,
            origin: request.origin,
            port: request.port,
            encoded: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        self.encoded = None;
        &mut self.message
    }

    pub fn add_answer(&mut self, record: ResourceRecord) {
        self.message_mut().add_answer(record);
    }

    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    pub const fn port(&self) -> PortId {
        self.port
    }

    /// Returns the wire form, encoding the message if not already encoded.
    pub fn encode(&mut self) -> Result<&Buffer> {
        if self.encoded.is_none() {
            self.encoded = Some(self.message.encode()?);
        }
        self.encoded
            .as_ref()
            .ok_or_else(|| Error::GeneralFailure("response lost its encoding".to_string()))
    }

    /// Consumes the response into one UDP datagram.
    pub(crate) fn into_datagram(mut self) -> Result<Buffer> {
        self.encode()?;
        self.encoded
            .take()
            .ok_or_else(|| Error::GeneralFailure("response lost its encoding".to_string()))
    }

    /// Consumes the response into one TCP frame: a 16-bit length, then the message.
    pub(crate) fn into_frame(self) -> Result<Buffer> {
        let message = self.into_datagram()?;
        let length = u16::try_from(message.len()).map_err(|_| {
            Error::GeneralFailure(format!("{} byte message does not fit a TCP frame", message.len()))
        })?;
        let mut frame = Buffer::empty(message.len() + 2)?;
        let data = frame.data_mut();
        data[..2].copy_from_slice(&length.to_be_bytes());
        data[2..].copy_from_slice(message.data());
        Ok(frame)
    }
}

/// Produces the response, if any, to each inbound request.
///
/// Called synchronously on the reactor thread; returning `None` sends nothing.
pub trait RequestHandler {
    fn on_request(&mut self, request: &Request) -> Option<Response>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&Request) -> Option<Response>,
{
    fn on_request(&mut self, request: &Request) -> Option<Response> {
        self(request)
    }
}
