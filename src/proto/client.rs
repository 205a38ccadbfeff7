//! One-shot framed TCP client.
//!
//! The wire protocol is one request and one response per connection, so
//! every call opens a fresh socket, applies the configured deadlines,
//! and closes on return.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::proto::frame::{FrameError, FrameReader, FrameWriter};
use crate::proto::message::{Message, MessageError, ResponsePayload};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("peer closed connection before responding")]
    NoResponse,
    #[error("peer sent a non-response message: {kind}/{action}")]
    UnexpectedReply { kind: String, action: String },
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Connect { .. } | ClientError::NoResponse => ErrorKind::Unavailable,
            ClientError::Io(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                ErrorKind::Timeout
            }
            ClientError::Io(_) => ErrorKind::Unavailable,
            ClientError::Frame(err) => err.kind(),
            ClientError::Message(err) => err.kind(),
            ClientError::UnexpectedReply { .. } => ErrorKind::Protocol,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Client {
    pub connect_timeout: Duration,
    pub io_deadline: Duration,
    pub max_frame_bytes: usize,
}

impl Client {
    pub fn new(connect_timeout: Duration, io_deadline: Duration, max_frame_bytes: usize) -> Self {
        Self {
            connect_timeout,
            io_deadline,
            max_frame_bytes,
        }
    }

    /// Sends one sealed message and returns the verified response.
    pub fn call(&self, addr: SocketAddr, msg: &Message) -> Result<Message, ClientError> {
        self.call_bytes(addr, &msg.to_bytes()?)
    }

    /// Sends pre-serialized message bytes; used by fan-out, where one
    /// sealed message goes to many peers.
    pub fn call_bytes(&self, addr: SocketAddr, bytes: &[u8]) -> Result<Message, ClientError> {
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|source| ClientError::Connect { addr, source })?;
        stream.set_read_timeout(Some(self.io_deadline))?;
        stream.set_write_timeout(Some(self.io_deadline))?;
        stream.set_nodelay(true)?;

        let reader_stream = stream.try_clone()?;
        let mut writer = FrameWriter::new(stream, self.max_frame_bytes);
        writer.write_frame(bytes)?;

        let mut reader = FrameReader::new(reader_stream, self.max_frame_bytes);
        let Some(bytes) = reader.read_next()? else {
            return Err(ClientError::NoResponse);
        };
        let response = Message::from_slice(&bytes)?;
        response.verify_checksum()?;
        if response.kind != "response" {
            return Err(ClientError::UnexpectedReply {
                kind: response.kind,
                action: response.action,
            });
        }
        Ok(response)
    }

    /// `call`, then unwraps the standard response payload.
    pub fn call_expect(
        &self,
        addr: SocketAddr,
        msg: &Message,
    ) -> Result<(Message, ResponsePayload), ClientError> {
        let response = self.call(addr, msg)?;
        let payload = ResponsePayload::from_content(&response.content)?;
        Ok((response, payload))
    }
}
