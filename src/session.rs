//! Connected-session surface consumed by the bulk-ingestion paths.
//!
//! A [`Session`] wraps a stream that already completed the handshake and
//! authentication elsewhere, together with the negotiated capability bits
//! and the server's advertised `max_allowed_packet`. The bulk paths hold it
//! exclusively (`&mut`) for the duration of one operation, which matches the
//! half-duplex request/response shape of the wire protocol.

use crate::error::{Error, Result};
use crate::protocol::packet::{
    self, Capabilities, OkPacket, ServerReply, COM_QUERY, MAX_PAYLOAD,
};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A live, authenticated, half-duplex connection to a MySQL-compatible
/// server.
#[derive(Debug)]
pub struct Session<S> {
    stream: S,
    capabilities: Capabilities,
    max_allowed_packet: usize,
    sequence_id: u8,
    in_transaction: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already-connected stream. `max_allowed_packet` is the bound
    /// the server advertised for a single command payload.
    pub fn from_parts(stream: S, capabilities: Capabilities, max_allowed_packet: usize) -> Self {
        Self {
            stream,
            capabilities,
            max_allowed_packet,
            sequence_id: 0,
            in_transaction: false,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn max_allowed_packet(&self) -> usize {
        self.max_allowed_packet
    }

    /// Whether the caller has an open transaction on this session. The bulk
    /// paths never change transaction state; they only run inside it.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn set_in_transaction(&mut self, value: bool) {
        self.in_transaction = value;
    }

    /// Sends a `COM_QUERY` command. Commands restart the packet sequence.
    pub async fn send_command(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut payload = BytesMut::with_capacity(1 + sql.len());
        payload.put_u8(COM_QUERY);
        payload.put_slice(sql.as_bytes());
        self.write_frame(&payload).await
    }

    /// Writes one framed packet with the current sequence id.
    pub(crate) async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds the maximum packet size",
                payload.len()
            )));
        }
        let mut header = BytesMut::with_capacity(4);
        packet::write_packet_header(&mut header, payload.len(), self.sequence_id);
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    /// Reads one framed packet, enforcing sequence-id continuity.
    pub(crate) async fn read_frame(&mut self) -> Result<BytesMut> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await?;
        let (len, seq) = packet::read_packet_header(header);
        if seq != self.sequence_id {
            return Err(Error::Protocol(format!(
                "sequence id skew: expected {}, got {}",
                self.sequence_id, seq
            )));
        }
        self.sequence_id = seq.wrapping_add(1);
        let mut payload = BytesMut::zeroed(len);
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Reads one packet and classifies it as far as the bulk paths need.
    pub async fn receive_reply(&mut self) -> Result<ServerReply> {
        let payload = self.read_frame().await?;
        ServerReply::parse(payload, self.capabilities)
    }

    /// Sends a statement that is expected to produce a plain OK, such as
    /// `SET`, `BEGIN`, `ROLLBACK`, or a non-LOCAL `LOAD DATA`.
    pub async fn execute(&mut self, sql: &str) -> Result<OkPacket> {
        self.send_command(sql).await?;
        match self.receive_reply().await? {
            ServerReply::Ok(ok) => Ok(ok),
            ServerReply::Err(err) => Err(err.into_error()),
            ServerReply::LocalInfile(_) => Err(Error::Protocol(
                "server requested local data for a plain statement".to_string(),
            )),
            ServerReply::Raw(_) => Err(Error::Protocol(
                "statement unexpectedly produced a result set".to_string(),
            )),
        }
    }
}
