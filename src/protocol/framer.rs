//! Chunks an arbitrary byte stream into framed packets for the LOCAL INFILE
//! data phase.

use crate::error::Result;
use crate::protocol::packet::MAX_PAYLOAD;
use crate::session::Session;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};

/// The largest payload one data packet may carry on this session.
pub(crate) fn effective_chunk(max_allowed_packet: usize) -> usize {
    MAX_PAYLOAD.min(max_allowed_packet)
}

/// Accumulates outgoing bytes and flushes them as maximum-size packets.
///
/// The data phase always ends with a zero-length trailer packet: it is what
/// tells the server the transfer is over, and after a payload that is an
/// exact multiple of the chunk size it is the only zero-length frame.
pub(crate) struct PacketFramer<'a, S> {
    session: &'a mut Session<S>,
    buf: BytesMut,
    chunk: usize,
    frames: u64,
    data_bytes: u64,
}

impl<'a, S> PacketFramer<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(session: &'a mut Session<S>) -> Self {
        let chunk = effective_chunk(session.max_allowed_packet());
        Self {
            session,
            buf: BytesMut::with_capacity(chunk.min(1 << 20)),
            chunk,
            frames: 0,
            data_bytes: 0,
        }
    }

    /// Appends bytes, flushing a full frame every time the buffer reaches
    /// the chunk size.
    pub(crate) async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while self.buf.len() + data.len() >= self.chunk {
            let take = self.chunk - self.buf.len();
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.flush_buffer().await?;
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Flushes any partial frame and terminates the transfer with the empty
    /// trailer packet.
    pub(crate) async fn finish(mut self) -> Result<(u64, u64)> {
        if !self.buf.is_empty() {
            self.flush_buffer().await?;
        }
        self.session.write_frame(&[]).await?;
        Ok((self.frames + 1, self.data_bytes))
    }

    /// Drops buffered bytes and sends only the trailer, so the server leaves
    /// the LOCAL INFILE state before a client-side error is surfaced.
    pub(crate) async fn abort(mut self) -> Result<()> {
        self.buf.clear();
        self.session.write_frame(&[]).await?;
        Ok(())
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        self.session.write_frame(&self.buf).await?;
        self.frames += 1;
        self.data_bytes += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{self, Capabilities, CLIENT_PROTOCOL_41};
    use tokio::io::AsyncReadExt;

    async fn frame_lengths(total: usize, chunk: usize) -> Vec<usize> {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut session = Session::from_parts(client, Capabilities(CLIENT_PROTOCOL_41), chunk);

        let mut framer = PacketFramer::new(&mut session);
        assert_eq!(framer.chunk, chunk);
        let data = vec![0xabu8; total];
        // feed in uneven slices to exercise buffering across calls
        for piece in data.chunks(3) {
            framer.write(piece).await.unwrap();
        }
        framer.finish().await.unwrap();
        drop(session);

        let mut lengths = Vec::new();
        loop {
            let mut header = [0u8; 4];
            if server.read_exact(&mut header).await.is_err() {
                break;
            }
            let (len, _) = packet::read_packet_header(header);
            let mut payload = vec![0u8; len];
            server.read_exact(&mut payload).await.unwrap();
            lengths.push(len);
            if len == 0 {
                break;
            }
        }
        lengths
    }

    #[tokio::test]
    async fn test_empty_source_sends_only_the_trailer() {
        assert_eq!(frame_lengths(0, 8).await, vec![0]);
    }

    #[tokio::test]
    async fn test_partial_frame_then_trailer() {
        assert_eq!(frame_lengths(5, 8).await, vec![5, 0]);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_zero_length_frame() {
        assert_eq!(frame_lengths(16, 8).await, vec![8, 8, 0]);
    }

    #[tokio::test]
    async fn test_remainder_after_full_frames() {
        assert_eq!(frame_lengths(17, 8).await, vec![8, 8, 1, 0]);
    }
}
