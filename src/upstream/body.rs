//! Body framing for the upstream HTTP/1.1 leg.

use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::Rewind;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    /// No body at all.
    None,
    /// Exactly this many bytes.
    Length(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Delimited by connection close (responses only).
    Unbounded,
}

/// Reads a framed body off an upstream connection, yielding deframed chunks.
pub(crate) struct BodyReader<R> {
    rd: Rewind<R>,
    state: ReadState,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Fixed { remaining: u64 },
    Chunked(ChunkPhase),
    Unbounded,
    Done,
}

#[derive(Debug, Clone, Copy)]
enum ChunkPhase {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
}

impl<R: AsyncRead + Unpin> BodyReader<R> {
    pub(crate) fn new(rd: Rewind<R>, framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::None | BodyFraming::Length(0) => ReadState::Done,
            BodyFraming::Length(n) => ReadState::Fixed { remaining: n },
            BodyFraming::Chunked => ReadState::Chunked(ChunkPhase::Size),
            BodyFraming::Unbounded => ReadState::Unbounded,
        };
        Self { rd, state }
    }

    /// Next deframed chunk, or `None` at the end of the body.
    ///
    /// Cancel-safe: partial progress lives in the read buffer.
    pub(crate) async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.state {
                ReadState::Done => return Ok(None),
                ReadState::Unbounded => {
                    if self.rd.buffer().is_empty() && self.fill().await? == 0 {
                        self.state = ReadState::Done;
                        return Ok(None);
                    }
                    return Ok(Some(self.rd.take_buffered(usize::MAX)));
                }
                ReadState::Fixed { remaining } => {
                    if self.rd.buffer().is_empty() && self.fill().await? == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    let take = remaining.min(self.rd.buffer().len() as u64) as usize;
                    let chunk = self.rd.take_buffered(take);
                    let remaining = remaining - chunk.len() as u64;
                    self.state = if remaining == 0 {
                        ReadState::Done
                    } else {
                        ReadState::Fixed { remaining }
                    };
                    return Ok(Some(chunk));
                }
                ReadState::Chunked(phase) => {
                    if let Some(chunk) = self.step_chunked(phase).await? {
                        return Ok(Some(chunk));
                    }
                    if matches!(self.state, ReadState::Done) {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Advances the chunked-coding state machine by one phase.
    async fn step_chunked(&mut self, phase: ChunkPhase) -> io::Result<Option<Bytes>> {
        match phase {
            ChunkPhase::Size => {
                let line = self.read_line().await?;
                let size = parse_chunk_size(&line)?;
                self.state = ReadState::Chunked(if size == 0 {
                    ChunkPhase::Trailers
                } else {
                    ChunkPhase::Data { remaining: size }
                });
                Ok(None)
            }
            ChunkPhase::Data { remaining } => {
                if self.rd.buffer().is_empty() && self.fill().await? == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                let take = remaining.min(self.rd.buffer().len() as u64) as usize;
                let chunk = self.rd.take_buffered(take);
                let remaining = remaining - chunk.len() as u64;
                self.state = ReadState::Chunked(if remaining == 0 {
                    ChunkPhase::DataEnd
                } else {
                    ChunkPhase::Data { remaining }
                });
                Ok(Some(chunk))
            }
            ChunkPhase::DataEnd => {
                while self.rd.buffer().len() < 2 {
                    if self.fill().await? == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                }
                if &self.rd.buffer()[..2] != b"\r\n" {
                    return Err(invalid_data("missing chunk terminator"));
                }
                self.rd.discard(2);
                self.state = ReadState::Chunked(ChunkPhase::Size);
                Ok(None)
            }
            ChunkPhase::Trailers => {
                // Trailer fields are connection-scoped and dropped.
                let line = self.read_line().await?;
                if line.is_empty() {
                    self.state = ReadState::Done;
                }
                Ok(None)
            }
        }
    }

    /// Reads a CRLF-terminated line, returned without the terminator.
    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = find_crlf(self.rd.buffer()) {
                let line = self.rd.buffer()[..pos].to_vec();
                self.rd.discard(pos + 2);
                return Ok(line);
            }
            if self.rd.is_full() {
                return Err(invalid_data("chunk metadata line exceeds buffer limit"));
            }
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        self.rd.buffer_more().await
    }
}

/// Writes one chunk in chunked transfer coding.
pub(crate) async fn write_chunk<W: AsyncWrite + Unpin>(wr: &mut W, data: &[u8]) -> io::Result<()> {
    wr.write_all(format!("{:X}\r\n", data.len()).as_bytes())
        .await?;
    wr.write_all(data).await?;
    wr.write_all(b"\r\n").await
}

/// Terminates a chunked body.
pub(crate) async fn finish_chunked<W: AsyncWrite + Unpin>(wr: &mut W) -> io::Result<()> {
    wr.write_all(b"0\r\n\r\n").await
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line =
        std::str::from_utf8(line).map_err(|_| invalid_data("chunk size line is not ASCII"))?;
    // Chunk extensions after ';' are ignored.
    let size = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid_data("invalid chunk size"))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn invalid_data(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}
