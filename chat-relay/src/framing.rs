use std::io;

use clap::ValueEnum;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Largest payload a single raw read hands back; longer sends arrive split.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Longest line, excluding its terminator, accepted in line framing.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// How payloads are cut out of the byte stream and how outbound lines are terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Framing {
    /// Every successful read is one message and outbound lines carry no terminator.
    ///
    /// Compatible with clients that expect the bare protocol. Messages larger than
    /// [`READ_CHUNK_SIZE`] are split and back-to-back sends may be coalesced.
    #[default]
    Raw,
    /// Messages are newline-terminated in both directions.
    ///
    /// A line longer than [`MAX_LINE_LEN`] is rejected with
    /// [`io::ErrorKind::InvalidData`], which ends the sender's session.
    Line,
}

impl Framing {
    /// Encodes one outbound line for the wire.
    pub fn encode(self, line: &str) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(line.len() + 1);
        encoded.extend_from_slice(line.as_bytes());
        if self == Framing::Line {
            encoded.push(b'\n');
        }
        encoded
    }

    pub fn reader<R>(self, inner: R) -> PayloadReader<R>
    where
        R: AsyncRead + Unpin,
    {
        PayloadReader {
            inner: BufReader::with_capacity(READ_CHUNK_SIZE, inner),
            framing: self,
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
        }
    }
}

/// Reads inbound payloads according to a [`Framing`] policy.
pub struct PayloadReader<R> {
    inner: BufReader<R>,
    framing: Framing,
    buffer: Vec<u8>,
}

impl<R> PayloadReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Returns the next payload, or `None` once the peer has closed the stream.
    ///
    /// Invalid UTF-8 is replaced rather than treated as a read failure.
    pub async fn next_payload(&mut self) -> io::Result<Option<String>> {
        match self.framing {
            Framing::Raw => self.next_chunk().await,
            Framing::Line => self.next_line().await,
        }
    }

    async fn next_chunk(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let bytes = self.inner.read(&mut chunk).await?;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&chunk[..bytes]).into_owned()))
    }

    // Partial lines stay in `buffer` if the future is dropped mid-read, which
    // keeps this safe to use as a `select!` branch.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            // Room for a full line plus a CRLF terminator, and no more.
            let budget = (MAX_LINE_LEN + 2).saturating_sub(self.buffer.len()) as u64;
            let bytes = (&mut self.inner)
                .take(budget)
                .read_until(b'\n', &mut self.buffer)
                .await?;
            if bytes == 0 && self.buffer.is_empty() {
                return Ok(None);
            }

            let content = self
                .buffer
                .iter()
                .rposition(|byte| !matches!(byte, b'\n' | b'\r'))
                .map_or(0, |last| last + 1);
            if content > MAX_LINE_LEN {
                self.buffer.clear();
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {MAX_LINE_LEN} bytes"),
                ));
            }

            let line = String::from_utf8_lossy(&self.buffer[..content]).into_owned();
            self.buffer.clear();
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }
}
