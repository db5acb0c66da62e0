//! Types for working with the engine's multiplexed stdio streams
//!
//! The exec attach endpoint emits frames with an 8-byte header: one byte of
//! stream type (1 = stdout, 2 = stderr), three bytes of padding, and a
//! big-endian u32 payload length. Frame boundaries do not line up with HTTP
//! chunk boundaries, so decoding accumulates bytes and emits each frame as
//! soon as it is complete.

use std::{
    ops::Deref,
    pin::Pin,
    task::{Context, Poll},
};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, Stream, StreamExt};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::errors::{Error, Result};

const HEADER_SIZE: usize = 8;

const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

/// One frame of output from an exec instance
#[derive(Debug, Clone)]
pub enum TtyChunk {
    StdOut(Vec<u8>),
    StdErr(Vec<u8>),
}

impl TtyChunk {
    pub fn is_stdout(&self) -> bool {
        match self {
            TtyChunk::StdOut(_) => true,
            TtyChunk::StdErr(_) => false,
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        match self {
            TtyChunk::StdOut(bytes) | TtyChunk::StdErr(bytes) => bytes,
        }
    }
}

impl Deref for TtyChunk {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        match self {
            TtyChunk::StdOut(bytes) | TtyChunk::StdErr(bytes) => bytes,
        }
    }
}

enum Parsed {
    Frame(TtyChunk),
    /// A complete frame that carries nothing for the caller: zero-length
    /// payloads, stdin echoes, and unknown stream types
    Skip,
    Incomplete,
}

fn parse_frame(buf: &mut BytesMut) -> Parsed {
    if buf.len() < HEADER_SIZE {
        return Parsed::Incomplete;
    }
    let length = BigEndian::read_u32(&buf[4..8]) as usize;
    if buf.len() < HEADER_SIZE + length {
        return Parsed::Incomplete;
    }
    let header = buf.split_to(HEADER_SIZE);
    let payload = buf.split_to(length);
    if length == 0 {
        return Parsed::Skip;
    }
    match header[0] {
        STREAM_STDOUT => Parsed::Frame(TtyChunk::StdOut(payload.to_vec())),
        STREAM_STDERR => Parsed::Frame(TtyChunk::StdErr(payload.to_vec())),
        _ => Parsed::Skip,
    }
}

struct Decoder<S> {
    inner: S,
    buf: BytesMut,
    eof: bool,
}

/// Decode a stream of response bytes into [`TtyChunk`] frames.
///
/// The input chunking is arbitrary: headers and payloads may be split
/// across chunk boundaries and reassemble identically.
pub(crate) fn decode<S>(stream: S) -> impl Stream<Item = Result<TtyChunk>> + Send
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    let decoder = Decoder {
        inner: stream,
        buf: BytesMut::new(),
        eof: false,
    };
    stream::unfold(decoder, |mut decoder| async move {
        loop {
            match parse_frame(&mut decoder.buf) {
                Parsed::Frame(chunk) => return Some((Ok(chunk), decoder)),
                Parsed::Skip => continue,
                Parsed::Incomplete => {}
            }
            if decoder.eof {
                // a trailing partial frame is dropped, same as EOF mid-read
                return None;
            }
            match decoder.inner.next().await {
                Some(Ok(bytes)) => decoder.buf.extend_from_slice(&bytes),
                Some(Err(e)) => return Some((Err(e), decoder)),
                None => decoder.eof = true,
            }
        }
    })
}

/// Adapt an `AsyncRead` (an upgraded connection) into a byte-chunk stream
/// suitable for [`decode`]
pub(crate) fn io_chunks<R>(reader: R) -> impl Stream<Item = Result<Bytes>> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(reader, |mut reader| async move {
        let mut buf = [0u8; 8192];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => Some((Ok(Bytes::copy_from_slice(&buf[..n])), reader)),
            Err(e) => Some((Err(Error::IO(e)), reader)),
        }
    })
}

/// Boxed stream of decoded frames from an exec attach
pub type TtyReader = Pin<Box<dyn Stream<Item = Result<TtyChunk>> + Send>>;
/// Boxed writer to an attached exec's stdin
pub type TtyWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Frame multiplexer over an upgraded exec connection.
///
/// Emits a stream of [`TtyChunk`]s and implements [`AsyncWrite`] for
/// sending bytes to the process's stdin. `split` separates the halves.
#[pin_project]
pub struct Multiplexer {
    #[pin]
    reader: TtyReader,
    #[pin]
    writer: TtyWriter,
}

impl Multiplexer {
    pub(crate) fn new<T>(io: T) -> Multiplexer
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        Multiplexer {
            reader: Box::pin(decode(Box::pin(io_chunks(read_half)))),
            writer: Box::pin(write_half),
        }
    }

    /// Split into the component `Stream` and `AsyncWrite` parts
    pub(crate) fn split(self) -> (TtyReader, TtyWriter) {
        (self.reader, self.writer)
    }
}

impl Stream for Multiplexer {
    type Item = Result<TtyChunk>;
    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.project().reader.poll_next(cx)
    }
}

impl AsyncWrite for Multiplexer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.project().writer.poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::iter;

    fn frame(
        stream_type: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut f = vec![stream_type, 0, 0, 0, 0, 0, 0, 0];
        BigEndian::write_u32(&mut f[4..8], payload.len() as u32);
        f.extend_from_slice(payload);
        f
    }

    async fn decode_partitioned(
        wire: &[u8],
        chunk_size: usize,
    ) -> Vec<TtyChunk> {
        let chunks: Vec<crate::Result<Bytes>> = wire
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        decode(Box::pin(iter(chunks)))
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn decodes_interleaved_frames() {
        let mut wire = frame(1, b"out\n");
        wire.extend(frame(2, b"err\n"));
        wire.extend(frame(1, b"more"));

        let frames = decode_partitioned(&wire, wire.len()).await;
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_stdout());
        assert_eq!(&*frames[0], b"out\n");
        assert!(!frames[1].is_stdout());
        assert_eq!(&*frames[1], b"err\n");
        assert_eq!(&*frames[2], b"more");
    }

    #[tokio::test]
    async fn chunk_partitioning_does_not_change_output() {
        let mut wire = frame(1, b"hello world");
        wire.extend(frame(2, b"diagnostics"));
        wire.extend(frame(1, &vec![0xAA; 300]));

        let reference = decode_partitioned(&wire, wire.len()).await;
        for chunk_size in &[1, 2, 3, 7, 8, 9, 64] {
            let partitioned = decode_partitioned(&wire, *chunk_size).await;
            assert_eq!(partitioned.len(), reference.len());
            for (a, b) in partitioned.iter().zip(reference.iter()) {
                assert_eq!(a.is_stdout(), b.is_stdout());
                assert_eq!(&**a, &**b);
            }
        }
    }

    #[tokio::test]
    async fn header_split_across_chunks_still_delivers_frame() {
        let wire = frame(2, b"split header");
        // split inside the 8-byte header
        let chunks: Vec<crate::Result<Bytes>> = vec![
            Ok(Bytes::copy_from_slice(&wire[..3])),
            Ok(Bytes::copy_from_slice(&wire[3..])),
        ];
        let frames: Vec<TtyChunk> = decode(Box::pin(iter(chunks)))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert_eq!(&*frames[0], b"split header");
    }

    #[tokio::test]
    async fn zero_length_frames_are_consumed_but_not_delivered() {
        let mut wire = frame(1, b"");
        wire.extend(frame(1, b"data"));
        let frames = decode_partitioned(&wire, wire.len()).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(&*frames[0], b"data");
    }

    #[tokio::test]
    async fn unknown_stream_types_are_discarded() {
        let mut wire = frame(0, b"stdin echo");
        wire.extend(frame(7, b"mystery"));
        wire.extend(frame(2, b"kept"));
        let frames = decode_partitioned(&wire, 5).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(&*frames[0], b"kept");
    }

    #[tokio::test]
    async fn trailing_partial_frame_is_dropped() {
        let mut wire = frame(1, b"whole");
        wire.extend(&frame(1, b"partial")[..9]);
        let frames = decode_partitioned(&wire, 4).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(&*frames[0], b"whole");
    }
}
