//! Byte-stream transport: abstracts the engine away from
//! *how* bytes reach firmware, following the pattern of framing an
//! `AsyncRead + AsyncWrite` stream with a `tokio_util` codec, behind
//! `async_trait`s so tests can substitute an in-memory duplex instead of a
//! real serial port.
//!
//! Sending and receiving are split into separate traits deliberately: the
//! receiving task's `read_line` can sit blocked awaiting the next line from
//! firmware for an arbitrarily long time, and a single combined trait object
//! guarded by one lock would stall every write behind that read. Splitting a
//! `Framed<_, LinesCodec>` into its sink and stream halves gives the sending
//! and receiving tasks independent access to the same underlying stream.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// The write half of a connected, line-oriented channel to firmware.
/// `write_line` writes a single already-framed wire line; the caller has
/// already attached the line number and checksum where required.
#[async_trait]
pub trait TransportWriter: Send {
    async fn write_line(&mut self, line: Bytes) -> io::Result<()>;
}

/// The read half of a connected, line-oriented channel to firmware.
/// `read_line` yields one line with its trailing newline stripped, or `None`
/// on clean EOF.
#[async_trait]
pub trait TransportReader: Send {
    async fn read_line(&mut self) -> io::Result<Option<String>>;
}

fn codec_err(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line exceeded maximum length")
        },
        LinesCodecError::Io(e) => e,
    }
}

/// [`TransportWriter`] over the sink half of a framed stream.
pub struct FramedWriter<T> {
    sink: SplitSink<Framed<T, LinesCodec>, String>,
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportWriter for FramedWriter<T> {
    async fn write_line(&mut self, line: Bytes) -> io::Result<()> {
        let text = String::from_utf8_lossy(&line).into_owned();
        self.sink.send(text).await.map_err(codec_err)
    }
}

/// [`TransportReader`] over the stream half of a framed stream.
pub struct FramedReader<T> {
    stream: SplitStream<Framed<T, LinesCodec>>,
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportReader for FramedReader<T> {
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.stream.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(codec_err(e)),
            None => Ok(None),
        }
    }
}

/// A connected transport, already split into independent writer and reader
/// halves so the sending and receiving tasks can each own one without
/// contending for a shared lock.
///
/// `message_integrity` records whether this channel is expected to corrupt
/// or drop bytes in transit (a real serial link) as opposed to a reliable
/// substitute like a loopback pipe in tests; the resend machinery only
/// matters when it's `true`.
pub struct TransportHandle {
    pub writer: Box<dyn TransportWriter>,
    pub reader: Box<dyn TransportReader>,
    pub message_integrity: bool,
}

/// Frames `stream` line by line and splits it into independent writer and
/// reader halves.
pub fn line_transport<T>(stream: T, message_integrity: bool) -> TransportHandle
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, LinesCodec::new());
    let (sink, stream) = framed.split();
    TransportHandle {
        writer: Box::new(FramedWriter { sink }),
        reader: Box::new(FramedReader { stream }),
        message_integrity,
    }
}

/// Opens a serial port and returns it as a [`TransportHandle`] via
/// `tokio_serial::SerialPortBuilderExt::open_native_async`. A real serial
/// link is not guaranteed byte-perfect, so `message_integrity` is `false`.
pub fn open_serial(path: &str, baud_rate: u32) -> io::Result<TransportHandle> {
    use tokio_serial::SerialPortBuilderExt;
    let port = tokio_serial::new(path, baud_rate).open_native_async()?;
    Ok(line_transport(port, false))
}
