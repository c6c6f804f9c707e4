//! The message-bus boundary.
//!
//! The engine neither frames bytes nor reconnects sockets; it consumes
//! [`Event`]s from an [`Input`] and hands finished records to an [`Output`].
//! The framed implementations speak a small length-prefixed protocol over any
//! byte stream: each frame is a little-endian `u32` length, a one-byte tag,
//! and the payload. A schema frame carries the textual `type name` list and
//! forces a rebind; a record frame carries one serialised record; a record
//! frame of one byte or less, like an explicit end-of-stream frame, marks the
//! end of the stream.
//!
//! Receive timeouts are configured on the underlying stream by whoever built
//! it; they surface here as [`Event::Idle`], and the engine's loop simply
//! comes back around without touching state.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use thiserror::Error;

use crate::record::{Schema, SchemaError};

/// Frame tag: a schema announcement.
pub const FRAME_SCHEMA: u8 = 0;
/// Frame tag: one serialised record.
pub const FRAME_RECORD: u8 = 1;
/// Frame tag: end of stream.
pub const FRAME_EOF: u8 = 2;

/// Largest frame the reader will accept: a maximal record plus its tag.
const MAX_FRAME: usize = crate::record::MAX_RECORD + 1;

/// Errors on the receive side.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying stream failed.
    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the stream.
    #[error("peer closed the stream")]
    Closed,
    /// A frame violated the protocol.
    #[error("malformed frame: {0}")]
    BadFrame(String),
    /// A schema announcement did not parse.
    #[error("malformed schema announcement: {0}")]
    Schema(#[from] SchemaError),
}

/// Errors on the send side.
#[derive(Debug, Error)]
pub enum SendError {
    /// The sink is backpressured or timed out; worth retrying.
    #[error("transient send failure")]
    Transient,
    /// The sink is gone.
    #[error("send failed: {0}")]
    Fatal(io::Error),
}

/// One receive-side occurrence.
#[derive(Debug)]
pub enum Event {
    /// The input schema changed; the engine must rebind before the next
    /// record.
    Schema(Schema),
    /// One record arrived; its bytes are in the caller's buffer.
    Record,
    /// The stream announced its end.
    Eof,
    /// The receive timeout elapsed with nothing to read.
    Idle,
}

/// The receive half of the bus.
pub trait Input {
    /// Waits (boundedly) for the next event. Record payloads land in
    /// `record`, which is reused across calls.
    fn recv(&mut self, record: &mut Vec<u8>) -> Result<Event, TransportError>;
}

/// The send half of the bus.
pub trait Output {
    /// Announces the output schema; sent before any record and after every
    /// rebind.
    fn announce(&mut self, schema: &Schema) -> Result<(), SendError>;
    /// Sends one serialised record.
    fn send(&mut self, record: &[u8]) -> Result<(), SendError>;
    /// Pushes buffered records towards the sink.
    fn flush(&mut self) -> Result<(), SendError>;
    /// Announces the end of the stream.
    fn eof(&mut self) -> Result<(), SendError>;
}

/// Frame reader over any byte stream.
#[derive(Debug)]
pub struct FramedInput<R> {
    reader: R,
}

impl<R: Read> FramedInput<R> {
    /// Wraps a stream whose read timeout, if any, is already configured.
    pub fn new(reader: R) -> FramedInput<R> {
        FramedInput { reader }
    }

    fn read_header(&mut self) -> Result<Option<usize>, TransportError> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header) {
            Ok(()) => Ok(Some(u32::from_le_bytes(header) as usize)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(TransportError::Io(err)),
        }
    }
}

impl<R: Read> Input for FramedInput<R> {
    fn recv(&mut self, record: &mut Vec<u8>) -> Result<Event, TransportError> {
        let Some(len) = self.read_header()? else {
            return Ok(Event::Idle);
        };
        if len == 0 || len > MAX_FRAME {
            return Err(TransportError::BadFrame(format!("length {}", len)));
        }

        let mut tag = [0u8; 1];
        self.reader.read_exact(&mut tag)?;
        record.clear();
        record.resize(len - 1, 0);
        self.reader.read_exact(record)?;

        match tag[0] {
            FRAME_SCHEMA => {
                let text = std::str::from_utf8(record)
                    .map_err(|_| TransportError::BadFrame("schema is not utf-8".to_string()))?;
                Ok(Event::Schema(Schema::parse(text)?))
            }
            FRAME_RECORD if record.len() <= 1 => Ok(Event::Eof),
            FRAME_RECORD => Ok(Event::Record),
            FRAME_EOF => Ok(Event::Eof),
            tag => Err(TransportError::BadFrame(format!("tag {}", tag))),
        }
    }
}

/// Frame writer over any byte stream.
#[derive(Debug)]
pub struct FramedOutput<W> {
    writer: W,
}

impl<W: Write> FramedOutput<W> {
    /// Wraps a stream whose write timeout, if any, is already configured.
    pub fn new(writer: W) -> FramedOutput<W> {
        FramedOutput { writer }
    }

    fn frame(&mut self, tag: u8, payload: &[u8]) -> Result<(), SendError> {
        let len = (payload.len() + 1) as u32;
        let write = |writer: &mut W| {
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&[tag])?;
            writer.write_all(payload)
        };
        write(&mut self.writer).map_err(classify)
    }
}

fn classify(err: io::Error) -> SendError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            SendError::Transient
        }
        _ => SendError::Fatal(err),
    }
}

impl<W: Write> Output for FramedOutput<W> {
    fn announce(&mut self, schema: &Schema) -> Result<(), SendError> {
        self.frame(FRAME_SCHEMA, schema.to_string().as_bytes())
    }

    fn send(&mut self, record: &[u8]) -> Result<(), SendError> {
        self.frame(FRAME_RECORD, record)
    }

    fn flush(&mut self) -> Result<(), SendError> {
        self.writer.flush().map_err(classify)
    }

    fn eof(&mut self) -> Result<(), SendError> {
        self.frame(FRAME_EOF, &[])
    }
}

#[derive(Debug)]
enum Frame {
    Schema(Schema),
    Record(Vec<u8>),
    Eof,
}

/// An in-process, single-threaded channel: the send half implements
/// [`Output`], the receive half [`Input`]. Used by tests and demos to wire an
/// engine to itself or to a capture buffer without sockets.
pub fn channel() -> (ChannelSender, ChannelReceiver) {
    let queue = Rc::new(RefCell::new(VecDeque::new()));
    (ChannelSender { queue: Rc::clone(&queue) }, ChannelReceiver { queue })
}

/// Send half of [`channel`].
#[derive(Debug, Clone)]
pub struct ChannelSender {
    queue: Rc<RefCell<VecDeque<Frame>>>,
}

impl Output for ChannelSender {
    fn announce(&mut self, schema: &Schema) -> Result<(), SendError> {
        self.queue.borrow_mut().push_back(Frame::Schema(schema.clone()));
        Ok(())
    }

    fn send(&mut self, record: &[u8]) -> Result<(), SendError> {
        self.queue.borrow_mut().push_back(Frame::Record(record.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SendError> {
        Ok(())
    }

    fn eof(&mut self) -> Result<(), SendError> {
        self.queue.borrow_mut().push_back(Frame::Eof);
        Ok(())
    }
}

/// Receive half of [`channel`].
#[derive(Debug)]
pub struct ChannelReceiver {
    queue: Rc<RefCell<VecDeque<Frame>>>,
}

impl ChannelReceiver {
    /// Number of frames waiting.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl Input for ChannelReceiver {
    fn recv(&mut self, record: &mut Vec<u8>) -> Result<Event, TransportError> {
        match self.queue.borrow_mut().pop_front() {
            Some(Frame::Schema(schema)) => Ok(Event::Schema(schema)),
            Some(Frame::Record(bytes)) => {
                record.clear();
                record.extend_from_slice(&bytes);
                Ok(Event::Record)
            }
            Some(Frame::Eof) => Ok(Event::Eof),
            None => Ok(Event::Idle),
        }
    }
}
