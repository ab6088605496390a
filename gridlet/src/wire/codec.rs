//! Framed codec for slot pipe communication.
//!
//! Wraps `LinesCodec` for framing and delegates token parsing to the
//! protocol module. Works over any AsyncRead/AsyncWrite (pipes in
//! production, duplex streams in tests).

use std::marker::PhantomData;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{InboundMessage, OutboundMessage, ProtocolError, WireLine};

/// Upper bound on one protocol line. Dispatches carrying large escaped
/// string literals stay well below this.
pub const MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Malformed line content. Fatal to the message, not the stream: the
    /// framed reader stays usable and the caller may keep reading.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("protocol line exceeds maximum length")]
    LineTooLong,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<LinesCodecError> for WireError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong,
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Codec that frames one protocol message per line.
///
/// `In` is the vocabulary decoded from the stream, `Out` the one encoded
/// onto it; the worker and master sides are mirror instantiations.
#[derive(Debug)]
pub struct LineCodec<In, Out> {
    inner: LinesCodec,
    _direction: PhantomData<fn() -> (In, Out)>,
}

/// Slot side: decodes dispatches, encodes completion reports.
pub type WorkerCodec = LineCodec<InboundMessage, OutboundMessage>;

/// Master side: encodes dispatches, decodes completion reports.
pub type MasterCodec = LineCodec<OutboundMessage, InboundMessage>;

impl<In, Out> LineCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            _direction: PhantomData,
        }
    }
}

impl<In, Out> Default for LineCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: WireLine, Out> Decoder for LineCodec<In, Out> {
    type Item = In;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(line) => Ok(Some(In::decode_line(&line)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src)? {
            Some(line) => Ok(Some(In::decode_line(&line)?)),
            None => Ok(None),
        }
    }
}

impl<In, Out: WireLine> Encoder<Out> for LineCodec<In, Out> {
    type Error = WireError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = item.encode_line();
        tracing::trace!(line_bytes = line.len(), "encoding wire line");
        self.inner.encode(line, dst)?;
        Ok(())
    }
}
