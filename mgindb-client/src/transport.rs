//! # Line Transports
//!
//! Purpose: Reduce every supported socket to an ordered duplex stream of
//! text lines, which is all the engine needs.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `Connector` opens a `Transport`; the engine never
//!    sees TCP or WebSocket specifics.
//! 2. **Sink/Stream Halves**: Writes and reads are independent so the reader
//!    task can run while callers write.
//! 3. **Uniform Errors**: Transport failures surface as `MginError::Transport`.
//!    A line that cannot be decoded is yielded as `MginError::Protocol` and
//!    the stream keeps going.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tracing::{debug, trace};

use mgindb_common::{MginError, MginResult};

use crate::config::{ClientConfig, TransportKind};

/// Outbound half: accepts one line per item (no trailing newline).
pub type LineSink = Pin<Box<dyn Sink<String, Error = MginError> + Send>>;

/// Inbound half: yields one line per item, ends when the peer closes.
///
/// `Err(MginError::Protocol)` items are recoverable; any other error ends the
/// stream.
pub type LineStream = Pin<Box<dyn Stream<Item = MginResult<String>> + Send>>;

/// An opened duplex line stream.
pub struct Transport {
    pub sink: LineSink,
    pub stream: LineStream,
}

impl Transport {
    pub fn new(sink: LineSink, stream: LineStream) -> Self {
        Transport { sink, stream }
    }
}

/// Opens a fresh transport to the configured endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> MginResult<Transport>;

    /// Endpoint description for logs.
    fn describe(&self) -> String;
}

/// Builds the connector selected by the URL scheme.
pub fn connector_for(config: &ClientConfig) -> MginResult<Box<dyn Connector>> {
    match config.transport_kind()? {
        TransportKind::Tcp => Ok(Box::new(TcpConnector {
            addr: config.socket_addr()?,
            max_line_length: config.max_line_length,
            connect_timeout: config.connect_timeout,
        })),
        TransportKind::WebSocket => Ok(Box::new(WebSocketConnector {
            url: config.url.clone(),
            connect_timeout: config.connect_timeout,
        })),
    }
}

/// Newline-delimited text over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub addr: String,
    pub max_line_length: usize,
    pub connect_timeout: Duration,
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> MginResult<Transport> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| MginError::Transport(format!("connect to {} timed out", self.addr)))?
            .map_err(|err| MginError::Transport(format!("connect to {}: {}", self.addr, err)))?;
        // Frames are tiny; disable Nagle to keep command latency low.
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "tcp transport opened");

        let framed = Framed::new(stream, LineCodec::new(self.max_line_length));
        let (sink, stream) = framed.split::<String>();
        let sink = sink.sink_map_err(|err| MginError::Transport(err.to_string()));
        let stream = stream.map(|item| match item {
            Ok(line) => line,
            Err(err) => Err(MginError::Transport(err.to_string())),
        });
        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Newline codec that hands a bad line to the reader as an item.
///
/// `Framed` ends the stream after a decoder error, but `LinesCodec` has already
/// consumed (or is discarding) the offending line, so an over-long or non-UTF-8
/// line is reported as `MginError::Protocol` instead. Only I/O failures remain
/// decoder errors.
#[derive(Debug)]
pub struct LineCodec {
    inner: LinesCodec,
}

impl LineCodec {
    pub fn new(max_line_length: usize) -> Self {
        LineCodec {
            inner: LinesCodec::new_with_max_length(max_line_length),
        }
    }

    fn recover(
        &self,
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<MginResult<String>>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(Ok)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(MginError::Protocol(
                format!("inbound line exceeds {} bytes", self.inner.max_length()),
            )))),
            Err(LinesCodecError::Io(err)) if err.kind() == io::ErrorKind::InvalidData => {
                Ok(Some(Err(MginError::Protocol(format!("undecodable line: {err}")))))
            }
            Err(err) => Err(err),
        }
    }
}

impl Decoder for LineCodec {
    type Item = MginResult<String>;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let decoded = self.inner.decode(src);
        self.recover(decoded)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let decoded = self.inner.decode_eof(src);
        self.recover(decoded)
    }
}

impl Encoder<String> for LineCodec {
    type Error = LinesCodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(line, dst)
    }
}

/// One text message per line over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    pub url: String,
    pub connect_timeout: Duration,
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> MginResult<Transport> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| MginError::Transport(format!("connect to {} timed out", self.url)))?
            .map_err(|err| MginError::Transport(format!("connect to {}: {}", self.url, err)))?;
        debug!(url = %self.url, "websocket transport opened");

        let (write, mut read) = ws.split();
        let sink = write
            .with(|line: String| async move {
                Ok::<_, tokio_tungstenite::tungstenite::Error>(Message::Text(line.into()))
            })
            .sink_map_err(|err| MginError::Transport(err.to_string()));

        let stream = async_stream::stream! {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => yield Ok(text.as_str().to_string()),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => yield Ok(text),
                        Err(_) => yield Err(MginError::Protocol("non-utf8 binary frame".into())),
                    },
                    Ok(Message::Close(frame)) => {
                        trace!(?frame, "websocket close frame received");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        yield Err(MginError::Transport(err.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
