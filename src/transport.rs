//! Frame transport
//!
//! The pumps never touch a socket directly. The read pump owns a
//! [`FrameSource`], the write pump owns the matching [`FrameSink`], and
//! nothing else ever holds either half.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

/// Transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload
    Text(String),
    /// Keep-alive ping
    Ping,
    /// Keep-alive response
    Pong,
    /// Close handshake
    Close,
}

/// Read half of a duplex stream
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame from the peer. `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Write half of a duplex stream
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame to the peer.
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError>;
}

/// Split an upgraded WebSocket into its two halves
pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsSource(stream))
}

/// Read half of an axum WebSocket
pub struct WsSource(SplitStream<WebSocket>);

/// Write half of an axum WebSocket
pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::Socket(e))),
        };

        let frame = match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Text(String::from_utf8_lossy(&data).into_owned()),
            Message::Ping(_) => Frame::Ping,
            Message::Pong(_) => Frame::Pong,
            Message::Close(_) => Frame::Close,
        };
        Some(Ok(frame))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping => Message::Ping(Bytes::new()),
            Frame::Pong => Message::Pong(Bytes::new()),
            Frame::Close => Message::Close(None),
        };
        self.0.send(message).await.map_err(TransportError::Socket)
    }
}

/// Transport failures. Each one is fatal to its own connection only.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no keep-alive response within {0:?}")]
    ReadTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("socket error: {0}")]
    Socket(#[source] axum::Error),
    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transport doubles

    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;

    tokio::task_local! {
        /// Name of the pump driving the current task, recorded with each write
        pub static WRITER: String;
    }

    /// Source fed from a channel; ends when the sender is dropped
    pub struct ChannelSource(pub mpsc::UnboundedReceiver<Result<Frame, TransportError>>);

    pub fn channel_source() -> (
        mpsc::UnboundedSender<Result<Frame, TransportError>>,
        ChannelSource,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ChannelSource(rx))
    }

    #[async_trait]
    impl FrameSource for ChannelSource {
        async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
            self.0.recv().await
        }
    }

    /// How a [`RecordingSink`] reacts to writes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SinkMode {
        Accept,
        Fail,
        Stall,
    }

    struct Write {
        at: Instant,
        writer: Option<String>,
        frame: Frame,
    }

    /// Sink that records every frame with the (tokio) time it was written
    /// and the [`WRITER`] of the task that wrote it
    #[derive(Clone)]
    pub struct RecordingSink {
        frames: Arc<Mutex<Vec<Write>>>,
        mode: Arc<Mutex<SinkMode>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                frames: Arc::new(Mutex::new(Vec::new())),
                mode: Arc::new(Mutex::new(SinkMode::Accept)),
            }
        }

        pub fn set_mode(&self, mode: SinkMode) {
            *self.mode.lock() = mode;
        }

        pub fn frames(&self) -> Vec<Frame> {
            self.frames.lock().iter().map(|w| w.frame.clone()).collect()
        }

        pub fn timed_frames(&self) -> Vec<(Instant, Frame)> {
            self.frames
                .lock()
                .iter()
                .map(|w| (w.at, w.frame.clone()))
                .collect()
        }

        /// Writer of each recorded frame, in write order
        pub fn writers(&self) -> Vec<Option<String>> {
            self.frames.lock().iter().map(|w| w.writer.clone()).collect()
        }

        pub fn texts(&self) -> Vec<String> {
            self.frames()
                .into_iter()
                .filter_map(|f| match f {
                    Frame::Text(text) => Some(text),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, frame: &Frame) -> usize {
            self.frames.lock().iter().filter(|w| &w.frame == frame).count()
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
            let mode = *self.mode.lock();
            match mode {
                SinkMode::Accept => {
                    let writer = WRITER.try_with(|name| name.clone()).ok();
                    self.frames.lock().push(Write {
                        at: Instant::now(),
                        writer,
                        frame,
                    });
                    Ok(())
                }
                SinkMode::Fail => Err(TransportError::Closed),
                SinkMode::Stall => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }
}
