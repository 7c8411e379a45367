//! Client transport over an upgraded axum WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, trace};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use super::transport::{ServerFrame, Transport, TransportError};

struct ReadHalf {
    stream: SplitStream<WebSocket>,
    /// Refreshed on every pong.
    deadline: Instant,
}

pub struct SocketTransport {
    sink: Mutex<SplitSink<WebSocket, WsMessage>>,
    reader: Mutex<ReadHalf>,
    closed: watch::Sender<bool>,
    pong_wait: Duration,
    write_wait: Duration,
}

impl SocketTransport {
    pub fn new(socket: WebSocket, pong_wait: Duration, write_wait: Duration) -> Self {
        let (sink, stream) = socket.split();
        let (closed, _) = watch::channel(false);
        Self {
            sink: Mutex::new(sink),
            reader: Mutex::new(ReadHalf {
                stream,
                deadline: Instant::now() + pong_wait,
            }),
            closed,
            pong_wait,
            write_wait,
        }
    }

    fn mark_closed(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }
}

#[async_trait]
impl Transport for SocketTransport {
    type Inbound = String;
    type Outbound = ServerFrame;

    async fn send(&self, frame: ServerFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let message = match frame {
            ServerFrame::Text(text) => WsMessage::Text(text.into()),
            ServerFrame::Ping => WsMessage::Ping(Bytes::new()),
        };
        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;

        loop {
            let deadline = reader.deadline;
            let next = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
                next = tokio::time::timeout_at(deadline, reader.stream.next()) => next,
            };

            let message = match next {
                Err(_) => return Err(TransportError::Timeout),
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(Err(e))) => return Err(TransportError::Io(e.to_string())),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                WsMessage::Text(text) => return Ok(text.as_str().to_owned()),
                // Chat frames are text only.
                WsMessage::Binary(data) => {
                    debug!("ignoring {} byte binary frame", data.len());
                }
                WsMessage::Pong(_) => {
                    trace!("pong received, extending read deadline");
                    reader.deadline = Instant::now() + self.pong_wait;
                }
                // Answered by the protocol layer on the next write.
                WsMessage::Ping(_) => {}
                WsMessage::Close(frame) => {
                    debug!("client sent close frame: {:?}", frame);
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(WsMessage::Close(None)).await {
                debug!("close frame not delivered: {}", e);
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(self.write_wait, shutdown).await.is_err() {
            debug!("socket close timed out after {:?}", self.write_wait);
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
