//! gRPC adapter for the chat service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_protocol::grpc::{
    CHAT_ID_METADATA_KEY, CHAT_MESSAGE_PATH, ChatMessage, PREPARE_CHAT_STREAM_PATH,
    PrepareChatStreamRequest, PrepareChatStreamResponse, SUBJECT_METADATA_KEY,
};
use chatrelay_protocol::{Message, NewMessage};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status, Streaming};
use tonic_prost::ProstCodec;

use super::{BackendError, ChatBackend};
use crate::ws::{BackendTransport, Transport, TransportError};

/// Messages buffered towards the chat service per stream.
const OUTBOUND_BUFFER_SIZE: usize = 32;

#[derive(Clone)]
pub struct GrpcChatBackend {
    channel: Channel,
}

impl GrpcChatBackend {
    /// Build a backend whose channel connects on first use.
    pub fn connect_lazy(endpoint: &str, connect_timeout: Duration) -> Result<Self, BackendError> {
        let endpoint = Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| BackendError::Unavailable(format!("invalid endpoint {endpoint}: {e}")))?
            .connect_timeout(connect_timeout);
        info!("chat backend at {}", endpoint.uri());
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    async fn client(&self) -> Result<tonic::client::Grpc<Channel>, BackendError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| BackendError::Unavailable(format!("service was not ready: {e}")))?;
        Ok(grpc)
    }
}

fn with_metadata<T>(
    mut request: Request<T>,
    pairs: &[(&'static str, &str)],
) -> Result<Request<T>, BackendError> {
    for (key, value) in pairs {
        let value = MetadataValue::try_from(*value)
            .map_err(|_| BackendError::Rpc(format!("{key} is not valid metadata")))?;
        request.metadata_mut().insert(*key, value);
    }
    Ok(request)
}

/// Map a status to the relay's error kinds.
pub(crate) fn status_to_error(status: Status) -> BackendError {
    let message = status.message().to_string();
    match status.code() {
        Code::NotFound => BackendError::ChatNotFound(message),
        Code::FailedPrecondition => BackendError::StreamNotPrepared(message),
        Code::Unavailable | Code::DeadlineExceeded => BackendError::Unavailable(message),
        code => BackendError::Rpc(format!("{code:?}: {message}")),
    }
}

#[async_trait]
impl ChatBackend for GrpcChatBackend {
    async fn prepare_stream(&self, username: &str, chat_id: &str) -> Result<(), BackendError> {
        let mut grpc = self.client().await?;
        let request = with_metadata(
            Request::new(PrepareChatStreamRequest {
                chat_id: chat_id.to_string(),
            }),
            &[(SUBJECT_METADATA_KEY, username)],
        )?;
        let codec: ProstCodec<PrepareChatStreamRequest, PrepareChatStreamResponse> =
            ProstCodec::default();
        grpc.unary(
            request,
            PathAndQuery::from_static(PREPARE_CHAT_STREAM_PATH),
            codec,
        )
        .await
        .map_err(status_to_error)?;
        debug!("prepared chat stream {} for {}", chat_id, username);
        Ok(())
    }

    async fn open_stream(
        &self,
        username: &str,
        chat_id: &str,
    ) -> Result<Arc<BackendTransport>, BackendError> {
        let mut grpc = self.client().await?;
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let request = with_metadata(
            Request::new(ReceiverStream::new(rx)),
            &[
                (SUBJECT_METADATA_KEY, username),
                (CHAT_ID_METADATA_KEY, chat_id),
            ],
        )?;
        let codec: ProstCodec<ChatMessage, ChatMessage> = ProstCodec::default();
        let response = grpc
            .streaming(request, PathAndQuery::from_static(CHAT_MESSAGE_PATH), codec)
            .await
            .map_err(status_to_error)?;
        info!("opened chat stream {} for {}", chat_id, username);

        let stream: Arc<BackendTransport> =
            Arc::new(GrpcStream::new(chat_id, tx, response.into_inner()));
        Ok(stream)
    }
}

struct GrpcStream {
    chat_id: String,
    /// Dropping the sender half-closes the call.
    outbound: Mutex<Option<mpsc::Sender<ChatMessage>>>,
    inbound: AsyncMutex<Streaming<ChatMessage>>,
    closed: watch::Sender<bool>,
}

impl GrpcStream {
    fn new(
        chat_id: &str,
        outbound: mpsc::Sender<ChatMessage>,
        inbound: Streaming<ChatMessage>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            chat_id: chat_id.to_string(),
            outbound: Mutex::new(Some(outbound)),
            inbound: AsyncMutex::new(inbound),
            closed,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<ChatMessage>> {
        match self.outbound.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn to_wire(message: NewMessage) -> ChatMessage {
    ChatMessage {
        username: message.username,
        message: message.content,
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

fn from_wire(message: ChatMessage) -> Message {
    let creation_date = DateTime::parse_from_rfc3339(&message.created_at)
        .map(|date| date.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            debug!("bad created_at {:?}: {}", message.created_at, e);
            Utc::now()
        });
    Message {
        username: message.username,
        content: message.message,
        creation_date,
    }
}

#[async_trait]
impl Transport for GrpcStream {
    type Inbound = Message;
    type Outbound = NewMessage;

    async fn send(&self, message: NewMessage) -> Result<(), TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let sender = self.sender().ok_or(TransportError::Closed)?;
        // The clone keeps the request half open until this send returns.
        tokio::select! {
            res = sender.send(to_wire(message)) => res.map_err(|_| TransportError::Closed),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            res = inbound.message() => match res {
                Ok(Some(message)) => Ok(from_wire(message)),
                Ok(None) => Err(TransportError::Closed),
                Err(status) => Err(TransportError::Io(status.to_string())),
            },
        }
    }

    async fn close(&self) {
        let changed = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if changed {
            let sender = match self.outbound.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            drop(sender);
            debug!("closed send side of chat stream {}", self.chat_id);
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
