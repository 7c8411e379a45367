//! Protobuf messages of the chat backend's `ChatService`.
//!
//! Hand-derived with `prost` so the relay builds without `protoc`. Field tags
//! follow `server_alpha/chat/v1/chat.proto`.

/// Fully qualified service name.
pub const CHAT_SERVICE: &str = "server_alpha.chat.v1.ChatService";

/// Unary call that registers the caller with a chat before streaming.
pub const PREPARE_CHAT_STREAM_PATH: &str = "/server_alpha.chat.v1.ChatService/PrepareChatStream";

/// Bidirectional message stream.
pub const CHAT_MESSAGE_PATH: &str = "/server_alpha.chat.v1.ChatService/ChatMessage";

/// Metadata key carrying the authenticated username.
pub const SUBJECT_METADATA_KEY: &str = "subject";

/// Metadata key carrying the chat id on the message stream.
pub const CHAT_ID_METADATA_KEY: &str = "chat-id";

#[derive(Clone, PartialEq, prost::Message)]
pub struct PrepareChatStreamRequest {
    #[prost(string, tag = "1")]
    pub chat_id: String,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct PrepareChatStreamResponse {}

/// One message on the `ChatMessage` stream, in either direction.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ChatMessage {
    #[prost(string, tag = "1")]
    pub username: String,
    #[prost(string, tag = "2")]
    pub message: String,
    /// RFC3339 timestamp.
    #[prost(string, tag = "3")]
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn test_paths_share_service_name() {
        assert!(PREPARE_CHAT_STREAM_PATH.starts_with(&format!("/{CHAT_SERVICE}/")));
        assert!(CHAT_MESSAGE_PATH.starts_with(&format!("/{CHAT_SERVICE}/")));
    }

    #[test]
    fn test_chat_message_wire_tags() {
        let msg = ChatMessage {
            username: "a".to_string(),
            message: "b".to_string(),
            created_at: "c".to_string(),
        };
        // field 1 (0x0a), field 2 (0x12), field 3 (0x1a), each length-delimited.
        assert_eq!(
            msg.encode_to_vec(),
            vec![0x0a, 1, b'a', 0x12, 1, b'b', 0x1a, 1, b'c']
        );
    }
}
