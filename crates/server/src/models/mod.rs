use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of one transport attachment (one WebSocket).
pub type ConnectionId = String;

/// Kind of a chat-stream message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    #[default]
    Chat,
    Join,
    Leave,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "CHAT",
            MessageType::Join => "JOIN",
            MessageType::Leave => "LEAVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CHAT" => Some(MessageType::Chat),
            "JOIN" => Some(MessageType::Join),
            "LEAVE" => Some(MessageType::Leave),
            _ => None,
        }
    }
}

/// Attachment metadata carried alongside a message.
///
/// The relay never dereferences these; they point into the file store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

impl FileAttachment {
    pub fn is_empty(&self) -> bool {
        self.file_name.is_none()
            && self.file_type.is_none()
            && self.file_url.is_none()
            && self.file_id.is_none()
    }
}

/// A single message on the public stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Row id, assigned when persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub file: FileAttachment,
    /// Receipt time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Owning chat session, set once by the session manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ChatMessage {
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            message_type,
            sender: sender.into(),
            content: content.into(),
            file: FileAttachment::default(),
            timestamp: None,
            session_id: None,
        }
    }

    pub fn chat(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageType::Chat, sender, content)
    }

    /// `"<user> joined!"`
    pub fn join(username: &str) -> Self {
        Self::new(MessageType::Join, username, format!("{} joined!", username))
    }

    /// `"<user> left!"`
    pub fn leave(username: &str) -> Self {
        Self::new(MessageType::Leave, username, format!("{} left!", username))
    }

    pub fn with_file(mut self, file: FileAttachment) -> Self {
        self.file = file;
        self
    }

    /// Clear server-owned fields a client may have sent and stamp the receipt time.
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.id = None;
        self.session_id = None;
        self.timestamp = Some(at);
        self
    }
}

/// A bounded grouping of the message stream used to scope history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// `None` while the session is open
    pub ended_at: Option<DateTime<Utc>>,
    pub participants: BTreeSet<String>,
}

impl ChatSession {
    pub fn open(created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at,
            ended_at: None,
            participants: BTreeSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Tag for non-message frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    #[serde(rename = "USER_LIST")]
    UserList,
    #[serde(rename = "ERROR")]
    Error,
}

/// Full roster broadcast after every presence change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub users: Vec<String>,
}

impl UserList {
    pub fn new(users: Vec<String>) -> Self {
        Self {
            kind: FrameKind::UserList,
            users,
        }
    }
}

/// Client-visible rejection of an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Error,
            message: message.into(),
        }
    }
}

/// Everything the relay writes to a client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Message(ChatMessage),
    UserList(UserList),
    Error(ErrorFrame),
}

impl From<ChatMessage> for Frame {
    fn from(message: ChatMessage) -> Self {
        Frame::Message(message)
    }
}

impl From<UserList> for Frame {
    fn from(list: UserList) -> Self {
        Frame::UserList(list)
    }
}

impl From<ErrorFrame> for Frame {
    fn from(err: ErrorFrame) -> Self {
        Frame::Error(err)
    }
}

/// Everything a client may write to the relay
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientFrame {
    Join(ChatMessage),
    Send(ChatMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_shape() {
        let msg = ChatMessage::chat("Neha", "hi").with_file(FileAttachment {
            file_name: Some("a.png".into()),
            file_id: Some("f1".into()),
            ..Default::default()
        });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "CHAT",
                "sender": "Neha",
                "content": "hi",
                "fileName": "a.png",
                "fileId": "f1"
            })
        );
    }

    #[test]
    fn test_client_frame_parses_client_payloads() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"action":"join","sender":"Saurabh","type":"JOIN"}"#).unwrap();
        match frame {
            ClientFrame::Join(msg) => {
                assert_eq!(msg.sender, "Saurabh");
                assert_eq!(msg.message_type, MessageType::Join);
                assert!(msg.content.is_empty());
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let frame: ClientFrame = serde_json::from_str(
            r#"{"action":"send","sender":"Neha","content":"","type":"CHAT","fileName":"r.pdf","fileUrl":"/api/files/1"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Send(msg) => {
                assert_eq!(msg.file.file_name.as_deref(), Some("r.pdf"));
                assert_eq!(msg.file.file_url.as_deref(), Some("/api/files/1"));
                assert!(msg.file.file_id.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_received_at_clears_server_fields() {
        let mut msg = ChatMessage::chat("a", "b");
        msg.id = Some(7);
        msg.session_id = Some("forged".into());

        let now = Utc::now();
        let msg = msg.received_at(now);
        assert_eq!(msg.id, None);
        assert_eq!(msg.session_id, None);
        assert_eq!(msg.timestamp, Some(now));
    }

    #[test]
    fn test_user_list_frame() {
        let frame = Frame::from(UserList::new(vec!["Neha".into(), "Saurabh".into()]));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "USER_LIST", "users": ["Neha", "Saurabh"]})
        );
    }
}
