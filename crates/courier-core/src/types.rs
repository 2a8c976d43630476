use serde::{Deserialize, Serialize};

/// Addressing key of one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageKey {
    /// Chat the message belongs to (user, group or broadcast identifier).
    pub remote_jid: String,
    /// Whether the local account sent the message.
    pub from_me: bool,
    /// Message ID, unique within the chat.
    pub id: String,
    /// Sender inside a group chat. `None` for one-to-one chats.
    pub participant: Option<String>,
}

impl MessageKey {
    pub fn new(remote_jid: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            remote_jid: remote_jid.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn from_me(mut self) -> Self {
        self.from_me = true;
        self
    }

    pub fn with_participant(mut self, participant: impl Into<String>) -> Self {
        self.participant = Some(participant.into());
        self
    }

    /// Participant when present and non-empty, else the chat.
    pub fn sender(&self) -> &str {
        self.participant
            .as_deref()
            .filter(|participant| !participant.is_empty())
            .unwrap_or(&self.remote_jid)
    }
}

/// Text message carrying extra metadata (links, quotes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtendedTextMessage {
    /// Message body.
    pub text: String,
    /// Canonical URL of a link preview, if any.
    pub matched_text: Option<String>,
}

/// Image, video, audio, document or sticker payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaMessage {
    /// Encrypted media download URL.
    pub url: Option<String>,
    /// MIME content type, for example `image/jpeg`.
    pub mimetype: Option<String>,
    /// Optional caption shown under the media.
    pub caption: Option<String>,
    /// Plaintext size in bytes.
    pub file_length: Option<u64>,
    /// Original file name (documents only).
    pub file_name: Option<String>,
}

/// Emoji reaction to another message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ReactionMessage {
    /// Key of the message being reacted to.
    pub key: Option<MessageKey>,
    /// Reaction emoji. Empty removes a previous reaction.
    pub text: Option<String>,
    /// Sender clock when the reaction was made.
    pub sender_timestamp_ms: Option<i64>,
}

/// One choice of a poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PollOption {
    pub option_name: String,
}

impl PollOption {
    pub fn new(option_name: impl Into<String>) -> Self {
        Self {
            option_name: option_name.into(),
        }
    }
}

/// Poll definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PollCreationMessage {
    /// Poll question.
    pub name: String,
    /// Choices in creation order.
    pub options: Vec<PollOption>,
    /// Maximum choices per voter. `0` means unlimited.
    pub selectable_options_count: u32,
}

/// Decrypted vote: SHA-256 digests of the selected option names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PollVote {
    pub selected_options: Vec<Vec<u8>>,
}

/// Wire message announcing a vote on a poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PollUpdateMessage {
    /// Key of the poll creation message being voted on.
    pub poll_creation_message_key: Option<MessageKey>,
    /// Decrypted vote, when available.
    pub vote: Option<PollVote>,
    /// Sender clock when the vote was cast.
    pub sender_timestamp_ms: Option<i64>,
}

/// Layer wrapping the real content (disappearing, view-once, edits).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct FutureProofMessage {
    pub message: Option<Box<Message>>,
}

impl FutureProofMessage {
    pub fn wrap(message: Message) -> Box<Self> {
        Box::new(Self {
            message: Some(Box::new(message)),
        })
    }
}

/// Interactive carrier body (buttons or one template variant).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateContent {
    /// Plain body text.
    pub content_text: Option<String>,
    /// Body text after placeholder hydration.
    pub hydrated_content_text: Option<String>,
    /// Header image, if the carrier has one.
    pub image_message: Option<MediaMessage>,
    /// Header video, if the carrier has one.
    pub video_message: Option<MediaMessage>,
    /// Header document, if the carrier has one.
    pub document_message: Option<MediaMessage>,
}

/// Template carrier; at most one variant is normally set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateMessage {
    pub hydrated_four_row_template: Option<TemplateContent>,
    pub hydrated_template: Option<TemplateContent>,
    pub four_row_template: Option<TemplateContent>,
}

/// Decrypted message envelope. Exactly one content field is normally set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    /// Plain text body.
    pub conversation: Option<String>,
    pub extended_text_message: Option<ExtendedTextMessage>,
    pub image_message: Option<MediaMessage>,
    pub video_message: Option<MediaMessage>,
    pub audio_message: Option<MediaMessage>,
    pub document_message: Option<MediaMessage>,
    pub sticker_message: Option<MediaMessage>,
    pub reaction_message: Option<ReactionMessage>,
    pub poll_creation_message: Option<PollCreationMessage>,
    pub poll_creation_message_v2: Option<PollCreationMessage>,
    pub poll_creation_message_v3: Option<PollCreationMessage>,
    pub poll_update_message: Option<PollUpdateMessage>,
    pub buttons_message: Option<TemplateContent>,
    pub template_message: Option<TemplateMessage>,
    /// Disappearing-message wrapper.
    pub ephemeral_message: Option<Box<FutureProofMessage>>,
    pub view_once_message: Option<Box<FutureProofMessage>>,
    pub view_once_message_v2: Option<Box<FutureProofMessage>>,
    pub view_once_message_v2_extension: Option<Box<FutureProofMessage>>,
    pub document_with_caption_message: Option<Box<FutureProofMessage>>,
    pub edited_message: Option<Box<FutureProofMessage>>,
}

impl Message {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            conversation: Some(body.into()),
            ..Self::default()
        }
    }

    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Poll definition from whichever poll version is present.
    pub fn poll_creation(&self) -> Option<&PollCreationMessage> {
        self.poll_creation_message
            .as_ref()
            .or(self.poll_creation_message_v2.as_ref())
            .or(self.poll_creation_message_v3.as_ref())
    }
}

/// A vote attached to a stored poll message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct PollUpdate {
    /// Key of the vote message; identifies the voter.
    pub poll_update_message_key: Option<MessageKey>,
    /// Decrypted vote. An empty selection retracts the voter's choice.
    pub vote: Option<PollVote>,
    /// Sender clock when the vote was cast.
    pub sender_timestamp_ms: Option<i64>,
}

/// A reaction attached to a stored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Reaction {
    /// Key of the reaction message; identifies the reacting user.
    pub key: Option<MessageKey>,
    /// Reaction emoji. Empty or `None` means "removed".
    pub text: Option<String>,
    pub sender_timestamp_ms: Option<i64>,
}

/// Delivery state of a stored message for one recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct UserReceipt {
    /// Recipient identifier.
    pub user_jid: String,
    /// Delivery time in unix seconds.
    pub receipt_timestamp: Option<i64>,
    /// Read time in unix seconds.
    pub read_timestamp: Option<i64>,
    /// Playback time in unix seconds (voice notes, videos).
    pub played_timestamp: Option<i64>,
    /// Devices still waiting for delivery.
    pub pending_device_jid: Vec<String>,
    /// Devices that acknowledged delivery.
    pub delivered_device_jid: Vec<String>,
}

/// Stored message with its accumulated side state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct WebMessage {
    pub key: MessageKey,
    pub message: Option<Message>,
    /// Server timestamp in unix seconds.
    pub message_timestamp: Option<u64>,
    pub poll_updates: Vec<PollUpdate>,
    pub reactions: Vec<Reaction>,
    pub user_receipt: Vec<UserReceipt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_wire_shaped_envelope() {
        let raw = r#"{
            "key": { "remoteJid": "123@g.us", "id": "3EB0ABC", "participant": "456@lid" },
            "message": {
                "ephemeralMessage": {
                    "message": { "conversation": "hello" }
                }
            },
            "messageTimestamp": 1700000000
        }"#;

        let parsed: WebMessage = serde_json::from_str(raw).expect("valid envelope");
        assert_eq!(parsed.key.sender(), "456@lid");
        assert!(!parsed.key.from_me);
        let inner = parsed
            .message
            .as_ref()
            .and_then(|m| m.ephemeral_message.as_ref())
            .and_then(|w| w.message.as_deref());
        assert_eq!(inner, Some(&Message::text("hello")));
        assert!(parsed.poll_updates.is_empty());
    }

    #[test]
    fn sender_falls_back_to_chat() {
        let key = MessageKey::new("15551234567@s.whatsapp.net", "ABC").with_participant("");
        assert_eq!(key.sender(), "15551234567@s.whatsapp.net");
    }

    #[test]
    fn poll_creation_checks_every_version() {
        let message = Message {
            poll_creation_message_v3: Some(PollCreationMessage {
                name: "lunch".into(),
                options: vec![PollOption::new("pizza")],
                selectable_options_count: 1,
            }),
            ..Message::default()
        };
        assert_eq!(message.poll_creation().map(|p| p.name.as_str()), Some("lunch"));
        assert!(Message::default().is_empty());
        assert!(!message.is_empty());
    }
}
