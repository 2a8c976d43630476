use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MediaMessage, Message, TemplateContent};

/// Wrapper layers deeper than this are left as-is.
const MAX_WRAPPER_DEPTH: usize = 5;

/// Errors produced while inspecting message content.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message has no content")]
    Empty,
    #[error("given message is not a media message (found {found:?})")]
    NotMedia { found: Option<ContentType> },
}

/// Kind of content carried by a [`Message`], in field-declaration order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ContentType {
    Conversation,
    ExtendedText,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Reaction,
    PollCreation,
    PollUpdate,
    Buttons,
    Template,
    Ephemeral,
    ViewOnce,
    DocumentWithCaption,
    Edited,
}

impl ContentType {
    pub fn is_media(self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::Document | Self::Sticker
        )
    }
}

/// First content field set on `message`, or `None` for an empty envelope.
pub fn get_content_type(message: &Message) -> Option<ContentType> {
    let checks: [(bool, ContentType); 16] = [
        (message.conversation.is_some(), ContentType::Conversation),
        (
            message.extended_text_message.is_some(),
            ContentType::ExtendedText,
        ),
        (message.image_message.is_some(), ContentType::Image),
        (message.video_message.is_some(), ContentType::Video),
        (message.audio_message.is_some(), ContentType::Audio),
        (message.document_message.is_some(), ContentType::Document),
        (message.sticker_message.is_some(), ContentType::Sticker),
        (message.reaction_message.is_some(), ContentType::Reaction),
        (message.poll_creation().is_some(), ContentType::PollCreation),
        (message.poll_update_message.is_some(), ContentType::PollUpdate),
        (message.buttons_message.is_some(), ContentType::Buttons),
        (message.template_message.is_some(), ContentType::Template),
        (message.ephemeral_message.is_some(), ContentType::Ephemeral),
        (
            message.view_once_message.is_some()
                || message.view_once_message_v2.is_some()
                || message.view_once_message_v2_extension.is_some(),
            ContentType::ViewOnce,
        ),
        (
            message.document_with_caption_message.is_some(),
            ContentType::DocumentWithCaption,
        ),
        (message.edited_message.is_some(), ContentType::Edited),
    ];
    checks
        .into_iter()
        .find_map(|(present, kind)| present.then_some(kind))
}

fn wrapped_message(message: &Message) -> Option<Option<&Message>> {
    [
        &message.ephemeral_message,
        &message.view_once_message,
        &message.document_with_caption_message,
        &message.view_once_message_v2,
        &message.view_once_message_v2_extension,
        &message.edited_message,
    ]
    .into_iter()
    .find_map(|layer| layer.as_deref())
    .map(|layer| layer.message.as_deref())
}

/// Unwrap disappearing, view-once, document-with-caption and edit layers.
///
/// Returns `None` when the envelope is absent, a wrapper is hollow, or the
/// innermost content is empty.
pub fn normalize_message_content(message: Option<&Message>) -> Option<&Message> {
    let mut current = message?;
    for _ in 0..MAX_WRAPPER_DEPTH {
        match wrapped_message(current) {
            Some(inner) => current = inner?,
            None => break,
        }
    }
    (!current.is_empty()).then_some(current)
}

/// Normalize, then reduce button and template carriers to the content they
/// display (header media, else body text).
pub fn extract_message_content(message: Option<&Message>) -> Option<Cow<'_, Message>> {
    let content = normalize_message_content(message)?;

    if let Some(buttons) = &content.buttons_message {
        return Some(Cow::Owned(from_template(buttons)));
    }
    if let Some(template) = &content.template_message {
        let variant = template
            .hydrated_four_row_template
            .as_ref()
            .or(template.hydrated_template.as_ref())
            .or(template.four_row_template.as_ref());
        if let Some(variant) = variant {
            return Some(Cow::Owned(from_template(variant)));
        }
    }
    Some(Cow::Borrowed(content))
}

fn from_template(template: &TemplateContent) -> Message {
    if let Some(image) = &template.image_message {
        return Message {
            image_message: Some(image.clone()),
            ..Message::default()
        };
    }
    if let Some(document) = &template.document_message {
        return Message {
            document_message: Some(document.clone()),
            ..Message::default()
        };
    }
    if let Some(video) = &template.video_message {
        return Message {
            video_message: Some(video.clone()),
            ..Message::default()
        };
    }
    let text = template
        .content_text
        .clone()
        .or_else(|| template.hydrated_content_text.clone())
        .unwrap_or_default();
    Message::text(text)
}

/// Media payload of a (possibly wrapped) message.
pub fn assert_media_content(message: Option<&Message>) -> Result<&MediaMessage, MessageError> {
    let content = normalize_message_content(message).ok_or(MessageError::Empty)?;
    content
        .document_message
        .as_ref()
        .or(content.image_message.as_ref())
        .or(content.video_message.as_ref())
        .or(content.audio_message.as_ref())
        .or(content.sticker_message.as_ref())
        .ok_or_else(|| MessageError::NotMedia {
            found: get_content_type(content),
        })
}
