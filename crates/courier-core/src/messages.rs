use serde::{Deserialize, Serialize};

use crate::types::{MessageKey, PollUpdate, Reaction, UserReceipt, WebMessage};

/// Author placeholder for keys sent by the local account.
pub const SELF_AUTHOR: &str = "me";

/// Device family that produced a message, predicted from its ID shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Ios,
    Web,
    Android,
    Desktop,
    Unknown,
}

/// Predict the sending device family from a message ID.
pub fn get_device(message_id: &str) -> Device {
    let len = message_id.chars().count();
    if message_id.starts_with("3A") && len == 20 {
        Device::Ios
    } else if message_id.starts_with("3E") && len == 22 {
        Device::Web
    } else if len == 21 || len == 32 {
        Device::Android
    } else if message_id.starts_with("3F") || len == 18 {
        Device::Desktop
    } else {
        Device::Unknown
    }
}

/// Author of a keyed message: `self_id` (or [`SELF_AUTHOR`]) for own
/// messages, else the participant, else the chat.
pub fn key_author(key: Option<&MessageKey>, self_id: Option<&str>) -> String {
    match key {
        Some(key) if key.from_me => self_id.unwrap_or(SELF_AUTHOR).to_owned(),
        Some(key) => key.sender().to_owned(),
        None => String::new(),
    }
}

/// Replace the voter's previous update with `update`. An update without
/// selected options only retracts the previous one.
pub fn update_message_with_poll_update(message: &mut WebMessage, update: PollUpdate) {
    let author = key_author(update.poll_update_message_key.as_ref(), None);
    message
        .poll_updates
        .retain(|existing| key_author(existing.poll_update_message_key.as_ref(), None) != author);

    let has_selection = update
        .vote
        .as_ref()
        .is_some_and(|vote| !vote.selected_options.is_empty());
    if has_selection {
        message.poll_updates.push(update);
    }
}

/// Replace the author's previous reaction with `reaction`. An empty reaction
/// only removes the previous one.
pub fn update_message_with_reaction(message: &mut WebMessage, reaction: Reaction) {
    let author = key_author(reaction.key.as_ref(), None);
    message
        .reactions
        .retain(|existing| key_author(existing.key.as_ref(), None) != author);

    if reaction.text.as_deref().is_some_and(|text| !text.is_empty()) {
        message.reactions.push(reaction);
    }
}

/// Merge `receipt` into the recipient's existing receipt, or append it.
pub fn update_message_with_receipt(message: &mut WebMessage, receipt: UserReceipt) {
    let position = message
        .user_receipt
        .iter()
        .position(|existing| existing.user_jid == receipt.user_jid);
    match position {
        Some(index) => merge_receipt(&mut message.user_receipt[index], receipt),
        None => message.user_receipt.push(receipt),
    }
}

fn merge_receipt(existing: &mut UserReceipt, receipt: UserReceipt) {
    if receipt.receipt_timestamp.is_some() {
        existing.receipt_timestamp = receipt.receipt_timestamp;
    }
    if receipt.read_timestamp.is_some() {
        existing.read_timestamp = receipt.read_timestamp;
    }
    if receipt.played_timestamp.is_some() {
        existing.played_timestamp = receipt.played_timestamp;
    }
    if !receipt.pending_device_jid.is_empty() {
        existing.pending_device_jid = receipt.pending_device_jid;
    }
    if !receipt.delivered_device_jid.is_empty() {
        existing.delivered_device_jid = receipt.delivered_device_jid;
    }
}
