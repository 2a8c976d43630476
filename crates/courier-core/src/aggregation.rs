//! Poll-vote tallies and read-receipt batching.

use std::collections::{HashMap, hash_map::Entry};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    identity::IdentityResolver,
    jid::are_jids_same_user,
    messages::key_author,
    normalization::normalize_message_content,
    types::{Message, MessageKey, PollUpdate},
};

/// Name given to tallies for option hashes the poll does not define.
pub const UNKNOWN_OPTION: &str = "Unknown";

/// Voters behind one poll option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteAggregation {
    pub name: String,
    pub voters: Vec<String>,
}

/// Message IDs to acknowledge for one (chat, participant) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptGroup {
    pub jid: String,
    pub participant: Option<String>,
    pub message_ids: Vec<String>,
}

/// SHA-256 digest identifying a poll option inside a vote.
pub fn option_hash(option_name: &str) -> Vec<u8> {
    Sha256::digest(option_name.as_bytes()).to_vec()
}

/// Tally the latest vote of every voter.
///
/// Entries follow the poll's option order, then unknown hashes in first-seen
/// order. A voter's latest update is the one with the highest sender
/// timestamp; updates without a timestamp rank below every timestamped one,
/// and position in `updates` breaks ties. Voters are resolved through `resolver`; own votes are
/// attributed to `self_id`.
pub fn aggregate_votes(
    poll_message: &Message,
    updates: &[PollUpdate],
    self_id: Option<&str>,
    resolver: &IdentityResolver,
) -> Vec<VoteAggregation> {
    let options = normalize_message_content(Some(poll_message))
        .unwrap_or(poll_message)
        .poll_creation()
        .map(|poll| poll.options.as_slice())
        .unwrap_or_default();

    let mut tallies: Vec<VoteAggregation> = Vec::with_capacity(options.len());
    let mut by_hash: HashMap<Vec<u8>, usize> = HashMap::new();
    for option in options {
        if let Entry::Vacant(slot) = by_hash.entry(option_hash(&option.option_name)) {
            slot.insert(tallies.len());
            tallies.push(VoteAggregation {
                name: option.option_name.clone(),
                voters: Vec::new(),
            });
        }
    }

    let mut latest: HashMap<String, usize> = HashMap::new();
    for (index, update) in updates.iter().enumerate() {
        let voter = voter_id(update, self_id, resolver);
        match latest.entry(voter) {
            Entry::Vacant(slot) => {
                slot.insert(index);
            }
            Entry::Occupied(mut slot) => {
                let previous = *slot.get();
                // `None < Some(_)`, so the key orders every pair of updates.
                if (update.sender_timestamp_ms, index)
                    > (updates[previous].sender_timestamp_ms, previous)
                {
                    slot.insert(index);
                }
            }
        }
    }

    let mut winners: Vec<(usize, String)> = latest
        .into_iter()
        .map(|(voter, index)| (index, voter))
        .collect();
    winners.sort_unstable();

    for (index, voter) in winners {
        let Some(vote) = &updates[index].vote else {
            continue;
        };
        for selected in &vote.selected_options {
            let position = match by_hash.get(selected) {
                Some(position) => *position,
                None => {
                    by_hash.insert(selected.clone(), tallies.len());
                    tallies.push(VoteAggregation {
                        name: UNKNOWN_OPTION.to_owned(),
                        voters: Vec::new(),
                    });
                    tallies.len() - 1
                }
            };
            let voters = &mut tallies[position].voters;
            if !voters.contains(&voter) {
                voters.push(voter.clone());
            }
        }
    }

    tallies
}

fn voter_id(update: &PollUpdate, self_id: Option<&str>, resolver: &IdentityResolver) -> String {
    let raw = key_author(update.poll_update_message_key.as_ref(), self_id);
    let info = resolver.resolve_sender(&raw);
    if info.is_valid { info.canonical_id } else { raw }
}

/// Group keys of received messages by (chat, participant) for batched read
/// receipts. Own messages and keys authored by `self_id` are skipped.
pub fn aggregate_receipt_keys(keys: &[MessageKey], self_id: Option<&str>) -> Vec<ReceiptGroup> {
    let mut groups: Vec<ReceiptGroup> = Vec::new();
    let mut by_pair: HashMap<(String, Option<String>), usize> = HashMap::new();

    for key in keys {
        if key.from_me {
            continue;
        }
        if let Some(own) = self_id
            && are_jids_same_user(own, key.sender())
        {
            continue;
        }

        let participant = key.participant.clone().filter(|p| !p.is_empty());
        let pair = (key.remote_jid.clone(), participant);
        let position = match by_pair.entry(pair) {
            Entry::Occupied(slot) => *slot.get(),
            Entry::Vacant(slot) => {
                let (jid, participant) = slot.key().clone();
                slot.insert(groups.len());
                groups.push(ReceiptGroup {
                    jid,
                    participant,
                    message_ids: Vec::new(),
                });
                groups.len() - 1
            }
        };
        groups[position].message_ids.push(key.id.clone());
    }

    groups
}
