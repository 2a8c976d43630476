//! Resilience and identifier-resolution layer of a multi-device messaging client.
//!
//! This crate provides the retry executor, namespaced expiring caches,
//! identifier resolution, and the message-envelope helpers used to normalize
//! content and tally polls and receipts.

/// Poll-vote and read-receipt aggregation.
pub mod aggregation;
/// Namespaced TTL caches with memory-pressure eviction.
pub mod cache;
/// Configuration snapshots, patches and the shared handle.
pub mod config;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Native identifier resolution cache.
pub mod identity;
/// Identifier parsing, validation and canonicalization.
pub mod jid;
/// Level-gated diagnostics.
pub mod logger;
/// Stored-message updates and device prediction.
pub mod messages;
/// Envelope unwrapping and content inspection.
pub mod normalization;
/// Backoff retry executor.
pub mod retry;
/// Message envelope model.
pub mod types;

pub use aggregation::{
    ReceiptGroup, UNKNOWN_OPTION, VoteAggregation, aggregate_receipt_keys, aggregate_votes,
    option_hash,
};
pub use cache::{CacheManager, EvictionReport, NamespaceStats};
pub use config::{
    CacheSettings, CacheSettingsPatch, ConfigError, ConfigHandle, ConfigPatch, CourierConfig,
    DebugPatch, DebugSettings, JID_CACHE, LID_CACHE, LID_TO_JID_CACHE, LogLevel,
    PerformancePatch, PerformanceSettings,
};
pub use error::{CourierError, ErrorCategory, classify_http_status};
pub use identity::{IdentityCacheStats, IdentityEntry, IdentityResolver, SenderInfo};
pub use jid::{
    Jid, JidConverter, JidError, StructuralJidConverter, ValidationResult, are_jids_same_user,
    validate_jid,
};
pub use logger::DiagnosticLogger;
pub use messages::{
    Device, get_device, update_message_with_poll_update, update_message_with_reaction,
    update_message_with_receipt,
};
pub use normalization::{
    ContentType, MessageError, assert_media_content, extract_message_content, get_content_type,
    normalize_message_content,
};
pub use retry::{AttemptContext, RetryInterrupt, RetryPolicy, retry_with_backoff};
pub use types::{
    FutureProofMessage, MediaMessage, Message, MessageKey, PollCreationMessage, PollOption,
    PollUpdate, PollVote, Reaction, UserReceipt, WebMessage,
};
