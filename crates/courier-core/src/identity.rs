//! Native identifier resolution backed by the namespaced cache.

use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{
    cache::{CacheManager, NamespaceStats},
    config::{ConfigHandle, JID_CACHE, LID_CACHE, LID_TO_JID_CACHE},
    jid::{
        self, Jid, JidConverter, JidError, LID_SERVER, StructuralJidConverter, ValidationResult,
    },
    logger::DiagnosticLogger,
    types::MessageKey,
};

/// Resolution outcome for one native identifier.
///
/// Either valid with `error == None`, or `is_valid == false` with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Identifier as received.
    pub native_id: String,
    /// Routable identifier; echoes the input when resolution failed.
    pub canonical_id: String,
    pub is_valid: bool,
    /// User component of the canonical identifier; empty when invalid.
    pub user: String,
    /// Unix milliseconds at which this result was computed.
    pub resolved_at_ms: u64,
    pub error: Option<String>,
}

/// Values held in the identifier namespaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEntry {
    /// `lidCache`: a full resolution result.
    Sender(SenderInfo),
    /// `jidCache`: memoized structural conversion.
    Canonical(String),
    /// `lidToJidCache`: the counterpart of a learned mapping.
    Mapping(String),
}

/// Stats of the three identifier namespaces; `None` if one is not configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCacheStats {
    pub lid_cache: Option<NamespaceStats>,
    pub jid_cache: Option<NamespaceStats>,
    pub lid_to_jid_cache: Option<NamespaceStats>,
}

/// Resolves native identifiers to canonical ones, caching results per the
/// live configuration.
#[derive(Clone)]
pub struct IdentityResolver {
    cache: Arc<CacheManager<IdentityEntry>>,
    converter: Arc<dyn JidConverter>,
    config: ConfigHandle,
    logger: DiagnosticLogger,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("namespaces", &self.cache.namespaces())
            .finish_non_exhaustive()
    }
}

impl IdentityResolver {
    /// Resolver with its own cache and the structural converter.
    pub fn new(config: ConfigHandle) -> Self {
        let cache = Arc::new(CacheManager::new(&config));
        Self::with_cache(cache, config)
    }

    /// Resolver sharing `cache`, which may hold unrelated namespaces.
    pub fn with_cache(cache: Arc<CacheManager<IdentityEntry>>, config: ConfigHandle) -> Self {
        Self {
            cache,
            converter: Arc::new(StructuralJidConverter::default()),
            logger: DiagnosticLogger::new(config.clone()),
            config,
        }
    }

    pub fn with_converter(mut self, converter: Arc<dyn JidConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn cache(&self) -> &Arc<CacheManager<IdentityEntry>> {
        &self.cache
    }

    fn caching_enabled(&self) -> bool {
        self.config.load().performance.enable_cache
    }

    /// Structural conversion, memoized in `jidCache`.
    pub fn to_jid(&self, native: &str) -> Result<String, JidError> {
        let native = native.trim();
        let use_cache = self.caching_enabled();
        if use_cache
            && let Some(IdentityEntry::Canonical(canonical)) = self.cache.get(JID_CACHE, native)
        {
            return Ok(canonical);
        }

        let canonical = self.converter.to_jid(native)?;
        if use_cache {
            self.cache
                .set(JID_CACHE, native, IdentityEntry::Canonical(canonical.clone()));
        }
        Ok(canonical)
    }

    pub fn validate_jid(&self, candidate: &str) -> ValidationResult {
        jid::validate_jid(candidate)
    }

    /// Resolve `native`, returning a cached result unchanged when present.
    ///
    /// Failures come back as an invalid [`SenderInfo`] and are not cached.
    pub fn resolve_sender(&self, native: &str) -> SenderInfo {
        let native = native.trim();
        let use_cache = self.caching_enabled();
        if use_cache
            && let Some(IdentityEntry::Sender(info)) = self.cache.get(LID_CACHE, native)
        {
            self.logger.lid(format_args!("cache hit for {native}"));
            return info;
        }

        let info = self.compute_sender(native);
        if info.is_valid {
            self.logger.lid(format_args!(
                "resolved {native} -> {}",
                info.canonical_id
            ));
            if use_cache {
                self.cache
                    .set(LID_CACHE, native, IdentityEntry::Sender(info.clone()));
            }
        } else {
            self.logger.warn(format_args!(
                "failed to resolve {native}: {}",
                info.error.as_deref().unwrap_or("unknown error")
            ));
        }
        info
    }

    /// Resolve the author of a message: group participant, else the chat.
    pub fn resolve_message_sender(&self, key: &MessageKey) -> SenderInfo {
        self.resolve_sender(key.sender())
    }

    fn compute_sender(&self, native: &str) -> SenderInfo {
        let canonical = match self.jid_for_lid(native) {
            Some(mapped) => Ok(mapped),
            None => self.to_jid(native),
        };
        let resolved_at_ms = now_millis();

        let parsed = canonical.and_then(|canonical| {
            let jid = Jid::parse(&canonical)?;
            Ok((canonical, jid))
        });
        match parsed {
            Ok((canonical_id, parsed)) => SenderInfo {
                native_id: native.to_owned(),
                canonical_id,
                is_valid: true,
                user: parsed.user,
                resolved_at_ms,
                error: None,
            },
            Err(err) => SenderInfo {
                native_id: native.to_owned(),
                canonical_id: native.to_owned(),
                is_valid: false,
                user: String::new(),
                resolved_at_ms,
                error: Some(err.to_string()),
            },
        }
    }

    /// Record that `lid` and `jid` name the same account.
    ///
    /// Cached resolutions of `lid` (any device) are dropped so the mapping
    /// takes effect on the next resolve.
    pub fn remember_mapping(&self, lid: &str, jid: &str) -> Result<(), JidError> {
        let lid = lid_key(lid)?;
        let jid = self.to_jid(jid)?;

        self.cache.set(
            LID_TO_JID_CACHE,
            format!("lid:{lid}"),
            IdentityEntry::Mapping(jid.clone()),
        );
        self.cache.set(
            LID_TO_JID_CACHE,
            format!("jid:{jid}"),
            IdentityEntry::Mapping(lid.clone()),
        );

        for cached in self.cache.keys(LID_CACHE) {
            if Jid::parse(&cached).is_ok_and(|parsed| parsed.user_jid() == lid) {
                self.cache.delete(LID_CACHE, &cached);
            }
        }
        self.logger.lid(format_args!("learned mapping {lid} <-> {jid}"));
        Ok(())
    }

    /// Canonical identifier learned for `lid`, if any.
    pub fn jid_for_lid(&self, lid: &str) -> Option<String> {
        let lid = lid_key(lid).ok()?;
        match self.cache.get(LID_TO_JID_CACHE, &format!("lid:{lid}")) {
            Some(IdentityEntry::Mapping(jid)) => Some(jid),
            _ => None,
        }
    }

    /// Native identifier learned for `jid`, if any.
    pub fn lid_for_jid(&self, jid: &str) -> Option<String> {
        let jid = self.to_jid(jid).ok()?;
        match self.cache.get(LID_TO_JID_CACHE, &format!("jid:{jid}")) {
            Some(IdentityEntry::Mapping(lid)) => Some(lid),
            _ => None,
        }
    }

    pub fn cache_stats(&self) -> IdentityCacheStats {
        IdentityCacheStats {
            lid_cache: self.cache.stats(LID_CACHE),
            jid_cache: self.cache.stats(JID_CACHE),
            lid_to_jid_cache: self.cache.stats(LID_TO_JID_CACHE),
        }
    }

    /// Empty the identifier namespaces only.
    pub fn clear_cache(&self) {
        for namespace in [LID_CACHE, JID_CACHE, LID_TO_JID_CACHE] {
            self.cache.clear(namespace);
        }
        self.logger.debug("identity caches cleared");
    }
}

fn lid_key(lid: &str) -> Result<String, JidError> {
    let parsed = Jid::parse(lid)?;
    if !parsed.is_lid() {
        return Err(JidError::UnexpectedServer {
            input: lid.trim().to_owned(),
            expected: LID_SERVER,
        });
    }
    Ok(parsed.user_jid())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{CacheSettings, CourierConfig, PerformancePatch};

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(ConfigHandle::default())
    }

    #[derive(Debug)]
    struct RejectAll;

    impl JidConverter for RejectAll {
        fn to_jid(&self, native: &str) -> Result<String, JidError> {
            Err(JidError::MissingServer(native.to_owned()))
        }
    }

    #[test]
    fn to_jid_is_idempotent_and_memoized() {
        let resolver = resolver();
        let once = resolver.to_jid("123456:7@lid").expect("valid lid");
        assert_eq!(once, "123456@s.whatsapp.net");
        assert_eq!(resolver.to_jid(&once).as_deref(), Ok(once.as_str()));
        assert_eq!(resolver.to_jid("123456:7@lid").as_deref(), Ok(once.as_str()));

        let stats = resolver.cache_stats().jid_cache.expect("jid namespace");
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn repeated_resolution_returns_cached_result() {
        let resolver = resolver();
        let first = resolver.resolve_sender("15551234567:2@s.whatsapp.net");
        assert!(first.is_valid);
        assert_eq!(first.canonical_id, "15551234567@s.whatsapp.net");
        assert_eq!(first.user, "15551234567");
        assert_eq!(first.error, None);

        std::thread::sleep(Duration::from_millis(5));
        let second = resolver.resolve_sender("15551234567:2@s.whatsapp.net");
        assert_eq!(first, second);
    }

    #[test]
    fn clearing_forces_a_fresh_timestamp() {
        let resolver = resolver();
        let first = resolver.resolve_sender("42@lid");
        std::thread::sleep(Duration::from_millis(5));
        resolver.clear_cache();

        let second = resolver.resolve_sender("42@lid");
        assert_eq!(second.canonical_id, first.canonical_id);
        assert!(second.resolved_at_ms > first.resolved_at_ms);
    }

    #[test]
    fn invalid_input_is_returned_as_data_and_not_cached() {
        let resolver = resolver();
        let info = resolver.resolve_sender("no server here");
        assert!(!info.is_valid);
        assert!(info.error.is_some());
        assert_eq!(info.canonical_id, "no server here");
        assert!(info.user.is_empty());

        let stats = resolver.cache_stats().lid_cache.expect("lid namespace");
        assert_eq!(stats.keys, 0);
    }

    #[test]
    fn converter_is_pluggable() {
        let resolver = resolver().with_converter(Arc::new(RejectAll));
        let info = resolver.resolve_sender("42@lid");
        assert!(!info.is_valid);
        assert!(resolver.to_jid("42@lid").is_err());
    }

    #[test]
    fn learned_mapping_overrides_structural_conversion() {
        let resolver = resolver();
        let before = resolver.resolve_sender("999:3@lid");
        assert_eq!(before.canonical_id, "999@s.whatsapp.net");

        resolver
            .remember_mapping("999@lid", "15551234567:1@s.whatsapp.net")
            .expect("valid mapping");

        let after = resolver.resolve_sender("999:3@lid");
        assert_eq!(after.canonical_id, "15551234567@s.whatsapp.net");
        assert_eq!(after.user, "15551234567");
        assert_eq!(
            resolver.jid_for_lid("999:5@lid").as_deref(),
            Some("15551234567@s.whatsapp.net")
        );
        assert_eq!(
            resolver.lid_for_jid("15551234567@c.us").as_deref(),
            Some("999@lid")
        );
    }

    #[test]
    fn mapping_requires_a_lid() {
        let resolver = resolver();
        assert!(matches!(
            resolver.remember_mapping("1@s.whatsapp.net", "2@s.whatsapp.net"),
            Err(JidError::UnexpectedServer { .. })
        ));
    }

    #[test]
    fn message_sender_prefers_participant() {
        let resolver = resolver();
        let group = MessageKey::new("120363000000000000@g.us", "ABC").with_participant("77@lid");
        assert_eq!(
            resolver.resolve_message_sender(&group).canonical_id,
            "77@s.whatsapp.net"
        );

        let direct = MessageKey::new("88@s.whatsapp.net", "DEF");
        assert_eq!(resolver.resolve_message_sender(&direct).user, "88");
    }

    #[test]
    fn clear_leaves_other_namespaces_alone() {
        let mut config = CourierConfig::default();
        config.cache.insert(
            "sessions".to_owned(),
            CacheSettings::new(Duration::from_secs(60), 10, Duration::from_secs(30)),
        );
        let handle = ConfigHandle::new(config);
        let cache = Arc::new(CacheManager::new(&handle));
        let resolver = IdentityResolver::with_cache(Arc::clone(&cache), handle);

        cache.set("sessions", "s1", IdentityEntry::Canonical("kept".into()));
        resolver.resolve_sender("42@lid");
        resolver.clear_cache();

        assert_eq!(
            cache.get("sessions", "s1"),
            Some(IdentityEntry::Canonical("kept".into()))
        );
        let stats = resolver.cache_stats();
        assert_eq!(stats.lid_cache.map(|s| s.keys), Some(0));
        assert_eq!(stats.jid_cache.map(|s| s.keys), Some(0));
    }

    #[test]
    fn disabled_cache_recomputes_every_time() {
        let handle = ConfigHandle::default();
        handle.update_performance(PerformancePatch {
            enable_cache: Some(false),
            ..PerformancePatch::default()
        });
        let resolver = IdentityResolver::new(handle);

        resolver.resolve_sender("42@lid");
        resolver.to_jid("42@lid").expect("valid");

        let stats = resolver.cache_stats();
        assert_eq!(stats.lid_cache.map(|s| s.keys), Some(0));
        assert_eq!(stats.jid_cache.map(|s| s.keys), Some(0));
    }
}
