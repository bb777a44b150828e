//! Decision model and cached decision index
//!
//! Maps scoped identifiers (IP, CIDR, country) to ordered multisets of
//! active decisions. Entries live in the tag-aware cache store; ranged
//! decisions are keyed by CIDR and tracked in a shared range catalog so
//! lookups can test containment without enumerating the backend.

use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{unix_now, CacheStore};
use crate::error::{BouncerError, Result};
use crate::remediation::{parse_duration, Remediation};

/// Tag carried by every decision entry.
pub const REMEDIATION_TAG: &str = "remediation";

/// Well-known entry listing every CIDR with an active ranged decision.
pub const RANGE_CATALOG_KEY: &str = "range_catalog";

/// Decision id used for materialised clean-IP markers.
pub const BYPASS_SENTINEL_ID: i64 = 0;

/// An immutable decision as served by LAPI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub scope: String,
    pub value: String,
    pub duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ip: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ip: Option<i64>,
}

/// Addressing domain of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Ip,
    Range,
    Country,
}

impl Scope {
    pub fn parse(raw: &str) -> Result<Scope> {
        match raw.to_ascii_lowercase().as_str() {
            "ip" => Ok(Scope::Ip),
            "range" => Ok(Scope::Range),
            "country" => Ok(Scope::Country),
            other => Err(BouncerError::Input(format!("unknown scope {other:?}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Range => "range",
            Scope::Country => "country",
        }
    }
}

/// Plain (pre-encoding) cache key for a scope/value pair.
pub fn scoped_key(scope: Scope, value: &str) -> String {
    format!("{}_{}", scope.as_str(), value)
}

/// Canonical form of a decision value for its scope.
pub fn normalize_value(scope: Scope, value: &str) -> Result<String> {
    match scope {
        Scope::Ip => value
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.to_string())
            .map_err(|_| BouncerError::Input(format!("invalid IP {value:?}"))),
        Scope::Range => value
            .parse::<IpNet>()
            .map(|net| net.trunc().to_string())
            .map_err(|_| BouncerError::Input(format!("invalid CIDR {value:?}"))),
        Scope::Country => {
            if value.len() == 2 && value.chars().all(|c| c.is_ascii_alphabetic()) {
                Ok(value.to_ascii_uppercase())
            } else {
                Err(BouncerError::Input(format!(
                    "invalid country code {value:?}"
                )))
            }
        }
    }
}

/// One member of a decision entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDecision {
    pub kind: Remediation,
    pub expires_at: u64,
    pub id: i64,
}

// Priority order with deterministic tie-breaks: later expiry wins, then
// the larger decision id.
fn sort_members(members: &mut [StoredDecision]) {
    members.sort_by(|a, b| {
        b.kind
            .priority()
            .cmp(&a.kind.priority())
            .then(b.expires_at.cmp(&a.expires_at))
            .then(b.id.cmp(&a.id))
    });
}

/// Result of applying a streamed diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub added: usize,
    pub deleted: usize,
}

/// Index of active decisions over the cache store.
pub struct DecisionIndex {
    store: Arc<CacheStore>,
}

impl DecisionIndex {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Insert or refresh one decision under `key`, returning the entry's
    /// highest-priority kind afterwards. The write is deferred; callers
    /// commit when their batch is complete.
    pub async fn upsert(
        &self,
        key: &str,
        kind: Remediation,
        expires_at: u64,
        id: i64,
    ) -> Result<Remediation> {
        let mut members = self.load_active(key).await?;

        if kind != Remediation::Bypass {
            // A clean marker never coexists with real decisions.
            members.retain(|m| m.kind != Remediation::Bypass);
        } else if members.iter().any(|m| m.kind != Remediation::Bypass) {
            return Ok(members[0].kind);
        }

        members.retain(|m| m.id != id);
        members.push(StoredDecision {
            kind,
            expires_at,
            id,
        });
        sort_members(&mut members);

        self.save(key, &members).await?;
        Ok(members[0].kind)
    }

    /// Remove the member with `id` from `key`. Returns `false` when the
    /// member was not present (a stale delete, which is normal).
    pub async fn remove(&self, key: &str, id: i64) -> Result<bool> {
        let mut members = self.load_active(key).await?;
        let before = members.len();
        members.retain(|m| m.id != id);
        if members.len() == before {
            return Ok(false);
        }

        if members.is_empty() {
            self.store.delete(key).await?;
            if let Some(cidr) = key.strip_prefix("range_") {
                self.catalog_remove(cidr).await?;
            }
        } else {
            sort_members(&mut members);
            self.save(key, &members).await?;
        }
        Ok(true)
    }

    /// Active (unexpired) members of `key`, highest priority first.
    pub async fn load_active(&self, key: &str) -> Result<Vec<StoredDecision>> {
        let now = unix_now();
        match self.store.get(key).await? {
            Some(env) => {
                let mut members: Vec<StoredDecision> = serde_json::from_value(env.payload)
                    .map_err(|e| BouncerError::CacheVersion(format!("entry {key:?}: {e}")))?;
                members.retain(|m| m.expires_at > now);
                sort_members(&mut members);
                Ok(members)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, key: &str, members: &[StoredDecision]) -> Result<()> {
        // An empty sequence is deleted, never stored.
        if members.is_empty() {
            self.store.delete(key).await?;
            return Ok(());
        }
        let entry_ttl = members.iter().map(|m| m.expires_at).max();
        let payload = serde_json::to_value(members)
            .map_err(|e| BouncerError::Storage(format!("entry serialization: {e}")))?;
        self.store
            .put(key, payload, entry_ttl, &[REMEDIATION_TAG])
            .await;

        if let Some(cidr) = key.strip_prefix("range_") {
            self.catalog_add(cidr).await?;
        }
        Ok(())
    }

    /// CIDRs with at least one active ranged decision.
    pub async fn ranges(&self) -> Result<Vec<IpNet>> {
        let listed = self.catalog().await?;
        Ok(listed.iter().filter_map(|c| c.parse().ok()).collect())
    }

    async fn catalog(&self) -> Result<Vec<String>> {
        match self.store.get(RANGE_CATALOG_KEY).await? {
            Some(env) => serde_json::from_value(env.payload)
                .map_err(|e| BouncerError::CacheVersion(format!("range catalog: {e}"))),
            None => Ok(Vec::new()),
        }
    }

    async fn catalog_add(&self, cidr: &str) -> Result<()> {
        let mut listed = self.catalog().await?;
        if !listed.iter().any(|c| c == cidr) {
            listed.push(cidr.to_string());
            self.save_catalog(listed).await?;
        }
        Ok(())
    }

    async fn catalog_remove(&self, cidr: &str) -> Result<()> {
        let mut listed = self.catalog().await?;
        let before = listed.len();
        listed.retain(|c| c != cidr);
        if listed.len() != before {
            self.save_catalog(listed).await?;
        }
        Ok(())
    }

    async fn save_catalog(&self, listed: Vec<String>) -> Result<()> {
        if listed.is_empty() {
            self.store.delete(RANGE_CATALOG_KEY).await?;
            return Ok(());
        }
        let payload = serde_json::to_value(listed)
            .map_err(|e| BouncerError::Storage(format!("range catalog: {e}")))?;
        self.store
            .put(RANGE_CATALOG_KEY, payload, None, &[REMEDIATION_TAG])
            .await;
        Ok(())
    }

    /// Apply a streamed diff: deletes first, then adds. Writes stay
    /// deferred; the synchroniser commits the whole batch.
    pub async fn bulk_apply(
        &self,
        adds: &[Decision],
        deletes: &[Decision],
        fallback: Remediation,
        ttl_cap: Option<u64>,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();

        for decision in deletes {
            match delete_target(decision) {
                Ok((key, id)) => {
                    if self.remove(&key, id).await? {
                        outcome.deleted += 1;
                    } else {
                        debug!(id, key, "stale delete ignored");
                    }
                }
                Err(e) => warn!(error = %e, id = decision.id, "skipping malformed delete"),
            }
        }

        for decision in adds {
            match add_parts(decision, fallback, ttl_cap) {
                Ok(Some((key, kind, expires_at, id))) => {
                    self.upsert(&key, kind, expires_at, id).await?;
                    outcome.added += 1;
                    debug!(
                        id,
                        key,
                        kind = %kind,
                        origin = decision.origin.as_deref().unwrap_or(""),
                        "decision applied"
                    );
                }
                Ok(None) => debug!(id = decision.id, "skipping already-expired decision"),
                Err(e) => warn!(error = %e, id = decision.id, "skipping malformed decision"),
            }
        }

        Ok(outcome)
    }
}

fn delete_target(decision: &Decision) -> Result<(String, i64)> {
    let scope = Scope::parse(&decision.scope)?;
    let value = normalize_value(scope, &decision.value)?;
    Ok((scoped_key(scope, &value), decision.id))
}

/// Key, kind, absolute expiry and id for an incoming decision, or `None`
/// when its remaining duration is already spent.
pub fn add_parts(
    decision: &Decision,
    fallback: Remediation,
    ttl_cap: Option<u64>,
) -> Result<Option<(String, Remediation, u64, i64)>> {
    let scope = Scope::parse(&decision.scope)?;
    let value = normalize_value(scope, &decision.value)?;
    let kind = Remediation::from_wire(&decision.kind, fallback);
    let secs = parse_duration(&decision.duration)?;
    if secs <= 0 {
        return Ok(None);
    }
    let mut ttl = secs as u64;
    if let Some(cap) = ttl_cap {
        ttl = ttl.min(cap);
    }
    Ok(Some((
        scoped_key(scope, &value),
        kind,
        unix_now() + ttl,
        decision.id,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryBackend;

    fn index() -> DecisionIndex {
        DecisionIndex::new(Arc::new(CacheStore::new(Arc::new(InMemoryBackend::new()))))
    }

    fn far() -> u64 {
        unix_now() + 3600
    }

    fn decision(id: i64, kind: &str, scope: &str, value: &str, duration: &str) -> Decision {
        Decision {
            id,
            kind: kind.to_string(),
            scope: scope.to_string(),
            value: value.to_string(),
            duration: duration.to_string(),
            origin: None,
            start_ip: None,
            end_ip: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_returns_highest_kind() {
        let index = index();
        let top = index
            .upsert("ip_1.2.3.4", Remediation::Captcha, far(), 1)
            .await
            .unwrap();
        assert_eq!(top, Remediation::Captcha);
        let top = index
            .upsert("ip_1.2.3.4", Remediation::Ban, far(), 2)
            .await
            .unwrap();
        assert_eq!(top, Remediation::Ban);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let index = index();
        let e = far();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, e, 7)
            .await
            .unwrap();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, e, 7)
            .await
            .unwrap();
        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, 7);
    }

    #[tokio::test]
    async fn test_upsert_same_id_updates_in_place() {
        let index = index();
        index
            .upsert("ip_1.2.3.4", Remediation::Captcha, far(), 7)
            .await
            .unwrap();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, far() + 60, 7)
            .await
            .unwrap();
        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].kind, Remediation::Ban);
    }

    #[tokio::test]
    async fn test_bypass_dropped_when_real_decision_arrives() {
        let index = index();
        index
            .upsert("ip_1.2.3.4", Remediation::Bypass, far(), BYPASS_SENTINEL_ID)
            .await
            .unwrap();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, far(), 3)
            .await
            .unwrap();
        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].kind, Remediation::Ban);
    }

    #[tokio::test]
    async fn test_bypass_not_added_next_to_real_decision() {
        let index = index();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, far(), 3)
            .await
            .unwrap();
        let top = index
            .upsert("ip_1.2.3.4", Remediation::Bypass, far(), BYPASS_SENTINEL_ID)
            .await
            .unwrap();
        assert_eq!(top, Remediation::Ban);
        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_then_remove_again() {
        let index = index();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, far(), 3)
            .await
            .unwrap();
        assert!(index.remove("ip_1.2.3.4", 3).await.unwrap());
        assert!(!index.remove("ip_1.2.3.4", 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_entry_is_deleted_not_stored() {
        let index = index();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, far(), 3)
            .await
            .unwrap();
        index.remove("ip_1.2.3.4", 3).await.unwrap();
        index.store().commit().await.unwrap();
        assert!(!index.store().has("ip_1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_remove_round_trip_restores_state() {
        let index = index();
        index
            .upsert("ip_1.2.3.4", Remediation::Captcha, far(), 1)
            .await
            .unwrap();
        let before = index.load_active("ip_1.2.3.4").await.unwrap();

        index
            .upsert("ip_1.2.3.4", Remediation::Ban, far(), 2)
            .await
            .unwrap();
        index.remove("ip_1.2.3.4", 2).await.unwrap();

        let after = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_tie_break_later_expiry_then_larger_id() {
        let index = index();
        let e = far();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, e, 10)
            .await
            .unwrap();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, e + 100, 5)
            .await
            .unwrap();
        index
            .upsert("ip_1.2.3.4", Remediation::Ban, e, 20)
            .await
            .unwrap();
        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members[0].id, 5); // later expiry first
        assert_eq!(members[1].id, 20); // then larger id
        assert_eq!(members[2].id, 10);
    }

    #[tokio::test]
    async fn test_expired_members_are_filtered() {
        let index = index();
        let members = vec![
            StoredDecision {
                kind: Remediation::Ban,
                expires_at: unix_now() - 10,
                id: 1,
            },
            StoredDecision {
                kind: Remediation::Captcha,
                expires_at: far(),
                id: 2,
            },
        ];
        index
            .store()
            .put(
                "ip_1.2.3.4",
                serde_json::to_value(&members).unwrap(),
                Some(far()),
                &[REMEDIATION_TAG],
            )
            .await;

        let active = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 2);
    }

    #[tokio::test]
    async fn test_range_upsert_updates_catalog() {
        let index = index();
        index
            .upsert("range_10.0.0.0/8", Remediation::Ban, far(), 4)
            .await
            .unwrap();
        let ranges = index.ranges().await.unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].to_string(), "10.0.0.0/8");

        index.remove("range_10.0.0.0/8", 4).await.unwrap();
        assert!(index.ranges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_apply_counts() {
        let index = index();
        let adds = vec![
            decision(1, "ban", "Ip", "1.2.3.4", "4h0m0s"),
            decision(2, "captcha", "Country", "jp", "24h0m0s"),
            decision(3, "ban", "Range", "10.0.0.0/8", "1h0m0s"),
        ];
        let outcome = index
            .bulk_apply(&adds, &[], Remediation::Captcha, None)
            .await
            .unwrap();
        assert_eq!(outcome.added, 3);

        assert_eq!(index.load_active("ip_1.2.3.4").await.unwrap().len(), 1);
        assert_eq!(index.load_active("country_JP").await.unwrap().len(), 1);

        let deletes = vec![decision(1, "ban", "Ip", "1.2.3.4", "4h0m0s")];
        let outcome = index
            .bulk_apply(&[], &deletes, Remediation::Captcha, None)
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 1);

        // Deleting again is stale and ignored.
        let outcome = index
            .bulk_apply(&[], &deletes, Remediation::Captcha, None)
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 0);
    }

    #[tokio::test]
    async fn test_bulk_apply_inverse_diff_restores_state() {
        let index = index();
        let base = vec![decision(1, "ban", "Ip", "9.9.9.9", "4h0m0s")];
        index
            .bulk_apply(&base, &[], Remediation::Captcha, None)
            .await
            .unwrap();
        let before = index.load_active("ip_9.9.9.9").await.unwrap();

        let diff = vec![decision(2, "captcha", "Ip", "9.9.9.9", "1h0m0s")];
        index
            .bulk_apply(&diff, &[], Remediation::Captcha, None)
            .await
            .unwrap();
        index
            .bulk_apply(&[], &diff, Remediation::Captcha, None)
            .await
            .unwrap();

        assert_eq!(index.load_active("ip_9.9.9.9").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_bulk_apply_skips_expired_and_malformed() {
        let index = index();
        let adds = vec![
            decision(1, "ban", "Ip", "1.2.3.4", "-1h0m0s"),
            decision(2, "ban", "Ip", "not-an-ip", "4h0m0s"),
            decision(3, "ban", "Nope", "1.2.3.4", "4h0m0s"),
        ];
        let outcome = index
            .bulk_apply(&adds, &[], Remediation::Captcha, None)
            .await
            .unwrap();
        assert_eq!(outcome.added, 0);
    }

    #[tokio::test]
    async fn test_ttl_cap_limits_live_entries() {
        let d = decision(1, "ban", "Ip", "1.2.3.4", "4h0m0s");
        let (_, _, expires_at, _) = add_parts(&d, Remediation::Captcha, Some(120))
            .unwrap()
            .unwrap();
        assert!(expires_at <= unix_now() + 120);
    }

    #[tokio::test]
    async fn test_unknown_kind_coerced_to_fallback() {
        let d = decision(1, "mfa", "Ip", "1.2.3.4", "4h0m0s");
        let (_, kind, _, _) = add_parts(&d, Remediation::Captcha, None).unwrap().unwrap();
        assert_eq!(kind, Remediation::Captcha);
    }
}
