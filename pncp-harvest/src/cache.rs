//! Tiered verdict cache
//!
//! Three tiers keyed by increasingly specific subjects: organization,
//! tender, sub-record. An organization-level hit with high confidence is
//! a strong prior (many tenders from the same issuer share relevance) and
//! lets later stages skip network calls entirely.
//!
//! Entries expire after a TTL so issuers whose procurement focus drifts
//! get re-evaluated; expired entries read as misses and are only dropped
//! when a snapshot is written. The cache is an injected service with an
//! explicit load/checkpoint lifecycle, shared across stage tasks behind
//! `Arc`.

use chrono::{DateTime, Duration, Utc};
use pncp_common::models::{Verdict, VerdictSource};
use pncp_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

/// What a cache key refers to, from broadest to most specific
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Organization,
    Tender,
    Item,
}

/// A cached relevance verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub verdict: Verdict,
    /// 0-100
    pub confidence: u8,
    pub source: VerdictSource,
    pub recorded_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(verdict: Verdict, confidence: u8, source: VerdictSource) -> Self {
        Self {
            verdict,
            confidence: confidence.min(100),
            source,
            recorded_at: Utc::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.recorded_at < ttl
    }
}

/// Known-relevant issuing organizations, seeded before first use.
/// CNPJ roots (first 8 digits) of major federal health bodies and
/// university hospitals.
const SEED_ORGANIZATIONS: &[(&str, &str)] = &[
    ("26989715", "Ministério da Saúde"),
    ("00394544", "ANVISA"),
    ("33781055", "Fiocruz"),
    ("46374500", "Hospital das Clínicas - USP"),
    ("46392130", "UNIFESP - Hospital São Paulo"),
    ("42498717", "Hospital Universitário UFRJ"),
    ("28481581", "INCA"),
];

const SEED_CONFIDENCE: u8 = 95;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    organizations: HashMap<String, CacheEntry>,
    tenders: HashMap<String, CacheEntry>,
    items: HashMap<String, CacheEntry>,
}

pub struct TieredCache {
    inner: RwLock<Snapshot>,
    ttl: Duration,
}

/// Counts per tier (freshness not considered)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub organizations: usize,
    pub tenders: usize,
    pub items: usize,
}

impl TieredCache {
    pub fn new(ttl_days: i64) -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                version: 1,
                ..Snapshot::default()
            }),
            ttl: Duration::days(ttl_days),
        }
    }

    /// Load a snapshot from disk. A missing file starts empty; an
    /// unreadable one is logged and also starts empty rather than failing
    /// the run.
    pub fn load(path: &Path, ttl_days: i64) -> Self {
        let cache = Self::new(ttl_days);

        if !path.exists() {
            info!("No cache snapshot at {} - starting empty", path.display());
            return cache;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) => {
                    info!(
                        organizations = snapshot.organizations.len(),
                        tenders = snapshot.tenders.len(),
                        items = snapshot.items.len(),
                        "Loaded verdict cache from {}",
                        path.display()
                    );
                    *cache.inner.write().expect("cache lock poisoned") = snapshot;
                }
                Err(e) => {
                    warn!("Cache snapshot {} unreadable ({}) - starting empty", path.display(), e);
                }
            },
            Err(e) => {
                warn!("Cache snapshot {} unreadable ({}) - starting empty", path.display(), e);
            }
        }

        cache
    }

    /// Write the snapshot, dropping entries that have expired
    pub fn checkpoint(&self, path: &Path) -> Result<()> {
        let now = Utc::now();
        let serialized = {
            let inner = self.inner.read().expect("cache lock poisoned");
            let pruned = Snapshot {
                version: inner.version,
                organizations: prune(&inner.organizations, self.ttl, now),
                tenders: prune(&inner.tenders, self.ttl, now),
                items: prune(&inner.items, self.ttl, now),
            };
            serde_json::to_string_pretty(&pruned)
                .map_err(|e| Error::Snapshot(e.to_string()))?
        };

        std::fs::write(path, serialized)?;
        info!("Verdict cache checkpointed to {}", path.display());
        Ok(())
    }

    /// Seed well-known relevant organizations that are not yet cached
    pub fn seed_known_organizations(&self) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        let mut added = 0;
        for (cnpj_root, _name) in SEED_ORGANIZATIONS {
            inner
                .organizations
                .entry((*cnpj_root).to_string())
                .or_insert_with(|| {
                    added += 1;
                    CacheEntry::new(Verdict::Relevant, SEED_CONFIDENCE, VerdictSource::OrgHistory)
                });
        }
        if added > 0 {
            info!(added, "Seeded known-relevant organizations");
        }
    }

    /// Fresh entry for a subject, or `None` (miss or expired)
    pub fn lookup(&self, kind: SubjectKind, id: &str) -> Option<CacheEntry> {
        let now = Utc::now();
        let inner = self.inner.read().expect("cache lock poisoned");
        let entry = tier(&inner, kind).get(id)?;
        if entry.is_fresh(self.ttl, now) {
            return Some(entry.clone());
        }
        None
    }

    /// Organization lookup that also honors seed roots: a full CNPJ hits
    /// when either the exact id or its 8-digit root is cached.
    pub fn organization_verdict(&self, cnpj: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.lookup(SubjectKind::Organization, cnpj) {
            return Some(entry);
        }
        if cnpj.len() > 8 {
            return self.lookup(SubjectKind::Organization, &cnpj[..8]);
        }
        None
    }

    pub fn record(&self, kind: SubjectKind, id: impl Into<String>, entry: CacheEntry) {
        let mut inner = self.inner.write().expect("cache lock poisoned");
        tier_mut(&mut inner, kind).insert(id.into(), entry);
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().expect("cache lock poisoned");
        CacheStats {
            organizations: inner.organizations.len(),
            tenders: inner.tenders.len(),
            items: inner.items.len(),
        }
    }
}

fn tier<'a>(snapshot: &'a Snapshot, kind: SubjectKind) -> &'a HashMap<String, CacheEntry> {
    match kind {
        SubjectKind::Organization => &snapshot.organizations,
        SubjectKind::Tender => &snapshot.tenders,
        SubjectKind::Item => &snapshot.items,
    }
}

fn tier_mut<'a>(snapshot: &'a mut Snapshot, kind: SubjectKind) -> &'a mut HashMap<String, CacheEntry> {
    match kind {
        SubjectKind::Organization => &mut snapshot.organizations,
        SubjectKind::Tender => &mut snapshot.tenders,
        SubjectKind::Item => &mut snapshot.items,
    }
}

fn prune(
    entries: &HashMap<String, CacheEntry>,
    ttl: Duration,
    now: DateTime<Utc>,
) -> HashMap<String, CacheEntry> {
    entries
        .iter()
        .filter(|(_, entry)| entry.is_fresh(ttl, now))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
