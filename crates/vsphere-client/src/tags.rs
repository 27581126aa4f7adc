//! Per-session tag and category lookup cache
//!
//! Lookups accept either an id or a name. Hits are kept for ten minutes, and
//! misses are remembered for one minute so a tag created later by the installer
//! is picked up quickly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rest::RestClient;
use crate::types::{Category, MoRef, Tag};

/// Lifetime of a cached hit
pub const HIT_TTL: Duration = Duration::from_secs(600);

/// Lifetime of a cached "verified absent" entry
pub const MISS_TTL: Duration = Duration::from_secs(60);

/// Upper bound on cached lookups per kind
const MAX_ENTRIES: u64 = 10_000;

#[derive(Clone, Debug)]
enum Slot<T> {
    Present(T),
    Absent,
}

/// Hits and misses live for different lengths of time
struct SlotExpiry {
    hit_ttl: Duration,
    miss_ttl: Duration,
}

impl<T> Expiry<String, Slot<T>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Slot<T>,
        _created_at: Instant,
    ) -> Option<Duration> {
        match value {
            Slot::Present(_) => Some(self.hit_ttl),
            Slot::Absent => Some(self.miss_ttl),
        }
    }

    fn expire_after_update(
        &self,
        key: &String,
        value: &Slot<T>,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.expire_after_create(key, value, updated_at)
    }
}

fn slot_cache<T>(hit_ttl: Duration, miss_ttl: Duration) -> Cache<String, Slot<T>>
where
    T: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(MAX_ENTRIES)
        .expire_after(SlotExpiry { hit_ttl, miss_ttl })
        .build()
}

/// Tag manager wrapping a [`RestClient`] with TTL caches
pub struct CachingTagManager {
    rest: Arc<dyn RestClient>,
    tags: Cache<String, Slot<Tag>>,
    categories: Cache<String, Slot<Category>>,
}

impl CachingTagManager {
    /// Create a manager with the default TTLs
    pub fn new(rest: Arc<dyn RestClient>) -> Self {
        Self::with_ttls(rest, HIT_TTL, MISS_TTL)
    }

    /// Create a manager with explicit TTLs
    pub fn with_ttls(rest: Arc<dyn RestClient>, hit_ttl: Duration, miss_ttl: Duration) -> Self {
        Self {
            rest,
            tags: slot_cache(hit_ttl, miss_ttl),
            categories: slot_cache(hit_ttl, miss_ttl),
        }
    }

    /// Resolve a tag by id or name
    pub async fn get_tag(&self, name_or_id: &str) -> Result<Tag> {
        match self.tags.get(name_or_id).await {
            Some(Slot::Present(tag)) => return Ok(tag),
            Some(Slot::Absent) => return Err(Error::not_found("tag", name_or_id)),
            None => {}
        }

        match self.rest.get_tag(name_or_id).await {
            Ok(tag) => {
                self.tags
                    .insert(name_or_id.to_string(), Slot::Present(tag.clone()))
                    .await;
                return Ok(tag);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        for id in self.rest.list_tags().await? {
            let tag = match self.rest.get_tag(&id).await {
                Ok(tag) => tag,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if tag.name == name_or_id {
                self.tags
                    .insert(name_or_id.to_string(), Slot::Present(tag.clone()))
                    .await;
                return Ok(tag);
            }
        }

        debug!(tag = name_or_id, "tag not found, caching absence");
        self.tags.insert(name_or_id.to_string(), Slot::Absent).await;
        Err(Error::not_found("tag", name_or_id))
    }

    /// Resolve a category by id or name
    pub async fn get_category(&self, name_or_id: &str) -> Result<Category> {
        match self.categories.get(name_or_id).await {
            Some(Slot::Present(category)) => return Ok(category),
            Some(Slot::Absent) => return Err(Error::not_found("category", name_or_id)),
            None => {}
        }

        match self.rest.get_category(name_or_id).await {
            Ok(category) => {
                self.categories
                    .insert(name_or_id.to_string(), Slot::Present(category.clone()))
                    .await;
                return Ok(category);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        for id in self.rest.list_categories().await? {
            let category = match self.rest.get_category(&id).await {
                Ok(category) => category,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if category.name == name_or_id {
                self.categories
                    .insert(name_or_id.to_string(), Slot::Present(category.clone()))
                    .await;
                return Ok(category);
            }
        }

        debug!(category = name_or_id, "category not found, caching absence");
        self.categories
            .insert(name_or_id.to_string(), Slot::Absent)
            .await;
        Err(Error::not_found("category", name_or_id))
    }

    /// Attach a tag, given by id or name, to an object
    ///
    /// A 404 for a cached tag drops the cache entry and retries once with a
    /// fresh lookup.
    pub async fn attach_tag(&self, name_or_id: &str, object: &MoRef) -> Result<()> {
        let tag = self.get_tag(name_or_id).await?;
        match self.rest.attach_tag(&tag.id, object).await {
            Err(e) if e.is_not_found() => {
                debug!(tag = name_or_id, "cached tag went away, refetching");
                self.tags.invalidate(name_or_id).await;
                let tag = self.get_tag(name_or_id).await?;
                self.rest.attach_tag(&tag.id, object).await
            }
            other => other,
        }
    }

    /// Ids of the tags attached to an object
    pub async fn list_attached_tags(&self, object: &MoRef) -> Result<Vec<String>> {
        self.rest.list_attached_tags(object).await
    }

    /// Tags attached to an object, resolved through the cache
    pub async fn attached_tags(&self, object: &MoRef) -> Result<Vec<Tag>> {
        let mut tags = Vec::new();
        for id in self.list_attached_tags(object).await? {
            match self.get_tag(&id).await {
                Ok(tag) => tags.push(tag),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(tags)
    }
}
