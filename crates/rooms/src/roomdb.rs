//! Narrow interfaces to the room's persistent stores.
//!
//! The server only ever reads members, aliases, the privacy mode and the
//! deny list through these traits. The in-memory implementations back the
//! binary and the tests.

use crate::config::PrivacyMode;
use async_trait::async_trait;
use dashmap::DashMap;
use room_common::FeedRef;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors raised by the stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// No such record.
    #[error("not found")]
    NotFound,
    /// The alias name is registered to someone already.
    #[error("alias is already taken")]
    AliasTaken,
    /// Storage failure.
    #[error("storage error: {0}")]
    Backend(String),
}

/// Permissions of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Regular member.
    Member,
    /// May moderate.
    Moderator,
    /// Full control.
    Admin,
}

/// A stored member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Row id.
    pub id: i64,
    /// Member feed.
    pub feed: FeedRef,
    /// Role of the member.
    pub role: Role,
}

/// A stored alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    /// Row id.
    pub id: i64,
    /// Alias name.
    pub name: String,
    /// Feed the alias points to.
    pub feed: FeedRef,
    /// Registration signature by `feed`.
    pub signature: [u8; 64],
}

/// Members directory.
#[async_trait]
pub trait MembersService: Send + Sync {
    /// Look up a member by feed.
    async fn get_by_feed(&self, feed: &FeedRef) -> Result<Member, DbError>;
    /// All members, ordered by id.
    async fn list(&self) -> Result<Vec<Member>, DbError>;
}

/// Aliases directory.
#[async_trait]
pub trait AliasesService: Send + Sync {
    /// Look up an alias by name.
    async fn resolve(&self, name: &str) -> Result<Alias, DbError>;
    /// Store a new alias. Fails with [`DbError::AliasTaken`] if the name exists.
    async fn register(&self, name: &str, feed: FeedRef, signature: [u8; 64]) -> Result<(), DbError>;
    /// Delete an alias by name.
    async fn revoke(&self, name: &str) -> Result<(), DbError>;
    /// Aliases registered to `feed`.
    async fn list_for(&self, feed: &FeedRef) -> Result<Vec<Alias>, DbError>;
}

/// Room configuration store.
#[async_trait]
pub trait RoomConfig: Send + Sync {
    /// Current privacy mode.
    async fn privacy_mode(&self) -> Result<PrivacyMode, DbError>;
}

/// Keys refused at the door.
#[async_trait]
pub trait DeniedKeys: Send + Sync {
    /// Whether `feed` is denied.
    async fn has_feed(&self, feed: &FeedRef) -> bool;
}

/// All stores the server consults.
#[derive(Clone)]
pub struct RoomDb {
    /// Members directory.
    pub members: Arc<dyn MembersService>,
    /// Aliases directory.
    pub aliases: Arc<dyn AliasesService>,
    /// Room configuration.
    pub config: Arc<dyn RoomConfig>,
    /// Deny list.
    pub denied: Arc<dyn DeniedKeys>,
}

impl RoomDb {
    /// Stores that live only in memory.
    #[must_use]
    pub fn in_memory(mode: PrivacyMode) -> (Self, MemoryStores) {
        let stores = MemoryStores {
            members: Arc::new(MemoryMembers::default()),
            aliases: Arc::new(MemoryAliases::default()),
            config: Arc::new(MemoryConfig::new(mode)),
            denied: Arc::new(MemoryDenied::default()),
        };
        let db = Self {
            members: stores.members.clone(),
            aliases: stores.aliases.clone(),
            config: stores.config.clone(),
            denied: stores.denied.clone(),
        };
        (db, stores)
    }

    /// Whether `feed` is a member of any role.
    pub async fn is_member(&self, feed: &FeedRef) -> Result<bool, DbError> {
        match self.members.get_by_feed(feed).await {
            Ok(_) => Ok(true),
            Err(DbError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Concrete handles to the in-memory stores, for seeding.
#[derive(Clone)]
pub struct MemoryStores {
    /// Members.
    pub members: Arc<MemoryMembers>,
    /// Aliases.
    pub aliases: Arc<MemoryAliases>,
    /// Privacy mode.
    pub config: Arc<MemoryConfig>,
    /// Deny list.
    pub denied: Arc<MemoryDenied>,
}

/// In-memory [`MembersService`].
#[derive(Debug, Default)]
pub struct MemoryMembers {
    by_feed: DashMap<FeedRef, Member>,
    next_id: std::sync::atomic::AtomicI64,
}

impl MemoryMembers {
    /// Add or update a member; returns its id.
    pub fn add(&self, feed: FeedRef, role: Role) -> i64 {
        if let Some(mut existing) = self.by_feed.get_mut(&feed) {
            existing.role = role;
            return existing.id;
        }
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        self.by_feed.insert(feed, Member { id, feed, role });
        id
    }

    /// Remove a member. Returns whether it existed.
    pub fn remove(&self, feed: &FeedRef) -> bool {
        self.by_feed.remove(feed).is_some()
    }
}

#[async_trait]
impl MembersService for MemoryMembers {
    async fn get_by_feed(&self, feed: &FeedRef) -> Result<Member, DbError> {
        self.by_feed
            .get(feed)
            .map(|m| m.value().clone())
            .ok_or(DbError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Member>, DbError> {
        let mut all: Vec<Member> = self.by_feed.iter().map(|m| m.value().clone()).collect();
        all.sort_by_key(|m| m.id);
        Ok(all)
    }
}

/// In-memory [`AliasesService`].
#[derive(Debug, Default)]
pub struct MemoryAliases {
    by_name: DashMap<String, Alias>,
    next_id: std::sync::atomic::AtomicI64,
}

#[async_trait]
impl AliasesService for MemoryAliases {
    async fn resolve(&self, name: &str) -> Result<Alias, DbError> {
        self.by_name
            .get(name)
            .map(|a| a.value().clone())
            .ok_or(DbError::NotFound)
    }

    async fn register(&self, name: &str, feed: FeedRef, signature: [u8; 64]) -> Result<(), DbError> {
        match self.by_name.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DbError::AliasTaken),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let id = self
                    .next_id
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                slot.insert(Alias {
                    id,
                    name: name.to_string(),
                    feed,
                    signature,
                });
                Ok(())
            }
        }
    }

    async fn revoke(&self, name: &str) -> Result<(), DbError> {
        self.by_name
            .remove(name)
            .map(|_| ())
            .ok_or(DbError::NotFound)
    }

    async fn list_for(&self, feed: &FeedRef) -> Result<Vec<Alias>, DbError> {
        let mut found: Vec<Alias> = self
            .by_name
            .iter()
            .filter(|a| a.feed == *feed)
            .map(|a| a.value().clone())
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

/// In-memory [`RoomConfig`].
#[derive(Debug)]
pub struct MemoryConfig {
    mode: RwLock<PrivacyMode>,
}

impl MemoryConfig {
    /// Start in `mode`.
    #[must_use]
    pub fn new(mode: PrivacyMode) -> Self {
        Self {
            mode: RwLock::new(mode),
        }
    }

    /// Change the privacy mode.
    pub fn set_privacy_mode(&self, mode: PrivacyMode) {
        let mut guard = self
            .mode
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = mode;
    }
}

#[async_trait]
impl RoomConfig for MemoryConfig {
    async fn privacy_mode(&self) -> Result<PrivacyMode, DbError> {
        let guard = self
            .mode
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(*guard)
    }
}

/// In-memory [`DeniedKeys`].
#[derive(Debug, Default)]
pub struct MemoryDenied {
    feeds: DashMap<FeedRef, ()>,
}

impl MemoryDenied {
    /// Deny `feed`.
    pub fn add(&self, feed: FeedRef) {
        self.feeds.insert(feed, ());
    }
}

#[async_trait]
impl DeniedKeys for MemoryDenied {
    async fn has_feed(&self, feed: &FeedRef) -> bool {
        self.feeds.contains_key(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(n: u8) -> FeedRef {
        FeedRef::ed25519([n; 32])
    }

    #[tokio::test]
    async fn members_keep_insertion_order() {
        let (db, stores) = RoomDb::in_memory(PrivacyMode::Open);
        stores.members.add(feed(3), Role::Member);
        stores.members.add(feed(1), Role::Admin);
        let listed: Vec<FeedRef> = db
            .members
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.feed)
            .collect();
        assert_eq!(listed, vec![feed(3), feed(1)]);
        assert!(db.is_member(&feed(1)).await.unwrap());
        assert!(!db.is_member(&feed(2)).await.unwrap());
    }

    #[tokio::test]
    async fn re_adding_member_updates_role() {
        let members = MemoryMembers::default();
        let id = members.add(feed(1), Role::Member);
        assert_eq!(members.add(feed(1), Role::Moderator), id);
        assert_eq!(
            members.get_by_feed(&feed(1)).await.unwrap().role,
            Role::Moderator
        );
    }

    #[tokio::test]
    async fn alias_names_are_unique() {
        let aliases = MemoryAliases::default();
        aliases.register("bob", feed(1), [0u8; 64]).await.unwrap();
        assert_eq!(
            aliases.register("bob", feed(2), [0u8; 64]).await,
            Err(DbError::AliasTaken)
        );
        assert_eq!(aliases.resolve("bob").await.unwrap().feed, feed(1));
        aliases.revoke("bob").await.unwrap();
        assert_eq!(aliases.resolve("bob").await, Err(DbError::NotFound));
        assert_eq!(aliases.revoke("bob").await, Err(DbError::NotFound));
    }

    #[tokio::test]
    async fn aliases_listed_per_feed() {
        let aliases = MemoryAliases::default();
        aliases.register("zed", feed(1), [0u8; 64]).await.unwrap();
        aliases.register("amy", feed(1), [0u8; 64]).await.unwrap();
        aliases.register("bob", feed(2), [0u8; 64]).await.unwrap();
        let names: Vec<String> = aliases
            .list_for(&feed(1))
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["amy", "zed"]);
    }

    #[tokio::test]
    async fn privacy_mode_can_change() {
        let config = MemoryConfig::new(PrivacyMode::Open);
        config.set_privacy_mode(PrivacyMode::Restricted);
        assert_eq!(config.privacy_mode().await.unwrap(), PrivacyMode::Restricted);
    }
}
