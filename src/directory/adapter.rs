//! Directory adapter used by the pool manager
//!
//! Wraps a [`DirectoryStore`] with the key namespace, this server's address
//! and the retry policy. All pointer/set bookkeeping goes through here so the
//! `BOT-*` and `SERVER-*` records stay inverse views of each other.

use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{DirectoryKeys, DirectoryStore, SetOp};
use crate::retry::RetryPolicy;
use crate::types::{BotDefinition, BotIdentity, PoolError, Result};

/// Placement directory as seen from one server instance
#[derive(Clone)]
pub struct Directory {
    store: Arc<dyn DirectoryStore>,
    server_addr: String,
    retry: RetryPolicy,
}

impl Directory {
    pub fn new(store: Arc<dyn DirectoryStore>, server_addr: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            store,
            server_addr: server_addr.into(),
            retry,
        }
    }

    /// Address this server publishes itself under
    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn store(&self) -> &Arc<dyn DirectoryStore> {
        &self.store
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let store = &self.store;
        self.retry.run(key, move || store.get(key)).await
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let store = &self.store;
        self.retry
            .run(key, move || store.set(key, value.clone()))
            .await
    }

    async fn swap(&self, key: &str, value: Bytes) -> Result<Option<Bytes>> {
        let store = &self.store;
        self.retry
            .run(key, move || store.swap(key, value.clone()))
            .await
    }

    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let store = &self.store;
        self.retry
            .run(key, move || store.delete_if_eq(key, expected))
            .await
    }

    async fn members(&self, key: &str) -> Result<BTreeSet<String>> {
        let store = &self.store;
        self.retry.run(key, move || store.members(key)).await
    }

    async fn update_set(&self, key: &str, op: SetOp) -> Result<()> {
        let store = &self.store;
        self.retry
            .run(key, move || store.update_set(key, op.clone()))
            .await
    }

    /// Look up the definition cache
    pub async fn cached_definition(&self, identity: &BotIdentity) -> Result<Option<BotDefinition>> {
        let key = DirectoryKeys::definition(identity);
        Ok(self
            .get(&key)
            .await?
            .filter(|raw| !raw.is_empty())
            .map(BotDefinition::new))
    }

    /// Store a definition in the cache
    pub async fn cache_definition(&self, identity: &BotIdentity, definition: &BotDefinition) -> Result<()> {
        let key = DirectoryKeys::definition(identity);
        self.set(&key, definition.to_bytes()).await
    }

    /// Server currently recorded as running this bot
    pub async fn owner_of(&self, identity: &BotIdentity) -> Result<Option<String>> {
        let key = DirectoryKeys::owner(identity);
        Ok(self
            .get(&key)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Identities recorded as running on `address`
    pub async fn bots_on(&self, address: &str) -> Result<BTreeSet<BotIdentity>> {
        let key = DirectoryKeys::server(address);
        Ok(self
            .members(&key)
            .await?
            .into_iter()
            .map(BotIdentity::from)
            .collect())
    }

    /// Announce this server with an empty bot set.
    ///
    /// Bots listed from a previous run under the same address are stale:
    /// their pointers are removed when they still point here. A set record
    /// that does not decode is overwritten. Returns the identities that were
    /// reclaimed.
    pub async fn register_server(&self) -> Result<Vec<BotIdentity>> {
        let stale = match self.bots_on(&self.server_addr).await {
            Ok(stale) => stale,
            Err(PoolError::MalformedRecord(e)) => {
                warn!(addr = %self.server_addr, "Resetting undecodable server record: {}", e);
                BTreeSet::new()
            }
            Err(e) => return Err(e),
        };
        let mut reclaimed = Vec::with_capacity(stale.len());

        for identity in stale {
            let owner_key = DirectoryKeys::owner(&identity);
            if self
                .delete_if_eq(&owner_key, self.server_addr.as_bytes())
                .await?
            {
                debug!(identity = %identity, "Removed stale ownership pointer");
            }
            reclaimed.push(identity);
        }

        self.update_set(&DirectoryKeys::server(&self.server_addr), SetOp::Clear)
            .await?;

        info!(
            addr = %self.server_addr,
            stale = reclaimed.len(),
            "Registered server in directory"
        );
        Ok(reclaimed)
    }

    /// Record this server as the owner of `identity`.
    ///
    /// The pointer write returns the owner it replaced, which then loses the
    /// identity from its set. If adding to our own set fails, the pointer is
    /// rolled back before the error surfaces. If another instance took the
    /// pointer while we were adding ourselves, we leave our set again: the
    /// local worker keeps serving, like any owner that was taken over.
    pub async fn publish_ownership(&self, identity: &BotIdentity) -> Result<()> {
        let owner_key = DirectoryKeys::owner(identity);
        let own_set = DirectoryKeys::server(&self.server_addr);
        let previous = self
            .swap(&owner_key, Bytes::from(self.server_addr.clone()))
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());

        if let Err(e) = self
            .update_set(&own_set, SetOp::Insert(identity.to_string()))
            .await
        {
            if let Err(rollback) = self
                .delete_if_eq(&owner_key, self.server_addr.as_bytes())
                .await
            {
                warn!(identity = %identity, "Failed to roll back ownership pointer: {}", rollback);
            }
            return Err(e);
        }

        if let Some(previous) = previous.filter(|p| p != &self.server_addr) {
            info!(
                identity = %identity,
                previous = %previous,
                "Taking over bot from another instance"
            );
            if let Err(e) = self
                .update_set(
                    &DirectoryKeys::server(&previous),
                    SetOp::Remove(identity.to_string()),
                )
                .await
            {
                warn!(
                    identity = %identity,
                    previous = %previous,
                    "Failed to remove bot from previous owner's set: {}", e
                );
            }
        }

        // A concurrent publish may have replaced the pointer before our set
        // insert landed; its removal from our set could then have run first.
        let current = self.owner_of(identity).await?;
        if current.as_deref() != Some(self.server_addr.as_str()) {
            info!(
                identity = %identity,
                owner = current.as_deref().unwrap_or("-"),
                "Lost ownership race, leaving own set"
            );
            self.update_set(&own_set, SetOp::Remove(identity.to_string()))
                .await?;
            return Ok(());
        }

        debug!(identity = %identity, addr = %self.server_addr, "Bot set in directory");
        Ok(())
    }

    /// Remove this server's ownership of `identity`.
    ///
    /// The pointer is only deleted while it still names this server, so a
    /// newer owner's record survives.
    pub async fn withdraw_ownership(&self, identity: &BotIdentity) -> Result<()> {
        let owner_key = DirectoryKeys::owner(identity);
        self.delete_if_eq(&owner_key, self.server_addr.as_bytes())
            .await?;
        self.update_set(
            &DirectoryKeys::server(&self.server_addr),
            SetOp::Remove(identity.to_string()),
        )
        .await?;

        debug!(identity = %identity, addr = %self.server_addr, "Removed bot from directory");
        Ok(())
    }
}
