//! Storage port for pub/sub state.
//!
//! The engine depends only on [`PubSubStorage`]. Backends persist nodes,
//! per-node affiliation and subscription entries, published items, and
//! expose read access to user rosters for presence and roster access checks.
//!
//! [`InMemoryPubSubStorage`] is a complete adapter backed by `DashMap`, used
//! by the server binary and by tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::BareJid;
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::ledger::{UserAffiliation, UserSubscription};
use crate::types::{Affiliation, Subscription};

/// Numeric identifier assigned to a node by storage.
pub type NodeId = i64;

/// Stored description of a node.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    pub node_id: NodeId,
    pub name: String,
    /// Integer node type tag (1 = leaf, 2 = collection).
    pub node_type: i32,
    /// Serialized `pubsub#node_config` form.
    pub config: String,
    pub creator: BareJid,
    pub created_at: DateTime<Utc>,
    pub collection: Option<String>,
}

/// A published item as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub node_id: NodeId,
    pub item_id: String,
    pub publisher: BareJid,
    /// Serialized `<item/>` element.
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's affiliation with a named node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAffiliation {
    pub node: String,
    pub affiliation: Affiliation,
}

/// A user's subscription to a named node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSubscription {
    pub node: String,
    pub subid: String,
    pub subscription: Subscription,
}

/// Presence subscription state of a roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RosterSubscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl RosterSubscription {
    /// Parse a roster subscription, treating unknown values as `none`.
    pub fn parse(s: &str) -> Self {
        match s {
            "to" => RosterSubscription::To,
            "from" => RosterSubscription::From,
            "both" => RosterSubscription::Both,
            _ => RosterSubscription::None,
        }
    }

    /// Whether the contact receives the owner's presence.
    pub fn contact_sees_presence(&self) -> bool {
        matches!(self, RosterSubscription::From | RosterSubscription::Both)
    }
}

impl fmt::Display for RosterSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RosterSubscription::None => "none",
            RosterSubscription::To => "to",
            RosterSubscription::From => "from",
            RosterSubscription::Both => "both",
        };
        write!(f, "{}", s)
    }
}

/// An entry in a user's roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub jid: BareJid,
    pub subscription: RosterSubscription,
    pub groups: Vec<String>,
}

/// Trait for pub/sub storage backends.
#[async_trait]
pub trait PubSubStorage: Send + Sync + 'static {
    /// Persist a new node and return its assigned identifier.
    ///
    /// `owner` is recorded with the `owner` affiliation.
    async fn create_node(
        &self,
        service: &BareJid,
        name: &str,
        owner: &BareJid,
        config: &str,
        node_type: i32,
        collection: Option<&str>,
    ) -> Result<NodeId, StorageError>;

    /// Identifier of a node, if it exists.
    async fn get_node_id(&self, service: &BareJid, name: &str)
        -> Result<Option<NodeId>, StorageError>;

    /// Stored description of a node, if it exists.
    async fn get_node_meta(
        &self,
        service: &BareJid,
        name: &str,
    ) -> Result<Option<NodeMeta>, StorageError>;

    /// Replace the serialized configuration of a node.
    ///
    /// Returns the number of nodes updated.
    async fn update_node_config(
        &self,
        service: &BareJid,
        node_id: NodeId,
        config: &str,
        collection_id: Option<NodeId>,
    ) -> Result<u64, StorageError>;

    /// Upsert one affiliation entry.
    async fn set_node_affiliation(
        &self,
        service: &BareJid,
        node_id: NodeId,
        name: &str,
        affiliation: &UserAffiliation,
    ) -> Result<(), StorageError>;

    /// Upsert one subscription entry.
    async fn set_node_subscription(
        &self,
        service: &BareJid,
        node_id: NodeId,
        name: &str,
        subscription: &UserSubscription,
    ) -> Result<(), StorageError>;

    async fn get_node_affiliations(
        &self,
        service: &BareJid,
        node_id: NodeId,
    ) -> Result<Vec<UserAffiliation>, StorageError>;

    async fn get_node_subscriptions(
        &self,
        service: &BareJid,
        node_id: NodeId,
    ) -> Result<Vec<UserSubscription>, StorageError>;

    /// Remove a node with its ledgers and items.
    async fn delete_node(&self, service: &BareJid, node_id: NodeId) -> Result<(), StorageError>;

    /// Names of nodes whose `collection` is the given node.
    async fn get_child_nodes(
        &self,
        service: &BareJid,
        collection: &str,
    ) -> Result<Vec<String>, StorageError>;

    /// Every subscription a user holds on a service.
    async fn get_user_subscriptions(
        &self,
        service: &BareJid,
        user: &BareJid,
    ) -> Result<Vec<NodeSubscription>, StorageError>;

    /// Every affiliation a user holds on a service.
    async fn get_user_affiliations(
        &self,
        service: &BareJid,
        user: &BareJid,
    ) -> Result<Vec<NodeAffiliation>, StorageError>;

    async fn get_item(
        &self,
        node_id: NodeId,
        item_id: &str,
    ) -> Result<Option<StoredItem>, StorageError>;

    /// Most recently updated items first, at most `limit` when non-zero.
    async fn query_items(
        &self,
        node_id: NodeId,
        limit: usize,
    ) -> Result<Vec<StoredItem>, StorageError>;

    /// Insert or replace an item. Replacing keeps the creation date.
    async fn write_item(
        &self,
        node_id: NodeId,
        item_id: &str,
        publisher: &BareJid,
        data: &str,
    ) -> Result<(), StorageError>;

    /// Delete an item, returning whether it existed.
    async fn delete_item(&self, node_id: NodeId, item_id: &str) -> Result<bool, StorageError>;

    /// Ids of every item of a node, most recent first.
    async fn get_item_ids(&self, node_id: NodeId) -> Result<Vec<String>, StorageError>;

    /// Roster of a user.
    async fn get_user_roster(&self, owner: &BareJid) -> Result<Vec<RosterItem>, StorageError>;
}

#[derive(Debug, Clone)]
struct NodeRecord {
    meta: NodeMeta,
    affiliations: HashMap<BareJid, Affiliation>,
    subscriptions: HashMap<BareJid, (String, Subscription)>,
}

#[derive(Debug, Clone)]
struct ItemRecord {
    item: StoredItem,
    seq: u64,
}

/// In-memory pub/sub storage.
#[derive(Debug, Default)]
pub struct InMemoryPubSubStorage {
    nodes: DashMap<(BareJid, String), NodeRecord>,
    items: DashMap<NodeId, HashMap<String, ItemRecord>>,
    rosters: DashMap<BareJid, Vec<RosterItem>>,
    next_node_id: AtomicI64,
    next_seq: AtomicU64,
    fail_writes: AtomicBool,
}

impl InMemoryPubSubStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a roster entry for `owner`.
    ///
    /// `groups` is a `;`-separated list of group names.
    pub fn add_roster_item(
        &self,
        owner: &BareJid,
        contact: &BareJid,
        subscription: RosterSubscription,
        groups: &str,
    ) {
        let groups = groups
            .split(';')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(String::from)
            .collect();

        let mut roster = self.rosters.entry(owner.clone()).or_default();
        roster.retain(|item| &item.jid != contact);
        roster.push(RosterItem {
            jid: contact.clone(),
            subscription,
            groups,
        });
    }

    /// Make every subsequent write fail with a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("storage is read-only".to_string()));
        }
        Ok(())
    }

    fn key_for(&self, service: &BareJid, node_id: NodeId) -> Option<(BareJid, String)> {
        self.nodes
            .iter()
            .find(|entry| &entry.key().0 == service && entry.meta.node_id == node_id)
            .map(|entry| entry.key().clone())
    }
}

#[async_trait]
impl PubSubStorage for InMemoryPubSubStorage {
    #[instrument(skip(self, config), fields(service = %service, node = %name))]
    async fn create_node(
        &self,
        service: &BareJid,
        name: &str,
        owner: &BareJid,
        config: &str,
        node_type: i32,
        collection: Option<&str>,
    ) -> Result<NodeId, StorageError> {
        self.check_writable()?;

        let vacant = match self.nodes.entry((service.clone(), name.to_string())) {
            Entry::Occupied(_) => return Err(StorageError::NodeExists(name.to_string())),
            Entry::Vacant(vacant) => vacant,
        };

        let node_id = self.next_node_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut affiliations = HashMap::new();
        affiliations.insert(owner.clone(), Affiliation::Owner);

        vacant.insert(
            NodeRecord {
                meta: NodeMeta {
                    node_id,
                    name: name.to_string(),
                    node_type,
                    config: config.to_string(),
                    creator: owner.clone(),
                    created_at: Utc::now(),
                    collection: collection.map(String::from),
                },
                affiliations,
                subscriptions: HashMap::new(),
            },
        );

        debug!(node_id, "Node stored");
        Ok(node_id)
    }

    async fn get_node_id(
        &self,
        service: &BareJid,
        name: &str,
    ) -> Result<Option<NodeId>, StorageError> {
        Ok(self
            .nodes
            .get(&(service.clone(), name.to_string()))
            .map(|record| record.meta.node_id))
    }

    async fn get_node_meta(
        &self,
        service: &BareJid,
        name: &str,
    ) -> Result<Option<NodeMeta>, StorageError> {
        Ok(self
            .nodes
            .get(&(service.clone(), name.to_string()))
            .map(|record| record.meta.clone()))
    }

    async fn update_node_config(
        &self,
        service: &BareJid,
        node_id: NodeId,
        config: &str,
        collection_id: Option<NodeId>,
    ) -> Result<u64, StorageError> {
        self.check_writable()?;

        let collection = match collection_id {
            Some(id) => self
                .nodes
                .iter()
                .find(|entry| &entry.key().0 == service && entry.meta.node_id == id)
                .map(|entry| entry.meta.name.clone()),
            None => None,
        };

        let Some(key) = self.key_for(service, node_id) else {
            return Ok(0);
        };
        match self.nodes.get_mut(&key) {
            Some(mut record) => {
                record.meta.config = config.to_string();
                if collection.is_some() {
                    record.meta.collection = collection;
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn set_node_affiliation(
        &self,
        service: &BareJid,
        node_id: NodeId,
        name: &str,
        affiliation: &UserAffiliation,
    ) -> Result<(), StorageError> {
        self.check_writable()?;

        let mut record = self
            .nodes
            .get_mut(&(service.clone(), name.to_string()))
            .filter(|r| r.meta.node_id == node_id)
            .ok_or_else(|| StorageError::NodeNotFound(name.to_string()))?;
        record
            .affiliations
            .insert(affiliation.jid.clone(), affiliation.affiliation);
        Ok(())
    }

    async fn set_node_subscription(
        &self,
        service: &BareJid,
        node_id: NodeId,
        name: &str,
        subscription: &UserSubscription,
    ) -> Result<(), StorageError> {
        self.check_writable()?;

        let mut record = self
            .nodes
            .get_mut(&(service.clone(), name.to_string()))
            .filter(|r| r.meta.node_id == node_id)
            .ok_or_else(|| StorageError::NodeNotFound(name.to_string()))?;
        record.subscriptions.insert(
            subscription.jid.clone(),
            (subscription.subid.clone(), subscription.subscription),
        );
        Ok(())
    }

    async fn get_node_affiliations(
        &self,
        service: &BareJid,
        node_id: NodeId,
    ) -> Result<Vec<UserAffiliation>, StorageError> {
        let key = self
            .key_for(service, node_id)
            .ok_or_else(|| StorageError::NodeNotFound(node_id.to_string()))?;
        Ok(self
            .nodes
            .get(&key)
            .map(|record| {
                record
                    .affiliations
                    .iter()
                    .map(|(jid, affiliation)| UserAffiliation {
                        jid: jid.clone(),
                        affiliation: *affiliation,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_node_subscriptions(
        &self,
        service: &BareJid,
        node_id: NodeId,
    ) -> Result<Vec<UserSubscription>, StorageError> {
        let key = self
            .key_for(service, node_id)
            .ok_or_else(|| StorageError::NodeNotFound(node_id.to_string()))?;
        Ok(self
            .nodes
            .get(&key)
            .map(|record| {
                record
                    .subscriptions
                    .iter()
                    .map(|(jid, (subid, subscription))| UserSubscription {
                        jid: jid.clone(),
                        subid: subid.clone(),
                        subscription: *subscription,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    #[instrument(skip(self), fields(service = %service))]
    async fn delete_node(&self, service: &BareJid, node_id: NodeId) -> Result<(), StorageError> {
        self.check_writable()?;

        let key = self
            .key_for(service, node_id)
            .ok_or_else(|| StorageError::NodeNotFound(node_id.to_string()))?;
        self.nodes.remove(&key);
        self.items.remove(&node_id);
        debug!(node = %key.1, "Node removed from storage");
        Ok(())
    }

    async fn get_child_nodes(
        &self,
        service: &BareJid,
        collection: &str,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .nodes
            .iter()
            .filter(|entry| {
                &entry.key().0 == service && entry.meta.collection.as_deref() == Some(collection)
            })
            .map(|entry| entry.meta.name.clone())
            .collect())
    }

    async fn get_user_subscriptions(
        &self,
        service: &BareJid,
        user: &BareJid,
    ) -> Result<Vec<NodeSubscription>, StorageError> {
        let mut subscriptions: Vec<NodeSubscription> = self
            .nodes
            .iter()
            .filter(|entry| &entry.key().0 == service)
            .filter_map(|entry| {
                entry
                    .subscriptions
                    .get(user)
                    .map(|(subid, subscription)| NodeSubscription {
                        node: entry.meta.name.clone(),
                        subid: subid.clone(),
                        subscription: *subscription,
                    })
            })
            .collect();
        subscriptions.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(subscriptions)
    }

    async fn get_user_affiliations(
        &self,
        service: &BareJid,
        user: &BareJid,
    ) -> Result<Vec<NodeAffiliation>, StorageError> {
        let mut affiliations: Vec<NodeAffiliation> = self
            .nodes
            .iter()
            .filter(|entry| &entry.key().0 == service)
            .filter_map(|entry| {
                entry.affiliations.get(user).map(|affiliation| NodeAffiliation {
                    node: entry.meta.name.clone(),
                    affiliation: *affiliation,
                })
            })
            .collect();
        affiliations.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(affiliations)
    }

    async fn get_item(
        &self,
        node_id: NodeId,
        item_id: &str,
    ) -> Result<Option<StoredItem>, StorageError> {
        Ok(self
            .items
            .get(&node_id)
            .and_then(|items| items.get(item_id).map(|record| record.item.clone())))
    }

    async fn query_items(
        &self,
        node_id: NodeId,
        limit: usize,
    ) -> Result<Vec<StoredItem>, StorageError> {
        let Some(items) = self.items.get(&node_id) else {
            return Ok(Vec::new());
        };

        let mut records: Vec<&ItemRecord> = items.values().collect();
        records.sort_by(|a, b| b.seq.cmp(&a.seq));
        if limit > 0 {
            records.truncate(limit);
        }
        Ok(records.into_iter().map(|r| r.item.clone()).collect())
    }

    async fn write_item(
        &self,
        node_id: NodeId,
        item_id: &str,
        publisher: &BareJid,
        data: &str,
    ) -> Result<(), StorageError> {
        self.check_writable()?;

        let now = Utc::now();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut items = self.items.entry(node_id).or_default();

        match items.get_mut(item_id) {
            Some(existing) => {
                existing.item.publisher = publisher.clone();
                existing.item.data = data.to_string();
                existing.item.updated_at = now;
                existing.seq = seq;
            }
            None => {
                items.insert(
                    item_id.to_string(),
                    ItemRecord {
                        item: StoredItem {
                            node_id,
                            item_id: item_id.to_string(),
                            publisher: publisher.clone(),
                            data: data.to_string(),
                            created_at: now,
                            updated_at: now,
                        },
                        seq,
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_item(&self, node_id: NodeId, item_id: &str) -> Result<bool, StorageError> {
        self.check_writable()?;

        Ok(self
            .items
            .get_mut(&node_id)
            .map(|mut items| items.remove(item_id).is_some())
            .unwrap_or(false))
    }

    async fn get_item_ids(&self, node_id: NodeId) -> Result<Vec<String>, StorageError> {
        Ok(self
            .query_items(node_id, 0)
            .await?
            .into_iter()
            .map(|item| item.item_id)
            .collect())
    }

    async fn get_user_roster(&self, owner: &BareJid) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self
            .rosters
            .get(owner)
            .map(|roster| roster.value().clone())
            .unwrap_or_default())
    }
}
