//! Cached node repository.
//!
//! Nodes are loaded from [`PubSubStorage`] on first access and kept in a
//! process-wide cache keyed by (service bare JID, node name). Concurrent
//! misses for the same key are collapsed behind a per-key async mutex so a
//! node is loaded from storage at most once.
//!
//! Ledgers are write-back: handlers mutate a node's affiliations or
//! subscriptions in memory, then call [`PubSubRepository::update_affiliations`]
//! or [`PubSubRepository::update_subscriptions`] to persist the changed
//! entries.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::BareJid;
use minidom::Element;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::RepositoryError;
use crate::form::{DataForm, FormField};
use crate::ledger::{NodeAffiliations, NodeSubscriptions, UserAffiliation};
use crate::node::{NodeConfig, NodeType, DEFAULT_MAX_ITEMS, FIELD_NODE_TYPE};
use crate::storage::{
    NodeAffiliation, NodeId, NodeMeta, NodeSubscription, PubSubStorage, RosterItem, StoredItem,
};
use crate::types::Affiliation;

type NodeKey = (BareJid, String);

/// A cached pub/sub node.
#[derive(Debug)]
pub struct Node {
    service: BareJid,
    name: String,
    node_id: NodeId,
    creator: BareJid,
    created_at: DateTime<Utc>,
    collection: Option<String>,
    config: RwLock<NodeConfig>,
    affiliations: NodeAffiliations,
    subscriptions: NodeSubscriptions,
    deleted: AtomicBool,
}

impl Node {
    fn from_meta(service: BareJid, meta: NodeMeta, config: NodeConfig) -> Self {
        Self {
            service,
            name: meta.name,
            node_id: meta.node_id,
            creator: meta.creator,
            created_at: meta.created_at,
            collection: meta.collection,
            config: RwLock::new(config),
            affiliations: NodeAffiliations::new(),
            subscriptions: NodeSubscriptions::new(),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &BareJid {
        &self.service
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn creator(&self) -> &BareJid {
        &self.creator
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> NodeConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kind(&self) -> NodeType {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .kind()
    }

    pub fn affiliations(&self) -> &NodeAffiliations {
        &self.affiliations
    }

    pub fn subscriptions(&self) -> &NodeSubscriptions {
        &self.subscriptions
    }

    /// Whether this instance was deleted and evicted from the cache.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    fn set_config(&self, config: NodeConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    fn ensure_live(&self) -> Result<(), RepositoryError> {
        if self.is_deleted() {
            return Err(RepositoryError::NodeDeleted(self.name.clone()));
        }
        Ok(())
    }
}

/// Serialize a configuration form for storage.
fn serialize_config(config: &NodeConfig) -> String {
    String::from(&config.form().to_element())
}

fn deserialize_form(raw: &str) -> Result<DataForm, RepositoryError> {
    let element: Element = raw
        .parse()
        .map_err(|e| RepositoryError::InvalidConfig(format!("{e}")))?;
    DataForm::from_element(&element)
        .ok_or_else(|| RepositoryError::InvalidConfig("not a data form".to_string()))
}

/// Cached repository of pub/sub nodes shared by every service.
pub struct PubSubRepository {
    storage: Arc<dyn PubSubStorage>,
    cache: DashMap<NodeKey, Arc<Node>>,
    loading: DashMap<NodeKey, Arc<Mutex<()>>>,
    default_max_items: usize,
}

impl PubSubRepository {
    pub fn new(storage: Arc<dyn PubSubStorage>) -> Self {
        Self::with_max_items(storage, DEFAULT_MAX_ITEMS)
    }

    /// Create a repository whose item queries default to `default_max_items`.
    pub fn with_max_items(storage: Arc<dyn PubSubStorage>, default_max_items: usize) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
            loading: DashMap::new(),
            default_max_items,
        }
    }

    pub fn storage(&self) -> &Arc<dyn PubSubStorage> {
        &self.storage
    }

    /// Number of cached nodes.
    pub fn cached_nodes(&self) -> usize {
        self.cache.len()
    }

    /// Resolve a node, loading it from storage on a cache miss.
    #[instrument(skip(self), fields(service = %service, node = %name))]
    pub async fn get_node(
        &self,
        service: &BareJid,
        name: &str,
    ) -> Result<Option<Arc<Node>>, RepositoryError> {
        let key = (service.clone(), name.to_string());
        if let Some(node) = self.cache.get(&key) {
            return Ok(Some(node.value().clone()));
        }

        let gate = self
            .loading
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = gate.lock().await;

        // Another task may have finished loading while we waited.
        if let Some(node) = self.cache.get(&key) {
            return Ok(Some(node.value().clone()));
        }

        let loaded = self.load_node(service, name).await;
        if let Ok(Some(ref node)) = loaded {
            self.cache.insert(key.clone(), node.clone());
            debug!("Node loaded into cache");
        }
        self.loading.remove(&key);
        loaded
    }

    async fn load_node(
        &self,
        service: &BareJid,
        name: &str,
    ) -> Result<Option<Arc<Node>>, RepositoryError> {
        let Some(meta) = self.storage.get_node_meta(service, name).await? else {
            return Ok(None);
        };

        let form = deserialize_form(&meta.config)?;
        let config = if form.value(FIELD_NODE_TYPE).is_some() {
            NodeConfig::from_form(&form)
        } else {
            let mut config = NodeConfig::for_type(NodeType::from_storage_code(meta.node_type));
            config.merge_from(&form);
            config
        };

        let affiliations = self
            .storage
            .get_node_affiliations(service, meta.node_id)
            .await?;
        let subscriptions = self
            .storage
            .get_node_subscriptions(service, meta.node_id)
            .await?;

        let node = Node::from_meta(service.clone(), meta, config);
        node.affiliations.load(affiliations);
        node.subscriptions.load(subscriptions);
        Ok(Some(Arc::new(node)))
    }

    /// Persist a new node and cache it.
    ///
    /// The caller checks that the node does not exist yet. Storage records
    /// `owner` as the node's first owner.
    #[instrument(skip(self, config), fields(service = %service, node = %name, owner = %owner))]
    pub async fn create_node(
        &self,
        service: &BareJid,
        name: &str,
        owner: &BareJid,
        config: NodeConfig,
        collection: Option<&str>,
    ) -> Result<Arc<Node>, RepositoryError> {
        let kind = config.kind();
        self.storage
            .create_node(
                service,
                name,
                owner,
                &serialize_config(&config),
                kind.storage_code(),
                collection,
            )
            .await?;

        let node_id = self
            .storage
            .get_node_id(service, name)
            .await?
            .ok_or(RepositoryError::CreateFailed)?;

        let meta = NodeMeta {
            node_id,
            name: name.to_string(),
            node_type: kind.storage_code(),
            config: String::new(),
            creator: owner.clone(),
            created_at: Utc::now(),
            collection: collection.map(String::from),
        };
        let node = Arc::new(Node::from_meta(service.clone(), meta, config));
        node.affiliations.load([UserAffiliation {
            jid: owner.clone(),
            affiliation: Affiliation::Owner,
        }]);

        self.cache
            .insert((service.clone(), name.to_string()), node.clone());
        info!(node_id, "Pub/sub node created");
        Ok(node)
    }

    /// Delete a node from storage, evict it, and mark the instance deleted.
    #[instrument(skip(self, node), fields(service = %node.service, node = %node.name))]
    pub async fn delete_node(&self, node: &Node) -> Result<(), RepositoryError> {
        node.ensure_live()?;

        self.storage.delete_node(&node.service, node.node_id).await?;
        self.cache
            .remove(&(node.service.clone(), node.name.clone()));
        node.deleted.store(true, Ordering::SeqCst);

        info!("Pub/sub node deleted");
        Ok(())
    }

    /// Merge submitted field values into the node configuration and persist.
    ///
    /// The live configuration is replaced only after storage accepts it.
    #[instrument(skip(self, node, overlay), fields(service = %node.service, node = %node.name))]
    pub async fn update_node_config(
        &self,
        node: &Node,
        overlay: &DataForm,
    ) -> Result<NodeConfig, RepositoryError> {
        node.ensure_live()?;

        let mut merged = node.config();
        merged.merge_from(overlay);

        self.storage
            .update_node_config(&node.service, node.node_id, &serialize_config(&merged), None)
            .await?;
        node.set_config(merged.clone());

        debug!("Node configuration updated");
        Ok(merged)
    }

    /// Replace a single configuration field and persist.
    pub async fn set_config_field(
        &self,
        node: &Node,
        field: FormField,
    ) -> Result<NodeConfig, RepositoryError> {
        let mut overlay = DataForm::default();
        overlay.add_field(field);
        self.update_node_config(node, &overlay).await
    }

    fn check_owned(&self, node: &Node) -> Result<(), RepositoryError> {
        node.ensure_live()?;
        let key = (node.service.clone(), node.name.clone());
        match self.cache.get(&key) {
            Some(cached) if ptr::eq(Arc::as_ptr(cached.value()), node) => Ok(()),
            _ => Err(RepositoryError::LedgerMismatch(node.name.clone())),
        }
    }

    /// Persist the changed entries of a node's affiliation ledger.
    ///
    /// `ledger` must be the ledger owned by the cached `node`.
    #[instrument(skip(self, node, ledger), fields(service = %node.service, node = %node.name))]
    pub async fn update_affiliations(
        &self,
        node: &Node,
        ledger: &NodeAffiliations,
    ) -> Result<(), RepositoryError> {
        self.check_owned(node)?;
        if !ptr::eq(&node.affiliations, ledger) {
            return Err(RepositoryError::LedgerMismatch(node.name.clone()));
        }
        if !ledger.needs_writing() {
            return Ok(());
        }

        for changed in ledger.changed() {
            self.storage
                .set_node_affiliation(&node.service, node.node_id, &node.name, &changed)
                .await?;
        }
        ledger.mark_saved();
        Ok(())
    }

    /// Persist the changed entries of a node's subscription ledger.
    ///
    /// `ledger` must be the ledger owned by the cached `node`.
    #[instrument(skip(self, node, ledger), fields(service = %node.service, node = %node.name))]
    pub async fn update_subscriptions(
        &self,
        node: &Node,
        ledger: &NodeSubscriptions,
    ) -> Result<(), RepositoryError> {
        self.check_owned(node)?;
        if !ptr::eq(&node.subscriptions, ledger) {
            return Err(RepositoryError::LedgerMismatch(node.name.clone()));
        }
        if !ledger.needs_writing() {
            return Ok(());
        }

        for changed in ledger.changed() {
            self.storage
                .set_node_subscription(&node.service, node.node_id, &node.name, &changed)
                .await?;
        }
        ledger.mark_saved();
        Ok(())
    }

    pub async fn write_item(
        &self,
        node: &Node,
        item_id: &str,
        publisher: &BareJid,
        data: &str,
    ) -> Result<(), RepositoryError> {
        node.ensure_live()?;
        self.storage
            .write_item(node.node_id, item_id, publisher, data)
            .await?;
        Ok(())
    }

    /// Delete one item, returning whether it existed.
    pub async fn delete_item(&self, node: &Node, item_id: &str) -> Result<bool, RepositoryError> {
        node.ensure_live()?;
        Ok(self.storage.delete_item(node.node_id, item_id).await?)
    }

    pub async fn get_item(
        &self,
        node: &Node,
        item_id: &str,
    ) -> Result<Option<StoredItem>, RepositoryError> {
        node.ensure_live()?;
        Ok(self.storage.get_item(node.node_id, item_id).await?)
    }

    /// Most recent items, bounded by `max_items` or the repository default.
    pub async fn query_items(
        &self,
        node: &Node,
        max_items: Option<usize>,
    ) -> Result<Vec<StoredItem>, RepositoryError> {
        node.ensure_live()?;
        let limit = max_items
            .filter(|m| *m > 0)
            .unwrap_or(self.default_max_items);
        Ok(self.storage.query_items(node.node_id, limit).await?)
    }

    pub async fn get_item_ids(&self, node: &Node) -> Result<Vec<String>, RepositoryError> {
        node.ensure_live()?;
        Ok(self.storage.get_item_ids(node.node_id).await?)
    }

    /// Delete every item of a node.
    pub async fn purge_items(&self, node: &Node) -> Result<usize, RepositoryError> {
        let ids = self.get_item_ids(node).await?;
        let mut deleted = 0;
        for id in &ids {
            if self.storage.delete_item(node.node_id, id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Names of nodes in a collection.
    pub async fn get_child_nodes(
        &self,
        service: &BareJid,
        collection: &str,
    ) -> Result<Vec<String>, RepositoryError> {
        Ok(self.storage.get_child_nodes(service, collection).await?)
    }

    /// Every affiliation a user holds on a service, read from storage.
    pub async fn get_user_affiliations(
        &self,
        service: &BareJid,
        user: &BareJid,
    ) -> Result<Vec<NodeAffiliation>, RepositoryError> {
        Ok(self.storage.get_user_affiliations(service, user).await?)
    }

    /// Every subscription a user holds on a service, read from storage.
    pub async fn get_user_subscriptions(
        &self,
        service: &BareJid,
        user: &BareJid,
    ) -> Result<Vec<NodeSubscription>, RepositoryError> {
        Ok(self.storage.get_user_subscriptions(service, user).await?)
    }

    pub async fn get_user_roster(&self, owner: &BareJid) -> Result<Vec<RosterItem>, RepositoryError> {
        match self.storage.get_user_roster(owner).await {
            Ok(roster) => Ok(roster),
            Err(e) => {
                warn!(owner = %owner, error = %e, "Failed to load roster");
                Err(e.into())
            }
        }
    }
}
