//! Service Discovery (XEP-0030) registration.
//!
//! Each pub/sub host registers its identity and feature list here on
//! startup and removes it on shutdown. The discovery handler answers
//! service-level disco#info and disco#items queries from this registry.

use dashmap::DashMap;
use jid::BareJid;
use minidom::Element;
use tracing::{debug, info};

use crate::error::ServiceError;
use crate::stanzas::NS_PUBSUB;

/// Service Discovery info namespace (XEP-0030).
pub const DISCO_INFO_NS: &str = "http://jabber.org/protocol/disco#info";

/// Service Discovery items namespace (XEP-0030).
pub const DISCO_ITEMS_NS: &str = "http://jabber.org/protocol/disco#items";

/// Identity element for disco#info responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Category (e.g., "pubsub")
    pub category: String,
    /// Type (e.g., "service", "leaf")
    pub type_: String,
    /// Optional name (human-readable)
    pub name: Option<String>,
}

impl Identity {
    pub fn new(category: &str, type_: &str, name: Option<&str>) -> Self {
        Self {
            category: category.to_string(),
            type_: type_.to_string(),
            name: name.map(|s| s.to_string()),
        }
    }

    /// PubSub service identity (category="pubsub", type="service").
    pub fn pubsub_service(name: Option<&str>) -> Self {
        Self::new("pubsub", "service", name)
    }

    /// PubSub leaf node identity (category="pubsub", type="leaf").
    pub fn pubsub_leaf(name: Option<&str>) -> Self {
        Self::new("pubsub", "leaf", name)
    }

    /// PubSub collection node identity (category="pubsub", type="collection").
    pub fn pubsub_collection(name: Option<&str>) -> Self {
        Self::new("pubsub", "collection", name)
    }
}

/// Feature element for disco#info responses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Feature(pub String);

impl Feature {
    pub fn new(var: &str) -> Self {
        Self(var.to_string())
    }

    /// XEP-0060 PubSub feature
    pub fn pubsub() -> Self {
        Self::new(NS_PUBSUB)
    }

    /// A `http://jabber.org/protocol/pubsub#<name>` feature.
    pub fn pubsub_feature(name: &str) -> Self {
        Self(format!("{NS_PUBSUB}#{name}"))
    }
}

/// Item element for disco#items responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoItem {
    pub jid: String,
    pub name: Option<String>,
    pub node: Option<String>,
}

impl DiscoItem {
    pub fn new(jid: &str, name: Option<&str>, node: Option<&str>) -> Self {
        Self {
            jid: jid.to_string(),
            name: name.map(|s| s.to_string()),
            node: node.map(|s| s.to_string()),
        }
    }
}

/// What a host advertises through service discovery.
#[derive(Debug, Clone)]
pub struct DiscoEntry {
    pub identity: Identity,
    pub features: Vec<Feature>,
    pub items: Vec<DiscoItem>,
}

/// Process-wide registry of discoverable pub/sub hosts.
#[derive(Debug, Default)]
pub struct DiscoRegistry {
    hosts: DashMap<BareJid, DiscoEntry>,
}

impl DiscoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host. A host can only be registered once.
    pub fn register(&self, host: BareJid, entry: DiscoEntry) -> Result<(), ServiceError> {
        use dashmap::mapref::entry::Entry;

        match self.hosts.entry(host) {
            Entry::Occupied(occupied) => {
                Err(ServiceError::AlreadyRegistered(occupied.key().to_string()))
            }
            Entry::Vacant(vacant) => {
                info!(
                    host = %vacant.key(),
                    features = entry.features.len(),
                    "Registered pub/sub service for discovery"
                );
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// Remove a host, returning whether it was registered.
    pub fn unregister(&self, host: &BareJid) -> bool {
        let removed = self.hosts.remove(host).is_some();
        if removed {
            debug!(host = %host, "Unregistered pub/sub service from discovery");
        }
        removed
    }

    pub fn get(&self, host: &BareJid) -> Option<DiscoEntry> {
        self.hosts.get(host).map(|e| e.value().clone())
    }

    pub fn is_registered(&self, host: &BareJid) -> bool {
        self.hosts.contains_key(host)
    }
}

/// Build a disco#info `<query/>` payload.
pub fn build_disco_info_query(
    identities: &[Identity],
    features: &[Feature],
    node: Option<&str>,
) -> Element {
    let mut query_builder = Element::builder("query", DISCO_INFO_NS);

    if let Some(n) = node {
        query_builder = query_builder.attr("node", n);
    }

    for identity in identities {
        let mut id_builder = Element::builder("identity", DISCO_INFO_NS)
            .attr("category", &identity.category)
            .attr("type", &identity.type_);

        if let Some(ref name) = identity.name {
            id_builder = id_builder.attr("name", name);
        }

        query_builder = query_builder.append(id_builder.build());
    }

    for feature in features {
        let feat_elem = Element::builder("feature", DISCO_INFO_NS)
            .attr("var", &feature.0)
            .build();
        query_builder = query_builder.append(feat_elem);
    }

    query_builder.build()
}

/// Build a disco#items `<query/>` payload.
pub fn build_disco_items_query(items: &[DiscoItem], node: Option<&str>) -> Element {
    let mut query_builder = Element::builder("query", DISCO_ITEMS_NS);

    if let Some(n) = node {
        query_builder = query_builder.attr("node", n);
    }

    for item in items {
        let mut item_builder = Element::builder("item", DISCO_ITEMS_NS).attr("jid", &item.jid);

        if let Some(ref name) = item.name {
            item_builder = item_builder.attr("name", name);
        }

        if let Some(ref node) = item.node {
            item_builder = item_builder.attr("node", node);
        }

        query_builder = query_builder.append(item_builder.build());
    }

    query_builder.build()
}
