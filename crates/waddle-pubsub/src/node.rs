//! PubSub node configuration.
//!
//! Defines node types, access and publish models, and [`NodeConfig`]: the
//! `pubsub#node_config` form that drives node behavior.

use std::fmt;

use crate::form::{parse_boolean, DataForm, FormField, FormType};
use crate::stanzas::NS_PUBSUB_NODE_CONFIG;

/// Items kept per node when `pubsub#max_items` is unset or invalid.
pub const DEFAULT_MAX_ITEMS: usize = 10;

pub const FIELD_NODE_TYPE: &str = "pubsub#node_type";
pub const FIELD_TITLE: &str = "pubsub#title";
pub const FIELD_DELIVER_PAYLOADS: &str = "pubsub#deliver_payloads";
pub const FIELD_NOTIFY_CONFIG: &str = "pubsub#notify_config";
pub const FIELD_NOTIFY_DELETE: &str = "pubsub#notify_delete";
pub const FIELD_NOTIFY_RETRACT: &str = "pubsub#notify_retract";
pub const FIELD_PERSIST_ITEMS: &str = "pubsub#persist_items";
pub const FIELD_MAX_ITEMS: &str = "pubsub#max_items";
pub const FIELD_SUBSCRIBE: &str = "pubsub#subscribe";
pub const FIELD_COLLECTION: &str = "pubsub#collection";
pub const FIELD_ACCESS_MODEL: &str = "pubsub#access_model";
pub const FIELD_PUBLISH_MODEL: &str = "pubsub#publish_model";
pub const FIELD_SEND_LAST_PUBLISHED_ITEM: &str = "pubsub#send_last_published_item";
pub const FIELD_DOMAINS: &str = "pubsub#domains";
pub const FIELD_PRESENCE_BASED_DELIVERY: &str = "pubsub#presence_based_delivery";
pub const FIELD_PRESENCE_EXPIRED: &str = "pubsub#presence_expired";
pub const FIELD_EMBEDDED_BODY_XSLT: &str = "pubsub#embedded_body_xslt";
pub const FIELD_BODY_XSLT: &str = "pubsub#body_xslt";
pub const FIELD_ROSTER_GROUPS_ALLOWED: &str = "pubsub#roster_groups_allowed";
pub const FIELD_NOTIFY_SUB_AFF_STATE: &str = "pubsub#notify_sub_aff_state";
pub const FIELD_CHILDREN: &str = "pubsub#children";

/// Kind of node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeType {
    /// Holds published items.
    #[default]
    Leaf,
    /// Holds other nodes. Accepted in forms, rejected by every handler.
    Collection,
}

impl NodeType {
    /// Parse a node type from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "leaf" => Some(NodeType::Leaf),
            "collection" => Some(NodeType::Collection),
            _ => None,
        }
    }

    /// Integer tag used by storage backends.
    pub fn storage_code(&self) -> i32 {
        match self {
            NodeType::Leaf => 1,
            NodeType::Collection => 2,
        }
    }

    pub fn from_storage_code(code: i32) -> Self {
        if code == 2 {
            NodeType::Collection
        } else {
            NodeType::Leaf
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Leaf => "leaf",
            NodeType::Collection => "collection",
        };
        write!(f, "{}", s)
    }
}

/// Access model for a PubSub node.
///
/// Determines who can subscribe to and retrieve items from the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessModel {
    /// Subscription requests must be approved by an owner.
    Authorize,
    /// Anyone can subscribe and retrieve items.
    #[default]
    Open,
    /// Only entities with a presence subscription to an owner can access.
    Presence,
    /// Only entities in allowed roster groups of an owner can access.
    Roster,
    /// Only entities an owner has affiliated can access.
    Whitelist,
}

impl AccessModel {
    /// Parse an access model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "authorize" => Some(AccessModel::Authorize),
            "open" => Some(AccessModel::Open),
            "presence" => Some(AccessModel::Presence),
            "roster" => Some(AccessModel::Roster),
            "whitelist" => Some(AccessModel::Whitelist),
            _ => None,
        }
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessModel::Authorize => "authorize",
            AccessModel::Open => "open",
            AccessModel::Presence => "presence",
            AccessModel::Roster => "roster",
            AccessModel::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

/// Publish model for a PubSub node.
///
/// Determines who can publish to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishModel {
    /// Only affiliations with the publish privilege can publish.
    #[default]
    Publishers,
    /// Subscribers can publish.
    Subscribers,
    /// Anyone can publish.
    Open,
}

impl PublishModel {
    /// Parse a publish model from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(PublishModel::Publishers),
            "subscribers" => Some(PublishModel::Subscribers),
            "open" => Some(PublishModel::Open),
            _ => None,
        }
    }
}

impl fmt::Display for PublishModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PublishModel::Publishers => "publishers",
            PublishModel::Subscribers => "subscribers",
            PublishModel::Open => "open",
        };
        write!(f, "{}", s)
    }
}

/// When to send the last published item to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendLastPublishedItem {
    /// Never send last item automatically.
    Never,
    /// Send on subscription only.
    #[default]
    OnSub,
    /// Send on subscription and when contact comes online.
    OnSubAndPresence,
}

impl SendLastPublishedItem {
    /// Parse from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "never" => Some(SendLastPublishedItem::Never),
            "on_sub" => Some(SendLastPublishedItem::OnSub),
            "on_sub_and_presence" => Some(SendLastPublishedItem::OnSubAndPresence),
            _ => None,
        }
    }
}

impl fmt::Display for SendLastPublishedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendLastPublishedItem::Never => "never",
            SendLastPublishedItem::OnSub => "on_sub",
            SendLastPublishedItem::OnSubAndPresence => "on_sub_and_presence",
        };
        write!(f, "{}", s)
    }
}

/// Configuration for a PubSub node.
///
/// The `kind` tag selects which fields the default form carries; every
/// option lives in the form itself, one value set per field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    kind: NodeType,
    form: DataForm,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::leaf()
    }
}

impl NodeConfig {
    /// Default configuration of a leaf node.
    pub fn leaf() -> Self {
        Self {
            kind: NodeType::Leaf,
            form: default_form(),
        }
    }

    /// Default configuration of a collection node, with `pubsub#children`.
    pub fn collection() -> Self {
        let mut form = default_form();
        form.add_field(FormField::text_multi(FIELD_CHILDREN, "", &[""]));
        Self {
            kind: NodeType::Collection,
            form,
        }
    }

    /// Default configuration for the requested node type.
    pub fn for_type(kind: NodeType) -> Self {
        match kind {
            NodeType::Leaf => Self::leaf(),
            NodeType::Collection => Self::collection(),
        }
    }

    /// Restore a configuration from a stored form.
    ///
    /// Starts from the defaults of the form's node type and overlays the
    /// stored values, so fields missing from older forms keep their defaults.
    pub fn from_form(stored: &DataForm) -> Self {
        let kind = stored
            .value(FIELD_NODE_TYPE)
            .and_then(NodeType::from_str)
            .unwrap_or_default();
        let mut config = Self::for_type(kind);
        config.merge_from(stored);
        config
    }

    pub fn kind(&self) -> NodeType {
        self.kind
    }

    pub fn form(&self) -> &DataForm {
        &self.form
    }

    /// Replace a single field.
    pub fn set_field(&mut self, field: FormField) {
        self.form.add_field(field);
    }

    /// Copy every submitted field value over the current form.
    ///
    /// `FORM_TYPE` is never overwritten. Field metadata (type, label,
    /// options) is kept from the current form when the field exists.
    pub fn merge_from(&mut self, overlay: &DataForm) {
        for field in overlay.fields() {
            if field.var == "FORM_TYPE" {
                continue;
            }
            self.form.set_values(&field.var, field.values.clone());
        }
        if let Some(kind) = self.form.value(FIELD_NODE_TYPE).and_then(NodeType::from_str) {
            self.kind = kind;
        }
    }

    /// Form to embed in a configuration reply.
    pub fn to_form(&self) -> DataForm {
        let mut form = self.form.clone();
        form.form_type = FormType::Form;
        form
    }

    /// The configured access model, `None` when the value is unknown.
    pub fn access_model(&self) -> Option<AccessModel> {
        self.form.value(FIELD_ACCESS_MODEL).and_then(AccessModel::from_str)
    }

    /// The configured publish model, `None` when the value is unknown.
    pub fn publish_model(&self) -> Option<PublishModel> {
        self.form.value(FIELD_PUBLISH_MODEL).and_then(PublishModel::from_str)
    }

    pub fn send_last_published_item(&self) -> SendLastPublishedItem {
        self.form
            .value(FIELD_SEND_LAST_PUBLISHED_ITEM)
            .and_then(SendLastPublishedItem::from_str)
            .unwrap_or_default()
    }

    pub fn persist_items(&self) -> bool {
        self.bool_field(FIELD_PERSIST_ITEMS)
    }

    /// `pubsub#max_items`, 0 when unset or not a number.
    pub fn max_items(&self) -> usize {
        self.form
            .value(FIELD_MAX_ITEMS)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn deliver_payloads(&self) -> bool {
        self.bool_field(FIELD_DELIVER_PAYLOADS)
    }

    pub fn notify_config(&self) -> bool {
        self.bool_field(FIELD_NOTIFY_CONFIG)
    }

    pub fn notify_delete(&self) -> bool {
        self.bool_field(FIELD_NOTIFY_DELETE)
    }

    pub fn notify_retract(&self) -> bool {
        self.bool_field(FIELD_NOTIFY_RETRACT)
    }

    pub fn subscribe_allowed(&self) -> bool {
        self.bool_field(FIELD_SUBSCRIBE)
    }

    pub fn presence_based_delivery(&self) -> bool {
        self.bool_field(FIELD_PRESENCE_BASED_DELIVERY)
    }

    pub fn title(&self) -> Option<&str> {
        self.form.value(FIELD_TITLE).filter(|t| !t.is_empty())
    }

    /// Allowed roster groups with blank entries removed.
    pub fn roster_groups_allowed(&self) -> Vec<String> {
        self.form
            .values(FIELD_ROSTER_GROUPS_ALLOWED)
            .into_iter()
            .filter(|g| !g.trim().is_empty())
            .collect()
    }

    /// Child node names of a collection.
    pub fn children(&self) -> Vec<String> {
        self.form
            .values(FIELD_CHILDREN)
            .into_iter()
            .filter(|c| !c.is_empty())
            .collect()
    }

    fn bool_field(&self, var: &str) -> bool {
        self.form.value(var).map(parse_boolean).unwrap_or(false)
    }
}

fn default_form() -> DataForm {
    let mut form = DataForm::new(FormType::Form);

    form.add_field(FormField::hidden("FORM_TYPE", NS_PUBSUB_NODE_CONFIG));
    form.add_field(FormField::list_single(
        FIELD_NODE_TYPE,
        "",
        "leaf",
        &["leaf", "collection"],
    ));
    form.add_field(FormField::text_single(
        FIELD_TITLE,
        "A friendly name for the node",
        "",
    ));
    form.add_field(FormField::boolean(
        FIELD_DELIVER_PAYLOADS,
        "Whether to deliver payloads with event notifications",
        true,
    ));
    form.add_field(FormField::boolean(
        FIELD_NOTIFY_CONFIG,
        "Notify subscribers when the node configuration changes",
        false,
    ));
    form.add_field(FormField::boolean(
        FIELD_NOTIFY_DELETE,
        "Notify subscribers when the node is deleted",
        false,
    ));
    form.add_field(FormField::boolean(
        FIELD_NOTIFY_RETRACT,
        "Notify subscribers when items are removed from the node",
        false,
    ));
    form.add_field(FormField::boolean(
        FIELD_PERSIST_ITEMS,
        "Persist items to storage",
        true,
    ));
    form.add_field(FormField::text_single(
        FIELD_MAX_ITEMS,
        "Max # of items to persist",
        &DEFAULT_MAX_ITEMS.to_string(),
    ));
    form.add_field(FormField::boolean(
        FIELD_SUBSCRIBE,
        "Whether to allow subscriptions",
        true,
    ));
    form.add_field(FormField::text_single(
        FIELD_COLLECTION,
        "The collection with which a node is affiliated",
        "",
    ));
    form.add_field(FormField::list_single(
        FIELD_ACCESS_MODEL,
        "Specify the subscriber model",
        "open",
        &["authorize", "open", "presence", "roster", "whitelist"],
    ));
    form.add_field(FormField::list_single(
        FIELD_PUBLISH_MODEL,
        "Specify the publisher model",
        "publishers",
        &["publishers", "subscribers", "open"],
    ));
    form.add_field(FormField::list_single(
        FIELD_SEND_LAST_PUBLISHED_ITEM,
        "When to send the last published item",
        "on_sub",
        &["never", "on_sub", "on_sub_and_presence"],
    ));
    form.add_field(FormField::text_multi(
        FIELD_DOMAINS,
        "The domains allowed to access this node (blank for any)",
        &[],
    ));
    form.add_field(FormField::boolean(
        FIELD_PRESENCE_BASED_DELIVERY,
        "Whether to deliver notifications to available users only",
        false,
    ));
    form.add_field(FormField::boolean(
        FIELD_PRESENCE_EXPIRED,
        "Whether the subscription expires when the subscriber goes offline",
        false,
    ));
    form.add_field(FormField::text_multi(
        FIELD_EMBEDDED_BODY_XSLT,
        "The XSL transformation applied to payloads to generate a message body",
        &[],
    ));
    form.add_field(FormField::text_single(
        FIELD_BODY_XSLT,
        "The URL of an XSL transformation applied to payloads to generate a message body",
        "",
    ));
    form.add_field(FormField::text_multi(
        FIELD_ROSTER_GROUPS_ALLOWED,
        "Roster groups allowed to subscribe",
        &[],
    ));
    form.add_field(FormField::boolean(
        FIELD_NOTIFY_SUB_AFF_STATE,
        "Notify subscribers when the owner changes their subscription or affiliation state",
        false,
    ));

    form
}
