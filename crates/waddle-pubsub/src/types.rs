//! Affiliations and subscription states.
//!
//! Each affiliation carries a fixed set of privileges and a weight that
//! totally orders the affiliations from `outcast` to `owner`.

use std::fmt;
use std::str::FromStr;

/// Affiliation of an entity with a node (XEP-0060 Section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affiliation {
    Owner,
    Admin,
    Member,
    /// No affiliation; the implied value when a ledger has no entry.
    #[default]
    None,
    /// Banned from the node.
    Outcast,
}

/// Privilege bits of an affiliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Privileges {
    pub subscribe: bool,
    pub retrieve_items: bool,
    pub publish_items: bool,
    pub delete_items: bool,
    pub configure_node: bool,
    pub delete_node: bool,
    pub purge_node: bool,
}

impl Affiliation {
    /// Every affiliation, from highest weight to lowest.
    pub const ALL: [Affiliation; 5] = [
        Affiliation::Owner,
        Affiliation::Admin,
        Affiliation::Member,
        Affiliation::None,
        Affiliation::Outcast,
    ];

    /// Total-order weight: outcast=0 < none=1 < member=2 < admin=3 < owner=4.
    pub fn weight(&self) -> u8 {
        match self {
            Affiliation::Owner => 4,
            Affiliation::Admin => 3,
            Affiliation::Member => 2,
            Affiliation::None => 1,
            Affiliation::Outcast => 0,
        }
    }

    pub fn privileges(&self) -> Privileges {
        match self {
            Affiliation::Owner => Privileges {
                subscribe: true,
                retrieve_items: true,
                publish_items: true,
                delete_items: true,
                configure_node: true,
                delete_node: true,
                purge_node: true,
            },
            Affiliation::Admin => Privileges {
                subscribe: true,
                retrieve_items: true,
                publish_items: true,
                delete_items: true,
                configure_node: false,
                delete_node: false,
                purge_node: false,
            },
            Affiliation::Member => Privileges {
                subscribe: true,
                retrieve_items: true,
                publish_items: false,
                delete_items: false,
                configure_node: false,
                delete_node: false,
                purge_node: false,
            },
            Affiliation::None => Privileges {
                subscribe: true,
                retrieve_items: false,
                publish_items: false,
                delete_items: false,
                configure_node: false,
                delete_node: false,
                purge_node: false,
            },
            Affiliation::Outcast => Privileges {
                subscribe: false,
                retrieve_items: false,
                publish_items: false,
                delete_items: false,
                configure_node: false,
                delete_node: false,
                purge_node: false,
            },
        }
    }

    pub fn can_subscribe(&self) -> bool {
        self.privileges().subscribe
    }

    pub fn can_retrieve_items(&self) -> bool {
        self.privileges().retrieve_items
    }

    pub fn can_publish(&self) -> bool {
        self.privileges().publish_items
    }

    pub fn can_delete_items(&self) -> bool {
        self.privileges().delete_items
    }

    pub fn can_configure(&self) -> bool {
        self.privileges().configure_node
    }

    pub fn can_delete_node(&self) -> bool {
        self.privileges().delete_node
    }

    pub fn can_purge(&self) -> bool {
        self.privileges().purge_node
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Owner => "owner",
            Affiliation::Admin => "admin",
            Affiliation::Member => "member",
            Affiliation::None => "none",
            Affiliation::Outcast => "outcast",
        }
    }

    /// The higher-weighted of two affiliations.
    pub fn max_weight(self, other: Affiliation) -> Affiliation {
        if other.weight() > self.weight() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown affiliation or subscription value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown value: {0}")]
pub struct UnknownValue(pub String);

impl FromStr for Affiliation {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Affiliation::Owner),
            "admin" => Ok(Affiliation::Admin),
            "member" => Ok(Affiliation::Member),
            "none" => Ok(Affiliation::None),
            "outcast" => Ok(Affiliation::Outcast),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

/// State of an entity's subscription to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Subscription {
    #[default]
    None,
    /// Waiting for owner approval.
    Pending,
    Subscribed,
    /// Requires configuration before it becomes active.
    Unconfigured,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::Pending => "pending",
            Subscription::Subscribed => "subscribed",
            Subscription::Unconfigured => "unconfigured",
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Subscription {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Subscription::None),
            "pending" => Ok(Subscription::Pending),
            "subscribed" => Ok(Subscription::Subscribed),
            "unconfigured" => Ok(Subscription::Unconfigured),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}
