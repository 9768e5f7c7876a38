//! Per-node affiliation and subscription ledgers.
//!
//! Both ledgers keep a single map of entries, each flagged dirty when
//! mutated. The repository persists [`NodeAffiliations::changed`] (or the
//! subscription equivalent) and then calls `mark_saved` to clear the flags.
//!
//! A node's ledger can be touched by stanzas processed concurrently for the
//! same node, so every access goes through an internal `RwLock`. Ledger reads
//! never fail: a poisoned lock is recovered rather than reported.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jid::BareJid;

use crate::stanzas::generate_id;
use crate::types::{Affiliation, Subscription};

/// An affiliation held by a user on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAffiliation {
    pub jid: BareJid,
    pub affiliation: Affiliation,
}

/// A subscription held by a user on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSubscription {
    pub jid: BareJid,
    pub subid: String,
    pub subscription: Subscription,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    dirty: bool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Affiliations of every user with one node.
#[derive(Debug, Default)]
pub struct NodeAffiliations {
    entries: RwLock<HashMap<BareJid, Entry<Affiliation>>>,
}

impl NodeAffiliations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from storage. Loaded entries start clean.
    pub fn load(&self, affiliations: impl IntoIterator<Item = UserAffiliation>) {
        let mut entries = write(&self.entries);
        for ua in affiliations {
            entries.insert(
                ua.jid,
                Entry {
                    value: ua.affiliation,
                    dirty: false,
                },
            );
        }
    }

    /// The user's affiliation, `none` when absent.
    pub fn get(&self, jid: &BareJid) -> Affiliation {
        read(&self.entries)
            .get(jid)
            .map(|e| e.value)
            .unwrap_or_default()
    }

    /// Record an affiliation, replacing any existing entry.
    pub fn add(&self, jid: BareJid, affiliation: Affiliation) {
        write(&self.entries).insert(
            jid,
            Entry {
                value: affiliation,
                dirty: true,
            },
        );
    }

    /// Update an affiliation; an absent entry is created with the new value.
    pub fn change(&self, jid: &BareJid, affiliation: Affiliation) {
        let mut entries = write(&self.entries);
        let entry = entries.entry(jid.clone()).or_insert(Entry {
            value: Affiliation::None,
            dirty: true,
        });
        entry.value = affiliation;
        entry.dirty = true;
    }

    pub fn all(&self) -> Vec<UserAffiliation> {
        read(&self.entries)
            .iter()
            .map(|(jid, e)| UserAffiliation {
                jid: jid.clone(),
                affiliation: e.value,
            })
            .collect()
    }

    /// Bare JIDs holding the given affiliation.
    pub fn with_affiliation(&self, affiliation: Affiliation) -> Vec<BareJid> {
        read(&self.entries)
            .iter()
            .filter(|(_, e)| e.value == affiliation)
            .map(|(jid, _)| jid.clone())
            .collect()
    }

    pub fn owners(&self) -> Vec<BareJid> {
        self.with_affiliation(Affiliation::Owner)
    }

    pub fn needs_writing(&self) -> bool {
        read(&self.entries).values().any(|e| e.dirty)
    }

    /// Entries mutated since the last save.
    pub fn changed(&self) -> Vec<UserAffiliation> {
        read(&self.entries)
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(jid, e)| UserAffiliation {
                jid: jid.clone(),
                affiliation: e.value,
            })
            .collect()
    }

    /// Commit every dirty entry.
    pub fn mark_saved(&self) {
        for entry in write(&self.entries).values_mut() {
            entry.dirty = false;
        }
    }
}

#[derive(Debug, Clone)]
struct SubscriptionState {
    subid: String,
    subscription: Subscription,
}

/// Subscriptions of every user to one node.
#[derive(Debug, Default)]
pub struct NodeSubscriptions {
    entries: RwLock<HashMap<BareJid, Entry<SubscriptionState>>>,
}

impl NodeSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate from storage. Loaded entries start clean.
    pub fn load(&self, subscriptions: impl IntoIterator<Item = UserSubscription>) {
        let mut entries = write(&self.entries);
        for us in subscriptions {
            entries.insert(
                us.jid,
                Entry {
                    value: SubscriptionState {
                        subid: us.subid,
                        subscription: us.subscription,
                    },
                    dirty: false,
                },
            );
        }
    }

    /// The user's subscription state, `none` when absent.
    pub fn get(&self, jid: &BareJid) -> Subscription {
        read(&self.entries)
            .get(jid)
            .map(|e| e.value.subscription)
            .unwrap_or_default()
    }

    /// The user's subscription id, if any.
    pub fn subid(&self, jid: &BareJid) -> Option<String> {
        read(&self.entries)
            .get(jid)
            .map(|e| e.value.subid.clone())
            .filter(|s| !s.is_empty())
    }

    /// Subscribe a user, returning its subscription id.
    ///
    /// A fresh id is generated only when the user holds none; otherwise the
    /// existing entry is changed and keeps its id.
    pub fn add_subscriber_jid(&self, jid: BareJid, subscription: Subscription) -> String {
        let mut entries = write(&self.entries);
        let entry = entries.entry(jid).or_insert_with(|| Entry {
            value: SubscriptionState {
                subid: String::new(),
                subscription: Subscription::None,
            },
            dirty: true,
        });
        if entry.value.subid.is_empty() {
            entry.value.subid = generate_id();
        }
        entry.value.subscription = subscription;
        entry.dirty = true;
        entry.value.subid.clone()
    }

    /// Record a subscription with a known id, replacing any existing entry.
    pub fn add(&self, jid: BareJid, subscription: Subscription, subid: String) {
        write(&self.entries).insert(
            jid,
            Entry {
                value: SubscriptionState {
                    subid,
                    subscription,
                },
                dirty: true,
            },
        );
    }

    /// Update a subscription state; an absent entry is created with a fresh id.
    pub fn change(&self, jid: &BareJid, subscription: Subscription) {
        let mut entries = write(&self.entries);
        let entry = entries.entry(jid.clone()).or_insert_with(|| Entry {
            value: SubscriptionState {
                subid: generate_id(),
                subscription: Subscription::None,
            },
            dirty: true,
        });
        entry.value.subscription = subscription;
        entry.dirty = true;
    }

    pub fn all(&self) -> Vec<UserSubscription> {
        read(&self.entries)
            .iter()
            .map(|(jid, e)| to_user_subscription(jid, &e.value))
            .collect()
    }

    /// Bare JIDs whose subscription is active.
    pub fn subscribed(&self) -> Vec<BareJid> {
        read(&self.entries)
            .iter()
            .filter(|(_, e)| e.value.subscription == Subscription::Subscribed)
            .map(|(jid, _)| jid.clone())
            .collect()
    }

    pub fn needs_writing(&self) -> bool {
        read(&self.entries).values().any(|e| e.dirty)
    }

    /// Entries mutated since the last save.
    pub fn changed(&self) -> Vec<UserSubscription> {
        read(&self.entries)
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(jid, e)| to_user_subscription(jid, &e.value))
            .collect()
    }

    /// Commit every dirty entry.
    pub fn mark_saved(&self) {
        for entry in write(&self.entries).values_mut() {
            entry.dirty = false;
        }
    }
}

fn to_user_subscription(jid: &BareJid, state: &SubscriptionState) -> UserSubscription {
    UserSubscription {
        jid: jid.clone(),
        subid: state.subid.clone(),
        subscription: state.subscription,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> BareJid {
        s.parse().expect("valid JID")
    }

    #[test]
    fn test_absent_entries_default_to_none() {
        let affs = NodeAffiliations::new();
        let subs = NodeSubscriptions::new();
        assert_eq!(affs.get(&jid("bob@example.com")), Affiliation::None);
        assert_eq!(subs.get(&jid("bob@example.com")), Subscription::None);
        assert_eq!(subs.subid(&jid("bob@example.com")), None);
    }

    #[test]
    fn test_change_moves_entry_to_changed() {
        let affs = NodeAffiliations::new();
        affs.load(vec![UserAffiliation {
            jid: jid("alice@example.com"),
            affiliation: Affiliation::Owner,
        }]);
        assert!(!affs.needs_writing());

        affs.change(&jid("bob@example.com"), Affiliation::Member);
        let changed = affs.changed();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].jid, jid("bob@example.com"));
        assert_eq!(changed[0].affiliation, Affiliation::Member);

        affs.mark_saved();
        assert!(!affs.needs_writing());
        assert_eq!(affs.get(&jid("bob@example.com")), Affiliation::Member);
        assert_eq!(affs.all().len(), 2);
    }

    #[test]
    fn test_mark_saved_is_idempotent() {
        let subs = NodeSubscriptions::new();
        subs.add_subscriber_jid(jid("bob@example.com"), Subscription::Subscribed);
        subs.mark_saved();
        assert!(!subs.needs_writing());
        assert!(subs.changed().is_empty());

        subs.mark_saved();
        assert!(!subs.needs_writing());
        assert!(subs.changed().is_empty());
    }

    #[test]
    fn test_add_subscriber_jid_reuses_subid() {
        let subs = NodeSubscriptions::new();
        let first = subs.add_subscriber_jid(jid("bob@example.com"), Subscription::Pending);
        subs.mark_saved();
        let second = subs.add_subscriber_jid(jid("bob@example.com"), Subscription::Subscribed);

        assert_eq!(first, second);
        assert_eq!(subs.get(&jid("bob@example.com")), Subscription::Subscribed);
        assert_eq!(subs.changed().len(), 1);
    }

    #[test]
    fn test_change_absent_subscription_inserts() {
        let subs = NodeSubscriptions::new();
        subs.change(&jid("carol@example.com"), Subscription::Subscribed);

        assert_eq!(subs.get(&jid("carol@example.com")), Subscription::Subscribed);
        assert!(subs.subid(&jid("carol@example.com")).is_some());
        assert_eq!(subs.subscribed(), vec![jid("carol@example.com")]);
    }
}
