//! Access-control policy.
//!
//! Evaluates a node's access model against the requester's standing on the
//! node (affiliation and subscription) and, for the `presence` and `roster`
//! models, against the rosters of the node owners.

use std::sync::Arc;

use jid::BareJid;
use minidom::Element;
use tracing::debug;

use crate::error::PubSubError;
use crate::node::AccessModel;
use crate::repository::{Node, PubSubRepository};
use crate::types::{Affiliation, Subscription};

/// Whether a requester may retrieve items of an `authorize` node.
///
/// A subscribed requester is allowed, and so is one whose affiliation
/// already grants item retrieval (owners, admins, members).
pub fn authorize_retrieval_allowed(subscription: Subscription, affiliation: Affiliation) -> bool {
    subscription == Subscription::Subscribed || affiliation.can_retrieve_items()
}

/// Resolve a node and check that `requester` may read from it.
///
/// Returns the node so callers do not need to resolve it twice.
pub async fn check_access(
    repository: &PubSubRepository,
    stanza: &Element,
    service: &BareJid,
    node_name: &str,
    requester: &BareJid,
) -> Result<Arc<Node>, PubSubError> {
    let node = repository
        .get_node(service, node_name)
        .await
        .map_err(|e| PubSubError::internal_server_error(stanza, e))?
        .ok_or_else(|| PubSubError::item_not_found(stanza))?;

    check_node_access(repository, stanza, &node, requester).await?;
    Ok(node)
}

/// Check that `requester` may read from an already resolved node.
pub async fn check_node_access(
    repository: &PubSubRepository,
    stanza: &Element,
    node: &Node,
    requester: &BareJid,
) -> Result<(), PubSubError> {
    let config = node.config();
    let access_model = config.access_model();

    // TODO: enforce pubsub#domains once domain allow-listing has a config source.
    if access_model == Some(AccessModel::Open) {
        return Ok(());
    }

    let affiliation = node.affiliations().get(requester);
    if affiliation == Affiliation::Outcast {
        return Err(PubSubError::forbidden(stanza));
    }

    match access_model {
        Some(AccessModel::Whitelist) => {
            if affiliation.can_retrieve_items() {
                return Ok(());
            }
            Err(PubSubError::forbidden(stanza).with_condition("closed-node"))
        }
        Some(AccessModel::Authorize) => {
            let subscription = node.subscriptions().get(requester);
            if authorize_retrieval_allowed(subscription, affiliation) {
                return Ok(());
            }
            Err(PubSubError::forbidden(stanza).with_condition("not-subscribed"))
        }
        Some(AccessModel::Presence) => {
            if has_presence_subscription(repository, stanza, node, requester).await? {
                return Ok(());
            }
            Err(PubSubError::not_authorized(stanza)
                .with_condition("presence-subscription-required"))
        }
        Some(AccessModel::Roster) => {
            if is_in_roster_group(repository, stanza, node, requester).await? {
                return Ok(());
            }
            Err(PubSubError::not_authorized(stanza).with_condition("not-in-roster-group"))
        }
        _ => {
            debug!(node = %node.name(), "Access model not granted, denying");
            Err(PubSubError::not_authorized(stanza))
        }
    }
}

/// Whether `requester` is an owner or receives an owner's presence.
pub async fn has_presence_subscription(
    repository: &PubSubRepository,
    stanza: &Element,
    node: &Node,
    requester: &BareJid,
) -> Result<bool, PubSubError> {
    let owners = node.affiliations().owners();
    if owners.contains(requester) {
        return Ok(true);
    }

    for owner in &owners {
        let roster = repository
            .get_user_roster(owner)
            .await
            .map_err(|e| PubSubError::internal_server_error(stanza, e))?;
        if roster
            .iter()
            .any(|item| &item.jid == requester && item.subscription.contact_sees_presence())
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether `requester` sits in one of the node's allowed roster groups of
/// some owner. An empty group list allows everyone.
pub async fn is_in_roster_group(
    repository: &PubSubRepository,
    stanza: &Element,
    node: &Node,
    requester: &BareJid,
) -> Result<bool, PubSubError> {
    let allowed = node.config().roster_groups_allowed();
    if allowed.is_empty() {
        return Ok(true);
    }

    let owners = node.affiliations().owners();
    if owners.contains(requester) {
        return Ok(true);
    }

    for owner in &owners {
        let roster = repository
            .get_user_roster(owner)
            .await
            .map_err(|e| PubSubError::internal_server_error(stanza, e))?;
        let in_group = roster.iter().any(|item| {
            &item.jid == requester && item.groups.iter().any(|g| allowed.contains(g))
        });
        if in_group {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Subscription state and affiliation granted by a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub subscription: Subscription,
    pub affiliation: Affiliation,
}

/// Map a subscribe request onto its outcome under the node's access model.
///
/// `current` is the subscriber's existing affiliation; the granted
/// affiliation is never lower than it. Owners are always subscribed.
pub async fn subscribe_outcome(
    repository: &PubSubRepository,
    stanza: &Element,
    node: &Node,
    subscriber: &BareJid,
    current: Affiliation,
    sender_is_owner: bool,
) -> Result<SubscribeOutcome, PubSubError> {
    let subscribed = SubscribeOutcome {
        subscription: Subscription::Subscribed,
        affiliation: current.max_weight(Affiliation::Member),
    };
    if sender_is_owner {
        return Ok(subscribed);
    }

    match node.config().access_model() {
        Some(AccessModel::Open) | Some(AccessModel::Whitelist) => Ok(subscribed),
        Some(AccessModel::Authorize) => Ok(SubscribeOutcome {
            subscription: Subscription::Pending,
            affiliation: current.max_weight(Affiliation::None),
        }),
        Some(AccessModel::Presence) => {
            if has_presence_subscription(repository, stanza, node, subscriber).await? {
                Ok(subscribed)
            } else {
                Err(PubSubError::not_authorized(stanza)
                    .with_condition("presence-subscription-required"))
            }
        }
        Some(AccessModel::Roster) => {
            if is_in_roster_group(repository, stanza, node, subscriber).await? {
                Ok(subscribed)
            } else {
                Err(PubSubError::not_authorized(stanza).with_condition("not-in-roster-group"))
            }
        }
        None => Err(PubSubError::feature_not_implemented(stanza)
            .with_text("Access model is not implemented")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;
    use crate::form::{DataForm, FormType};
    use crate::node::{NodeConfig, FIELD_ACCESS_MODEL, FIELD_ROSTER_GROUPS_ALLOWED};
    use crate::storage::{InMemoryPubSubStorage, RosterSubscription};

    fn jid(s: &str) -> BareJid {
        s.parse().expect("valid JID")
    }

    fn items_iq() -> Element {
        "<iq xmlns='jabber:client' type='get' id='r1' from='bob@example.com/home' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><items node='news'/></pubsub></iq>"
            .parse()
            .expect("valid XML")
    }

    async fn setup(
        access_model: &str,
    ) -> (Arc<InMemoryPubSubStorage>, PubSubRepository, Arc<Node>) {
        let storage = Arc::new(InMemoryPubSubStorage::new());
        let repository = PubSubRepository::new(storage.clone());
        let node = repository
            .create_node(
                &jid("pubsub.example.com"),
                "news",
                &jid("alice@example.com"),
                NodeConfig::leaf(),
                None,
            )
            .await
            .expect("create should succeed");

        let mut overlay = DataForm::new(FormType::Submit);
        overlay.set_values(FIELD_ACCESS_MODEL, vec![access_model.to_string()]);
        repository
            .update_node_config(&node, &overlay)
            .await
            .expect("configure");
        (storage, repository, node)
    }

    #[tokio::test]
    async fn test_unknown_node_is_item_not_found() {
        let (_storage, repository, _node) = setup("open").await;
        let err = check_access(
            &repository,
            &items_iq(),
            &jid("pubsub.example.com"),
            "missing",
            &jid("bob@example.com"),
        )
        .await
        .expect_err("no such node");
        assert_eq!(err.condition(), StanzaErrorCondition::ItemNotFound);
    }

    #[tokio::test]
    async fn test_open_allows_outcast() {
        let (_storage, repository, node) = setup("open").await;
        node.affiliations()
            .add(jid("bob@example.com"), Affiliation::Outcast);

        check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect("open node");
    }

    #[tokio::test]
    async fn test_outcast_is_forbidden() {
        let (_storage, repository, node) = setup("authorize").await;
        node.affiliations()
            .add(jid("bob@example.com"), Affiliation::Outcast);

        let err = check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect_err("outcast");
        assert_eq!(err.condition(), StanzaErrorCondition::Forbidden);
        assert!(err.app_conditions().is_empty());
    }

    #[tokio::test]
    async fn test_whitelist_requires_retrieve_privilege() {
        let (_storage, repository, node) = setup("whitelist").await;

        let err = check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect_err("not whitelisted");
        assert_eq!(err.condition(), StanzaErrorCondition::Forbidden);
        assert!(err.has_condition("closed-node"));

        node.affiliations()
            .add(jid("bob@example.com"), Affiliation::Member);
        check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect("member is whitelisted");
    }

    #[test]
    fn test_authorize_retrieval_reading() {
        // Subscribed requesters and privileged affiliations may read.
        assert!(authorize_retrieval_allowed(Subscription::Subscribed, Affiliation::None));
        assert!(authorize_retrieval_allowed(Subscription::None, Affiliation::Owner));
        assert!(authorize_retrieval_allowed(Subscription::Subscribed, Affiliation::Member));
        assert!(!authorize_retrieval_allowed(Subscription::Pending, Affiliation::None));
        assert!(!authorize_retrieval_allowed(Subscription::None, Affiliation::None));
    }

    #[test]
    fn test_authorize_literal_reading_differs() {
        // The literal rule denies when unsubscribed OR privileged; it would
        // lock a subscribed member and an owner out of their own node.
        let literal =
            |s: Subscription, a: Affiliation| !(s != Subscription::Subscribed || a.can_retrieve_items());

        assert!(!literal(Subscription::Subscribed, Affiliation::Member));
        assert!(!literal(Subscription::None, Affiliation::Owner));
        assert!(literal(Subscription::Subscribed, Affiliation::None));

        for (s, a) in [
            (Subscription::Subscribed, Affiliation::Member),
            (Subscription::None, Affiliation::Owner),
        ] {
            assert_ne!(literal(s, a), authorize_retrieval_allowed(s, a));
        }
        assert_eq!(
            literal(Subscription::Subscribed, Affiliation::None),
            authorize_retrieval_allowed(Subscription::Subscribed, Affiliation::None)
        );
    }

    #[tokio::test]
    async fn test_authorize_denies_unsubscribed() {
        let (_storage, repository, node) = setup("authorize").await;

        let err = check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect_err("not subscribed");
        assert!(err.has_condition("not-subscribed"));

        node.subscriptions()
            .add_subscriber_jid(jid("bob@example.com"), Subscription::Subscribed);
        check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect("subscribed");
    }

    #[tokio::test]
    async fn test_presence_requires_owner_roster() {
        let (storage, repository, node) = setup("presence").await;

        let err = check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect_err("no roster entry");
        assert_eq!(err.condition(), StanzaErrorCondition::NotAuthorized);
        assert!(err.has_condition("presence-subscription-required"));

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::To,
            "",
        );
        assert!(check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .is_err());

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::Both,
            "",
        );
        check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect("bob sees alice's presence");
        check_node_access(&repository, &items_iq(), &node, &jid("alice@example.com"))
            .await
            .expect("owner");
    }

    #[tokio::test]
    async fn test_roster_groups() {
        let (storage, repository, node) = setup("roster").await;

        // No groups configured allows everyone.
        check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect("empty group list");

        let mut overlay = DataForm::new(FormType::Submit);
        overlay.set_values(FIELD_ROSTER_GROUPS_ALLOWED, vec!["friends".to_string()]);
        repository
            .update_node_config(&node, &overlay)
            .await
            .expect("configure");

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::Both,
            "work;family",
        );
        let err = check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect_err("wrong group");
        assert!(err.has_condition("not-in-roster-group"));

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::Both,
            "work;friends",
        );
        check_node_access(&repository, &items_iq(), &node, &jid("bob@example.com"))
            .await
            .expect("in friends");
    }

    #[tokio::test]
    async fn test_subscribe_outcome_never_downgrades() {
        let (_storage, repository, node) = setup("open").await;
        for current in Affiliation::ALL {
            let outcome = subscribe_outcome(
                &repository,
                &items_iq(),
                &node,
                &jid("bob@example.com"),
                current,
                false,
            )
            .await
            .expect("open node");
            assert_eq!(outcome.subscription, Subscription::Subscribed);
            assert_eq!(
                outcome.affiliation.weight(),
                current.weight().max(Affiliation::Member.weight())
            );
        }
    }

    #[tokio::test]
    async fn test_subscribe_outcome_authorize_is_pending() {
        let (_storage, repository, node) = setup("authorize").await;
        let outcome = subscribe_outcome(
            &repository,
            &items_iq(),
            &node,
            &jid("bob@example.com"),
            Affiliation::None,
            false,
        )
        .await
        .expect("authorize node");
        assert_eq!(outcome.subscription, Subscription::Pending);
        assert_eq!(outcome.affiliation, Affiliation::None);

        let owner = subscribe_outcome(
            &repository,
            &items_iq(),
            &node,
            &jid("bob@example.com"),
            Affiliation::None,
            true,
        )
        .await
        .expect("owner subscribes others");
        assert_eq!(owner.subscription, Subscription::Subscribed);
    }

    async fn subscribe_bob(
        repository: &PubSubRepository,
        node: &Node,
    ) -> Result<SubscribeOutcome, PubSubError> {
        subscribe_outcome(
            repository,
            &items_iq(),
            node,
            &jid("bob@example.com"),
            Affiliation::None,
            false,
        )
        .await
    }

    #[tokio::test]
    async fn test_subscribe_outcome_presence() {
        let (storage, repository, node) = setup("presence").await;

        let err = subscribe_bob(&repository, &node)
            .await
            .expect_err("no roster entry");
        assert_eq!(err.condition(), StanzaErrorCondition::NotAuthorized);
        assert!(err.has_condition("presence-subscription-required"));

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::To,
            "",
        );
        let err = subscribe_bob(&repository, &node)
            .await
            .expect_err("bob does not receive alice's presence");
        assert!(err.has_condition("presence-subscription-required"));

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::From,
            "",
        );
        let outcome = subscribe_bob(&repository, &node)
            .await
            .expect("bob sees alice's presence");
        assert_eq!(outcome.subscription, Subscription::Subscribed);
        assert_eq!(outcome.affiliation, Affiliation::Member);
    }

    #[tokio::test]
    async fn test_subscribe_outcome_roster() {
        let (storage, repository, node) = setup("roster").await;
        let mut overlay = DataForm::new(FormType::Submit);
        overlay.set_values(FIELD_ROSTER_GROUPS_ALLOWED, vec!["friends".to_string()]);
        repository
            .update_node_config(&node, &overlay)
            .await
            .expect("configure");

        let err = subscribe_bob(&repository, &node)
            .await
            .expect_err("not on the roster");
        assert_eq!(err.condition(), StanzaErrorCondition::NotAuthorized);
        assert!(err.has_condition("not-in-roster-group"));

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::Both,
            "work",
        );
        let err = subscribe_bob(&repository, &node)
            .await
            .expect_err("wrong group");
        assert!(err.has_condition("not-in-roster-group"));

        storage.add_roster_item(
            &jid("alice@example.com"),
            &jid("bob@example.com"),
            RosterSubscription::Both,
            "friends",
        );
        let outcome = subscribe_bob(&repository, &node)
            .await
            .expect("in friends");
        assert_eq!(outcome.subscription, Subscription::Subscribed);
        assert_eq!(outcome.affiliation, Affiliation::Member);
    }
}
