//! Notification fan-out.
//!
//! Every handler that must tell other entities about a change goes through
//! [`NotificationService`]. Event notifications reach subscribers whose
//! subscription is `subscribed` and whose affiliation is not `outcast`.

use async_trait::async_trait;
use jid::BareJid;
use minidom::Element;
use tracing::{debug, instrument};

use crate::form::{DataForm, FormField, FormType};
use crate::repository::Node;
use crate::stanzas::{
    build_event_message, build_pubsub_message, with_namespace, NS_CLIENT, NS_PUBSUB,
    NS_PUBSUB_EVENT, NS_PUBSUB_SUBSCRIBE_AUTHORIZATION,
};
use crate::types::{Affiliation, Subscription};
use crate::outbound::{SendResult, StanzaSender};

/// Outbound notifications raised by operation handlers.
#[async_trait]
pub trait NotificationService: Send + Sync + 'static {
    /// Items were published to `node`.
    async fn items_published(&self, node: &Node, items: &[Element]);

    /// Items were retracted from `node`.
    async fn items_retracted(&self, node: &Node, item_ids: &[String]);

    /// Every item of `node` is about to be removed.
    async fn node_purged(&self, node: &Node);

    /// `node` is about to be deleted.
    async fn node_deleted(&self, node: &Node);

    /// The configuration of `node` changed.
    async fn configuration_changed(&self, node: &Node);

    /// An owner changed `jid`'s affiliation.
    async fn affiliation_changed(&self, node: &Node, jid: &BareJid, affiliation: Affiliation);

    /// An owner changed `jid`'s subscription.
    async fn subscription_changed(
        &self,
        node: &Node,
        jid: &BareJid,
        subscription: Subscription,
        subid: Option<&str>,
    );

    /// `subscriber` asked to subscribe to an `authorize` node.
    async fn authorization_requested(&self, node: &Node, subscriber: &BareJid, subid: &str);

    /// An owner approved or denied a pending subscription.
    async fn subscription_decided(
        &self,
        node: &Node,
        subscriber: &BareJid,
        subscription: Subscription,
    );
}

/// Build the `<subscription/>` element used in replies and notices.
pub fn subscription_element(
    ns: &str,
    node: &str,
    jid: &BareJid,
    subscription: Subscription,
    subid: Option<&str>,
) -> Element {
    let mut builder = Element::builder("subscription", ns)
        .attr("node", node)
        .attr("jid", jid.to_string())
        .attr("subscription", subscription.as_str());
    if let Some(subid) = subid.filter(|s| !s.is_empty()) {
        builder = builder.attr("subid", subid);
    }
    builder.build()
}

/// The subscription authorization form sent to node owners.
pub fn authorization_form(node: &str, subscriber: &BareJid, subid: &str) -> DataForm {
    let mut form = DataForm::new(FormType::Form);
    form.title = Some("PubSub subscriber request".to_string());
    form.add_field(FormField::hidden("FORM_TYPE", NS_PUBSUB_SUBSCRIBE_AUTHORIZATION));
    form.add_field(FormField::hidden("pubsub#subid", subid));
    form.add_field(FormField::text_single("pubsub#node", "Node ID", node));
    let mut subscriber_field = FormField::text_single(
        "pubsub#subscriber_jid",
        "Subscriber Address",
        &subscriber.to_string(),
    );
    subscriber_field.field_type = Some(crate::form::FieldType::JidSingle);
    form.add_field(subscriber_field);
    form.add_field(FormField::boolean(
        "pubsub#allow",
        "Allow this JID to subscribe to this pubsub node?",
        false,
    ));
    form
}

/// Notifier that turns events into stanzas on a [`StanzaSender`].
#[derive(Debug, Clone)]
pub struct StanzaNotifier {
    sender: StanzaSender,
}

impl StanzaNotifier {
    pub fn new(sender: StanzaSender) -> Self {
        Self { sender }
    }

    /// Bare JIDs that receive event notifications for `node`.
    pub fn recipients(node: &Node) -> Vec<BareJid> {
        node.subscriptions()
            .subscribed()
            .into_iter()
            .filter(|jid| node.affiliations().get(jid) != Affiliation::Outcast)
            .collect()
    }

    fn broadcast(&self, node: &Node, payload: Element) -> usize {
        let mut delivered = 0;
        for jid in Self::recipients(node) {
            let message = build_event_message(node.service(), &jid, payload.clone());
            if self.sender.send(message) == SendResult::Sent {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl NotificationService for StanzaNotifier {
    #[instrument(skip(self, node, items), fields(node = %node.name(), items = items.len()))]
    async fn items_published(&self, node: &Node, items: &[Element]) {
        let deliver_payloads = node.config().deliver_payloads();
        let mut payload = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node.name());
        for item in items {
            let event_item = if deliver_payloads {
                with_namespace(item, NS_PUBSUB_EVENT)
            } else {
                let mut bare = Element::builder("item", NS_PUBSUB_EVENT);
                if let Some(id) = item.attr("id") {
                    bare = bare.attr("id", id);
                }
                bare.build()
            };
            payload = payload.append(event_item);
        }

        let delivered = self.broadcast(node, payload.build());
        debug!(delivered, "Publish notifications sent");
    }

    #[instrument(skip(self, node, item_ids), fields(node = %node.name()))]
    async fn items_retracted(&self, node: &Node, item_ids: &[String]) {
        let mut payload = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node.name());
        for id in item_ids {
            payload = payload.append(
                Element::builder("retract", NS_PUBSUB_EVENT)
                    .attr("id", id.as_str())
                    .build(),
            );
        }

        let delivered = self.broadcast(node, payload.build());
        debug!(delivered, "Retract notifications sent");
    }

    async fn node_purged(&self, node: &Node) {
        let payload = Element::builder("purge", NS_PUBSUB_EVENT)
            .attr("node", node.name())
            .build();
        self.broadcast(node, payload);
    }

    async fn node_deleted(&self, node: &Node) {
        let payload = Element::builder("delete", NS_PUBSUB_EVENT)
            .attr("node", node.name())
            .build();
        self.broadcast(node, payload);
    }

    async fn configuration_changed(&self, node: &Node) {
        let payload = Element::builder("configuration", NS_PUBSUB_EVENT)
            .attr("node", node.name())
            .build();
        self.broadcast(node, payload);
    }

    async fn affiliation_changed(&self, node: &Node, jid: &BareJid, affiliation: Affiliation) {
        let payload = Element::builder("affiliations", NS_PUBSUB)
            .attr("node", node.name())
            .append(
                Element::builder("affiliation", NS_PUBSUB)
                    .attr("jid", jid.to_string())
                    .attr("affiliation", affiliation.as_str())
                    .build(),
            )
            .build();
        self.sender
            .send(build_pubsub_message(node.service(), jid, payload));
    }

    async fn subscription_changed(
        &self,
        node: &Node,
        jid: &BareJid,
        subscription: Subscription,
        subid: Option<&str>,
    ) {
        let payload = subscription_element(NS_PUBSUB, node.name(), jid, subscription, subid);
        self.sender
            .send(build_pubsub_message(node.service(), jid, payload));
    }

    #[instrument(skip(self, node), fields(node = %node.name(), subscriber = %subscriber))]
    async fn authorization_requested(&self, node: &Node, subscriber: &BareJid, subid: &str) {
        let form = authorization_form(node.name(), subscriber, subid).to_element();
        for owner in node.affiliations().owners() {
            let message = Element::builder("message", NS_CLIENT)
                .attr("from", node.service().to_string())
                .attr("to", owner.to_string())
                .attr("id", uuid::Uuid::new_v4().to_string())
                .append(form.clone())
                .build();
            self.sender.send(message);
        }
        debug!("Authorization request sent to owners");
    }

    async fn subscription_decided(
        &self,
        node: &Node,
        subscriber: &BareJid,
        subscription: Subscription,
    ) {
        let subid = node.subscriptions().subid(subscriber);
        let payload = subscription_element(
            NS_PUBSUB,
            node.name(),
            subscriber,
            subscription,
            subid.as_deref(),
        );
        self.sender
            .send(build_pubsub_message(node.service(), subscriber, payload));
    }
}
