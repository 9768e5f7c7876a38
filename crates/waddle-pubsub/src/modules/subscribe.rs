//! Subscribing to a node.

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::access::subscribe_outcome;
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::node::AccessModel;
use crate::notify::subscription_element;
use crate::outbound::StanzaSender;
use crate::stanzas::{jid_attr, node_attr, Stanza, NS_PUBSUB};
use crate::types::{Affiliation, Subscription};

pub struct SubscribeNodeModule;

#[async_trait]
impl PubSubModule for SubscribeNodeModule {
    fn name(&self) -> &'static str {
        "SubscribeNodeModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "set")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("subscribe")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![
            Feature::pubsub_feature("auto-subscribe"),
            Feature::pubsub_feature("subscribe"),
        ]
    }

    #[instrument(skip(self, ctx, stanza, out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let subscribe = stanza
            .pubsub(NS_PUBSUB)
            .and_then(|p| p.get_child("subscribe", NS_PUBSUB))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = node_attr(subscribe)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("nodeid-required"))?;
        let node = ctx.require_node(stanza, &name).await?;
        let config = node.config();

        let sender = stanza.sender();
        let sender_affiliation = node.affiliations().get(&sender);
        let sender_is_owner = sender_affiliation == Affiliation::Owner;

        let subscriber = match jid_attr(subscribe) {
            Some(jid) if sender_is_owner || jid == sender => jid,
            _ => return Err(PubSubError::bad_request(element).with_condition("invalid-jid")),
        };

        if !config.subscribe_allowed() {
            return Err(PubSubError::feature_not_implemented(element).with_unsupported("subscribe"));
        }

        if !sender_affiliation.can_subscribe() {
            return Err(PubSubError::forbidden(element)
                .with_text("Not enough privileges to subscribe"));
        }

        let subscriptions = node.subscriptions();
        if subscriptions.get(&subscriber) == Subscription::Pending && !sender_is_owner {
            return Err(PubSubError::forbidden(element)
                .with_condition("pending-subscription")
                .with_text("Subscription is pending"));
        }

        let access_model = config.access_model();
        if access_model == Some(AccessModel::Whitelist)
            && !sender_is_owner
            && !sender_affiliation.can_retrieve_items()
        {
            return Err(PubSubError::forbidden(element).with_condition("closed-node"));
        }

        let affiliations = node.affiliations();
        let current = affiliations.get(&subscriber);
        let outcome = subscribe_outcome(
            &ctx.repository,
            element,
            &node,
            &subscriber,
            current,
            sender_is_owner,
        )
        .await?;

        let subid = match subscriptions.subid(&subscriber) {
            Some(subid) => {
                subscriptions.change(&subscriber, outcome.subscription);
                affiliations.change(&subscriber, outcome.affiliation);
                subid
            }
            None => {
                let subid =
                    subscriptions.add_subscriber_jid(subscriber.clone(), outcome.subscription);
                affiliations.add(subscriber.clone(), outcome.affiliation);
                subid
            }
        };

        ctx.repository
            .update_subscriptions(&node, subscriptions)
            .await
            .map_err(storage_error(stanza))?;
        ctx.repository
            .update_affiliations(&node, affiliations)
            .await
            .map_err(storage_error(stanza))?;

        if outcome.subscription == Subscription::Pending {
            ctx.notifier
                .authorization_requested(&node, &subscriber, &subid)
                .await;
        }

        debug!(
            node = %name,
            subscriber = %subscriber,
            subscription = %outcome.subscription,
            "Subscription updated"
        );

        let payload = Element::builder("pubsub", NS_PUBSUB)
            .append(subscription_element(
                NS_PUBSUB,
                &name,
                &subscriber,
                outcome.subscription,
                Some(&subid),
            ))
            .build();
        out.reply(stanza.result(Some(payload))).await;
        Ok(())
    }
}
