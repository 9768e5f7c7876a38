//! Unsubscribing from a node.

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::error::PubSubError;
use crate::notify::subscription_element;
use crate::outbound::StanzaSender;
use crate::stanzas::{jid_attr, node_attr, Stanza, NS_PUBSUB};
use crate::types::{Affiliation, Subscription};

pub struct UnsubscribeNodeModule;

#[async_trait]
impl PubSubModule for UnsubscribeNodeModule {
    fn name(&self) -> &'static str {
        "UnsubscribeNodeModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "set")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("unsubscribe")),
            )
            .into()
    }

    #[instrument(skip(self, ctx, stanza, out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let unsubscribe = stanza
            .pubsub(NS_PUBSUB)
            .and_then(|p| p.get_child("unsubscribe", NS_PUBSUB))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = node_attr(unsubscribe)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("nodeid-required"))?;
        let node = ctx.require_node(stanza, &name).await?;

        let sender = stanza.sender();
        let sender_is_owner = node.affiliations().get(&sender) == Affiliation::Owner;

        let target = match jid_attr(unsubscribe) {
            Some(jid) if sender_is_owner || jid == sender => jid,
            _ => return Err(PubSubError::bad_request(element).with_condition("invalid-jid")),
        };

        let affiliations = node.affiliations();
        if affiliations.get(&target) == Affiliation::Outcast {
            return Err(PubSubError::forbidden(element));
        }

        let subscriptions = node.subscriptions();
        let requested_subid = unsubscribe.attr("subid").filter(|s| !s.is_empty());
        let current_subid = subscriptions.subid(&target);
        if let Some(requested) = requested_subid {
            if current_subid.as_deref() != Some(requested) {
                return Err(PubSubError::bad_request(element).with_condition("invalid-subid"));
            }
        }

        if subscriptions.get(&target) == Subscription::None {
            return Err(PubSubError::bad_request(element).with_condition("not-subscribed"));
        }

        subscriptions.change(&target, Subscription::None);
        ctx.repository
            .update_subscriptions(&node, subscriptions)
            .await
            .map_err(storage_error(stanza))?;

        debug!(node = %name, subscriber = %target, "Unsubscribed");

        let payload = Element::builder("pubsub", NS_PUBSUB)
            .append(subscription_element(
                NS_PUBSUB,
                &name,
                &target,
                Subscription::None,
                current_subid.as_deref(),
            ))
            .build();
        out.reply(stanza.result(Some(payload))).await;
        Ok(())
    }
}
