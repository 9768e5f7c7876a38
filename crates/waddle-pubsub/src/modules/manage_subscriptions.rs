//! Owner management of node subscriptions.

use async_trait::async_trait;
use jid::BareJid;
use minidom::Element;
use tracing::{debug, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::notify::subscription_element;
use crate::outbound::StanzaSender;
use crate::stanzas::{jid_attr, node_attr, Stanza, NS_PUBSUB_OWNER};
use crate::types::{Affiliation, Subscription};

pub struct ManageSubscriptionsModule;

fn parse_changes(
    stanza: &Element,
    request: &Element,
) -> Result<Vec<(BareJid, Subscription)>, PubSubError> {
    request
        .children()
        .map(|child| {
            if !child.is("subscription", NS_PUBSUB_OWNER) {
                return Err(PubSubError::bad_request(stanza));
            }
            let jid = jid_attr(child).ok_or_else(|| PubSubError::bad_request(stanza))?;
            let subscription = child
                .attr("subscription")
                .and_then(|s| s.parse::<Subscription>().ok())
                .ok_or_else(|| PubSubError::bad_request(stanza))?;
            Ok((jid, subscription))
        })
        .collect()
}

#[async_trait]
impl PubSubModule for ManageSubscriptionsModule {
    fn name(&self) -> &'static str {
        "ManageSubscriptionsModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB_OWNER)
                    .child(ElementCriteria::name("subscriptions")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![
            Feature::pubsub_feature("manage-subscriptions"),
            Feature::pubsub_feature("subscription-notifications"),
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
        let request = stanza
            .pubsub(NS_PUBSUB_OWNER)
            .and_then(|p| p.get_child("subscriptions", NS_PUBSUB_OWNER))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let stanza_type = stanza.stanza_type();
        if stanza_type != "get" && stanza_type != "set" {
            return Err(PubSubError::bad_request(element));
        }

        let name = node_attr(request)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("node-required"))?;
        let node = ctx.require_node(stanza, &name).await?;

        let sender = stanza.sender();
        let subscriptions = node.subscriptions();
        let is_owner = node.affiliations().get(&sender) == Affiliation::Owner;

        if stanza_type == "get" {
            if !is_owner && subscriptions.get(&sender) != Subscription::Subscribed {
                return Err(PubSubError::forbidden(element));
            }

            let mut entries = subscriptions.all();
            entries.sort_by_key(|s| s.jid.to_string());
            let list = entries.into_iter().map(|us| {
                subscription_element(
                    NS_PUBSUB_OWNER,
                    &name,
                    &us.jid,
                    us.subscription,
                    Some(&us.subid),
                )
            });
            let payload = Element::builder("pubsub", NS_PUBSUB_OWNER)
                .append(
                    Element::builder("subscriptions", NS_PUBSUB_OWNER)
                        .attr("node", name.as_str())
                        .append_all(list)
                        .build(),
                )
                .build();
            out.reply(stanza.result(Some(payload))).await;
            return Ok(());
        }

        if !is_owner {
            return Err(PubSubError::forbidden(element));
        }

        let changes = parse_changes(element, request)?;
        for (jid, subscription) in &changes {
            let previous = subscriptions.get(jid);
            if previous == Subscription::None && *subscription != Subscription::None {
                subscriptions.add_subscriber_jid(jid.clone(), *subscription);
            } else {
                subscriptions.change(jid, *subscription);
            }
            debug!(node = %name, jid = %jid, %previous, %subscription, "Subscription changed");
        }

        ctx.repository
            .update_subscriptions(&node, subscriptions)
            .await
            .map_err(storage_error(stanza))?;

        for (jid, subscription) in &changes {
            let subid = subscriptions.subid(jid);
            ctx.notifier
                .subscription_changed(&node, jid, *subscription, subid.as_deref())
                .await;
        }

        out.reply(stanza.result(None)).await;
        Ok(())
    }
}
