//! A requester's own subscriptions, per node or across the service.

use async_trait::async_trait;
use minidom::Element;
use tracing::instrument;

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::notify::subscription_element;
use crate::outbound::StanzaSender;
use crate::stanzas::{node_attr, Stanza, NS_PUBSUB};
use crate::types::Subscription;

pub struct RetrieveSubscriptionsModule;

#[async_trait]
impl PubSubModule for RetrieveSubscriptionsModule {
    fn name(&self) -> &'static str {
        "RetrieveSubscriptionsModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "get")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("subscriptions")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("retrieve-subscriptions")]
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
            .pubsub(NS_PUBSUB)
            .and_then(|p| p.get_child("subscriptions", NS_PUBSUB))
            .ok_or_else(|| PubSubError::bad_request(element))?;
        let sender = stanza.sender();
        let requested_node = node_attr(request);

        let entries: Vec<Element> = match &requested_node {
            None => ctx
                .repository
                .get_user_subscriptions(stanza.service(), &sender)
                .await
                .map_err(storage_error(stanza))?
                .into_iter()
                .filter(|s| s.subscription != Subscription::None)
                .map(|s| {
                    subscription_element(
                        NS_PUBSUB,
                        &s.node,
                        &sender,
                        s.subscription,
                        Some(&s.subid),
                    )
                })
                .collect(),
            Some(name) => {
                let node = ctx.require_node(stanza, name).await?;
                let subscriptions = node.subscriptions();
                match subscriptions.get(&sender) {
                    Subscription::None => Vec::new(),
                    subscription => vec![subscription_element(
                        NS_PUBSUB,
                        name,
                        &sender,
                        subscription,
                        subscriptions.subid(&sender).as_deref(),
                    )],
                }
            }
        };

        let mut subscriptions = Element::builder("subscriptions", NS_PUBSUB);
        if let Some(name) = requested_node {
            subscriptions = subscriptions.attr("node", name);
        }
        let payload = Element::builder("pubsub", NS_PUBSUB)
            .append(subscriptions.append_all(entries).build())
            .build();
        out.reply(stanza.result(Some(payload))).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{jid, Harness, SERVICE};
    use crate::node::NodeConfig;

    fn subscriptions_of(reply: &Element) -> Vec<Element> {
        reply
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|p| p.get_child("subscriptions", NS_PUBSUB))
            .expect("subscriptions")
            .children()
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn test_across_service() {
        let (mut harness, news) = Harness::with_node("news").await;
        let blog = harness
            .ctx
            .repository
            .create_node(
                &jid(SERVICE),
                "blog",
                &jid("alice@example.com"),
                NodeConfig::leaf(),
                None,
            )
            .await
            .expect("create");
        let bob = jid("bob@example.com");
        for node in [&news, &blog] {
            node.subscriptions()
                .add_subscriber_jid(bob.clone(), Subscription::Subscribed);
            harness
                .ctx
                .repository
                .update_subscriptions(node, node.subscriptions())
                .await
                .expect("persist");
        }

        harness
            .run(
                &RetrieveSubscriptionsModule,
                "<iq xmlns='jabber:client' type='get' id='subs1' from='bob@example.com/home' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><subscriptions/></pubsub></iq>",
            )
            .await
            .expect("retrieve");

        let reply = harness.drain().pop().expect("reply");
        let entries = subscriptions_of(&reply);
        let nodes: Vec<_> = entries.iter().filter_map(|e| e.attr("node")).collect();
        assert_eq!(nodes, vec!["blog", "news"]);
        assert!(entries
            .iter()
            .all(|e| e.attr("subscription") == Some("subscribed") && e.attr("subid").is_some()));
    }

    #[tokio::test]
    async fn test_single_node_without_subscription() {
        let (mut harness, _news) = Harness::with_node("news").await;
        harness
            .run(
                &RetrieveSubscriptionsModule,
                "<iq xmlns='jabber:client' type='get' id='subs2' from='carol@example.com/home' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><subscriptions node='news'/></pubsub></iq>",
            )
            .await
            .expect("retrieve");

        let reply = harness.drain().pop().expect("reply");
        assert!(subscriptions_of(&reply).is_empty());
    }
}
