//! Purging every item of a node (owner namespace).

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::node::NodeType;
use crate::outbound::StanzaSender;
use crate::stanzas::{node_attr, Stanza, NS_PUBSUB_OWNER};

pub struct PurgeItemsModule;

#[async_trait]
impl PubSubModule for PurgeItemsModule {
    fn name(&self) -> &'static str {
        "PurgeItemsModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "set")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB_OWNER)
                    .child(ElementCriteria::name("purge")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("purge-nodes")]
    }

    #[instrument(skip(self, ctx, stanza, out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let purge = stanza
            .pubsub(NS_PUBSUB_OWNER)
            .and_then(|p| p.get_child("purge", NS_PUBSUB_OWNER))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = node_attr(purge)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("node-required"))?;
        let node = ctx.require_node(stanza, &name).await?;

        if node.kind() == NodeType::Collection {
            return Err(PubSubError::feature_not_implemented(element)
                .with_unsupported("purge-nodes"));
        }

        if !node.affiliations().get(&stanza.sender()).can_purge() {
            return Err(PubSubError::forbidden(element));
        }

        if !node.config().persist_items() {
            return Err(PubSubError::feature_not_implemented(element)
                .with_unsupported("persistent-items"));
        }

        ctx.notifier.node_purged(&node).await;

        let purged = ctx
            .repository
            .purge_items(&node)
            .await
            .map_err(storage_error(stanza))?;
        info!(node = %name, purged, "Node purged");

        out.reply(stanza.result(None)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;
    use crate::form::FormField;
    use crate::modules::test_support::{jid, Harness};
    use crate::node::FIELD_PERSIST_ITEMS;
    use crate::stanzas::NS_PUBSUB_EVENT;
    use crate::types::{Affiliation, Subscription};

    const PURGE: &str = "<iq xmlns='jabber:client' type='set' id='purge1' from='alice@example.com/desk' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub#owner'><purge node='news'/></pubsub></iq>";

    #[tokio::test]
    async fn test_purge_removes_items() {
        let (mut harness, node) = Harness::with_node("news").await;
        node.subscriptions()
            .add_subscriber_jid(jid("bob@example.com"), Subscription::Subscribed);
        for id in ["i1", "i2", "i3"] {
            harness
                .ctx
                .repository
                .write_item(&node, id, &jid("alice@example.com"), "<item/>")
                .await
                .expect("write");
        }

        harness.run(&PurgeItemsModule, PURGE).await.expect("purge");

        assert!(harness
            .ctx
            .repository
            .get_item_ids(&node)
            .await
            .expect("ids")
            .is_empty());
        let sent = harness.drain();
        let event = sent.first().expect("purge notification first");
        assert!(event
            .get_child("event", NS_PUBSUB_EVENT)
            .and_then(|e| e.get_child("purge", NS_PUBSUB_EVENT))
            .is_some());
    }

    #[tokio::test]
    async fn test_admin_cannot_purge() {
        let (harness, node) = Harness::with_node("news").await;
        node.affiliations()
            .add(jid("bob@example.com"), Affiliation::Admin);

        let err = harness
            .run(
                &PurgeItemsModule,
                &PURGE.replace("alice@example.com/desk", "bob@example.com/home"),
            )
            .await
            .expect_err("admin");
        assert_eq!(err.condition(), StanzaErrorCondition::Forbidden);
    }

    #[tokio::test]
    async fn test_transient_node_unsupported() {
        let (harness, node) = Harness::with_node("news").await;
        harness
            .ctx
            .repository
            .set_config_field(&node, FormField::boolean(FIELD_PERSIST_ITEMS, "", false))
            .await
            .expect("configure");

        let err = harness
            .run(&PurgeItemsModule, PURGE)
            .await
            .expect_err("nothing to purge");
        assert_eq!(err.condition(), StanzaErrorCondition::FeatureNotImplemented);
        assert!(err.has_condition("unsupported"));
    }
}
