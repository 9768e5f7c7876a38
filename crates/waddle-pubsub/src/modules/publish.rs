//! Publishing items to a leaf node.

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::node::{NodeType, PublishModel};
use crate::outbound::StanzaSender;
use crate::repository::Node;
use crate::stanzas::{generate_id, node_attr, Stanza, NS_PUBSUB};
use crate::types::{Affiliation, Subscription};

pub struct PublishItemModule;

/// Whether `affiliation` and `subscription` allow publishing under `model`.
fn may_publish(
    model: Option<PublishModel>,
    affiliation: Affiliation,
    subscription: Subscription,
) -> bool {
    if affiliation == Affiliation::Outcast {
        return false;
    }
    if affiliation.can_publish() {
        return true;
    }
    match model {
        Some(PublishModel::Open) => true,
        Some(PublishModel::Subscribers) => subscription == Subscription::Subscribed,
        Some(PublishModel::Publishers) | None => false,
    }
}

#[async_trait]
impl PubSubModule for PublishItemModule {
    fn name(&self) -> &'static str {
        "PublishItemModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "set")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("publish")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![
            Feature::pubsub_feature("publish"),
            Feature::pubsub_feature("publisher-affiliation"),
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
        let publish = stanza
            .pubsub(NS_PUBSUB)
            .and_then(|p| p.get_child("publish", NS_PUBSUB))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = node_attr(publish)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("node-required"))?;
        let node = ctx.require_node(stanza, &name).await?;

        if node.kind() == NodeType::Collection {
            return Err(PubSubError::feature_not_implemented(element).with_unsupported("publish"));
        }

        let config = node.config();
        let sender = stanza.sender();
        if !may_publish(
            config.publish_model(),
            node.affiliations().get(&sender),
            node.subscriptions().get(&sender),
        ) {
            return Err(PubSubError::forbidden(element));
        }

        let items: Vec<Element> = publish
            .children()
            .filter(|c| c.is("item", NS_PUBSUB))
            .map(|item| {
                let mut item = item.clone();
                if item.attr("id").map_or(true, str::is_empty) {
                    item.set_attr("id", generate_id());
                }
                item
            })
            .collect();

        if config.persist_items() {
            store_items(ctx, stanza, &node, &items).await?;
        }

        let mut published = Element::builder("publish", NS_PUBSUB).attr("node", name.as_str());
        for item in &items {
            let mut reply_item = Element::builder("item", NS_PUBSUB);
            if let Some(id) = item.attr("id") {
                reply_item = reply_item.attr("id", id);
            }
            published = published.append(reply_item.build());
        }
        let payload = Element::builder("pubsub", NS_PUBSUB)
            .append(published.build())
            .build();
        out.reply(stanza.result(Some(payload))).await;

        ctx.notifier.items_published(&node, &items).await;
        Ok(())
    }
}

async fn store_items(
    ctx: &ModuleContext,
    stanza: &Stanza,
    node: &Node,
    items: &[Element],
) -> Result<(), PubSubError> {
    let publisher = stanza.sender();
    for item in items {
        let id = item.attr("id").unwrap_or_default();
        ctx.repository
            .write_item(node, id, &publisher, &String::from(item))
            .await
            .map_err(storage_error(stanza))?;
        debug!(node = %node.name(), item = %id, "Item stored");
    }
    Ok(())
}
