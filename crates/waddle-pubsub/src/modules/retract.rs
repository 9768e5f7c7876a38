//! Retracting published items.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::node::NodeType;
use crate::outbound::StanzaSender;
use crate::stanzas::{node_attr, Stanza, NS_PUBSUB};

pub struct RetractItemModule;

#[async_trait]
impl PubSubModule for RetractItemModule {
    fn name(&self) -> &'static str {
        "RetractItemModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "set")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("retract")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("retract-items")]
    }

    #[instrument(skip(self, ctx, stanza, out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let retract = stanza
            .pubsub(NS_PUBSUB)
            .and_then(|p| p.get_child("retract", NS_PUBSUB))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = node_attr(retract)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("node-required"))?;
        let node = ctx.require_node(stanza, &name).await?;

        if node.kind() == NodeType::Collection {
            return Err(PubSubError::feature_not_implemented(element)
                .with_unsupported("retract-items"));
        }

        if !node.affiliations().get(&stanza.sender()).can_delete_items() {
            return Err(PubSubError::forbidden(element));
        }

        if !node.config().persist_items() {
            return Err(PubSubError::feature_not_implemented(element)
                .with_unsupported("persistent-items"));
        }

        let mut ids = Vec::new();
        for item in retract.children().filter(|c| c.is("item", NS_PUBSUB)) {
            match item.attr("id").filter(|id| !id.is_empty()) {
                Some(id) => ids.push(id.to_string()),
                None => {
                    return Err(
                        PubSubError::bad_request(element).with_condition("item-required")
                    )
                }
            }
        }
        if ids.is_empty() {
            return Err(PubSubError::bad_request(element).with_condition("item-required"));
        }

        for id in &ids {
            let existed = ctx
                .repository
                .delete_item(&node, id)
                .await
                .map_err(storage_error(stanza))?;
            debug!(node = %name, item = %id, existed, "Item retracted");
        }

        ctx.notifier.items_retracted(&node, &ids).await;

        out.reply(stanza.result(None)).await;
        Ok(())
    }
}
