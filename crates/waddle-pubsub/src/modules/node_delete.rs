//! Node deletion (owner namespace).

use async_trait::async_trait;
use tracing::instrument;

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::outbound::StanzaSender;
use crate::stanzas::{node_attr, Stanza, NS_PUBSUB_OWNER};

pub struct NodeDeleteModule;

#[async_trait]
impl PubSubModule for NodeDeleteModule {
    fn name(&self) -> &'static str {
        "NodeDeleteModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "set")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB_OWNER)
                    .child(ElementCriteria::name("delete")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("delete-nodes")]
    }

    #[instrument(skip(self, ctx, stanza, out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let delete = stanza
            .pubsub(NS_PUBSUB_OWNER)
            .and_then(|p| p.get_child("delete", NS_PUBSUB_OWNER))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = node_attr(delete).ok_or_else(|| PubSubError::not_allowed(element))?;
        let node = ctx.require_node(stanza, &name).await?;

        if !node.affiliations().get(&stanza.sender()).can_delete_node() {
            return Err(PubSubError::forbidden(element));
        }

        if node.config().notify_delete() {
            ctx.notifier.node_deleted(&node).await;
        }

        ctx.repository
            .purge_items(&node)
            .await
            .map_err(storage_error(stanza))?;
        ctx.repository
            .delete_node(&node)
            .await
            .map_err(storage_error(stanza))?;

        out.reply(stanza.result(None)).await;
        Ok(())
    }
}
