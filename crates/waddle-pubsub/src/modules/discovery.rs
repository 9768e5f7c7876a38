//! Service and node discovery (XEP-0030 on a pub/sub service).

use async_trait::async_trait;
use tracing::debug;

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::{
    build_disco_info_query, build_disco_items_query, DiscoItem, Feature, Identity, DISCO_INFO_NS,
    DISCO_ITEMS_NS,
};
use crate::error::PubSubError;
use crate::node::NodeType;
use crate::outbound::StanzaSender;
use crate::stanzas::{node_attr, Stanza};

pub struct DiscoveryModule;

#[async_trait]
impl PubSubModule for DiscoveryModule {
    fn name(&self) -> &'static str {
        "DiscoveryModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "get")
            .child(Criteria::or([
                ElementCriteria::name("query").attr("xmlns", DISCO_INFO_NS),
                ElementCriteria::name("query").attr("xmlns", DISCO_ITEMS_NS),
            ]))
            .into()
    }

    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let (query, is_info) = match element.get_child("query", DISCO_INFO_NS) {
            Some(query) => (query, true),
            None => match element.get_child("query", DISCO_ITEMS_NS) {
                Some(query) => (query, false),
                None => return Err(PubSubError::bad_request(element)),
            },
        };

        let payload = match node_attr(query) {
            None => {
                let entry = ctx
                    .disco
                    .get(stanza.service())
                    .ok_or_else(|| PubSubError::item_not_found(element))?;
                if is_info {
                    build_disco_info_query(&[entry.identity], &entry.features, None)
                } else {
                    build_disco_items_query(&entry.items, None)
                }
            }
            Some(name) => {
                let node = ctx.require_node(stanza, &name).await?;
                if is_info {
                    let config = node.config();
                    let identity = match node.kind() {
                        NodeType::Leaf => Identity::pubsub_leaf(config.title()),
                        NodeType::Collection => Identity::pubsub_collection(config.title()),
                    };
                    build_disco_info_query(&[identity], &[Feature::pubsub()], Some(&name))
                } else {
                    let service = stanza.service().to_string();
                    let items: Vec<DiscoItem> = ctx
                        .repository
                        .get_item_ids(&node)
                        .await
                        .map_err(storage_error(stanza))?
                        .iter()
                        .map(|id| DiscoItem::new(&service, Some(id), None))
                        .collect();
                    build_disco_items_query(&items, Some(&name))
                }
            }
        };

        debug!(service = %stanza.service(), info = is_info, "Answering disco query");
        out.reply(stanza.result(Some(payload))).await;
        Ok(())
    }
}
