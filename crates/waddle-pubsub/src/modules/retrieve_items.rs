//! Retrieving published items.

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, instrument, warn};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::access::check_access;
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::outbound::StanzaSender;
use crate::storage::StoredItem;
use crate::stanzas::{node_attr, Stanza, NS_PUBSUB};

pub struct RetrieveItemsModule;

fn parse_stored(item: &StoredItem) -> Option<Element> {
    match item.data.parse::<Element>() {
        Ok(element) => Some(element),
        Err(e) => {
            warn!(item = %item.item_id, error = %e, "Stored item is not valid XML");
            None
        }
    }
}

#[async_trait]
impl PubSubModule for RetrieveItemsModule {
    fn name(&self) -> &'static str {
        "RetrieveItemsModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "get")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("items")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("retrieve-items")]
    }

    #[instrument(skip(self, ctx, stanza, out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let items = stanza
            .pubsub(NS_PUBSUB)
            .and_then(|p| p.get_child("items", NS_PUBSUB))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = node_attr(items)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("node-required"))?;
        let node = check_access(
            &ctx.repository,
            element,
            stanza.service(),
            &name,
            &stanza.sender(),
        )
        .await?;

        let mut requested = Vec::new();
        for child in items.children() {
            match child.attr("id") {
                Some(id) if child.is("item", NS_PUBSUB) && !id.is_empty() => {
                    requested.push(id.to_string())
                }
                _ => return Err(PubSubError::bad_request(element)),
            }
        }

        let mut found = Vec::new();
        if requested.is_empty() {
            let max_items = items.attr("max_items").and_then(|m| m.trim().parse().ok());
            let stored = ctx
                .repository
                .query_items(&node, max_items)
                .await
                .map_err(storage_error(stanza))?;
            found.extend(stored.iter().filter_map(parse_stored));
        } else {
            for id in &requested {
                let stored = ctx
                    .repository
                    .get_item(&node, id)
                    .await
                    .map_err(storage_error(stanza))?;
                match stored {
                    Some(item) => found.extend(parse_stored(&item)),
                    None => warn!(node = %name, item = %id, "Requested item not found"),
                }
            }
        }

        debug!(node = %name, count = found.len(), "Items retrieved");

        let payload = Element::builder("pubsub", NS_PUBSUB)
            .append(
                Element::builder("items", NS_PUBSUB)
                    .attr("node", name.as_str())
                    .append_all(found)
                    .build(),
            )
            .build();
        out.reply(stanza.result(Some(payload))).await;
        Ok(())
    }
}
