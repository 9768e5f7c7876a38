//! A requester's own affiliations, per node or across the service.

use async_trait::async_trait;
use minidom::Element;
use tracing::instrument;

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::outbound::StanzaSender;
use crate::stanzas::{node_attr, Stanza, NS_PUBSUB};
use crate::types::Affiliation;

pub struct RetrieveAffiliationsModule;

fn affiliation_element(node: &str, affiliation: Affiliation) -> Element {
    Element::builder("affiliation", NS_PUBSUB)
        .attr("node", node)
        .attr("affiliation", affiliation.as_str())
        .build()
}

#[async_trait]
impl PubSubModule for RetrieveAffiliationsModule {
    fn name(&self) -> &'static str {
        "RetrieveAffiliationsModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "get")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("affiliations")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![
            Feature::pubsub_feature("retrieve-affiliations"),
            Feature::pubsub_feature("outcast-affiliation"),
            Feature::pubsub_feature("member-affiliation"),
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
            .pubsub(NS_PUBSUB)
            .and_then(|p| p.get_child("affiliations", NS_PUBSUB))
            .ok_or_else(|| PubSubError::bad_request(element))?;
        let sender = stanza.sender();

        let entries: Vec<Element> = match node_attr(request) {
            None => ctx
                .repository
                .get_user_affiliations(stanza.service(), &sender)
                .await
                .map_err(storage_error(stanza))?
                .into_iter()
                .filter(|a| a.affiliation != Affiliation::None)
                .map(|a| affiliation_element(&a.node, a.affiliation))
                .collect(),
            Some(name) => {
                let node = ctx.require_node(stanza, &name).await?;
                let affiliation = node.affiliations().get(&sender);
                if affiliation == Affiliation::None {
                    Vec::new()
                } else {
                    vec![affiliation_element(&name, affiliation)]
                }
            }
        };

        let mut affiliations = Element::builder("affiliations", NS_PUBSUB);
        if let Some(name) = node_attr(request) {
            affiliations = affiliations.attr("node", name);
        }
        let payload = Element::builder("pubsub", NS_PUBSUB)
            .append(affiliations.append_all(entries).build())
            .build();
        out.reply(stanza.result(Some(payload))).await;
        Ok(())
    }
}
