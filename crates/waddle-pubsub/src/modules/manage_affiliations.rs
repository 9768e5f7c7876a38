//! Owner management of node affiliations.

use async_trait::async_trait;
use jid::BareJid;
use minidom::Element;
use tracing::{debug, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::outbound::StanzaSender;
use crate::stanzas::{jid_attr, node_attr, Stanza, NS_PUBSUB_OWNER};
use crate::types::Affiliation;

pub struct ManageAffiliationsModule;

/// Parse every `<affiliation/>` child before anything is changed.
fn parse_changes(
    stanza: &Element,
    request: &Element,
) -> Result<Vec<(BareJid, Affiliation)>, PubSubError> {
    request
        .children()
        .map(|child| {
            if !child.is("affiliation", NS_PUBSUB_OWNER) {
                return Err(PubSubError::bad_request(stanza));
            }
            let jid = jid_attr(child).ok_or_else(|| PubSubError::bad_request(stanza))?;
            let affiliation = child
                .attr("affiliation")
                .and_then(|a| a.parse::<Affiliation>().ok())
                .ok_or_else(|| PubSubError::bad_request(stanza))?;
            Ok((jid, affiliation))
        })
        .collect()
}

#[async_trait]
impl PubSubModule for ManageAffiliationsModule {
    fn name(&self) -> &'static str {
        "ManageAffiliationsModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB_OWNER)
                    .child(ElementCriteria::name("affiliations")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("manage-affiliations")]
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
            .and_then(|p| p.get_child("affiliations", NS_PUBSUB_OWNER))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let stanza_type = stanza.stanza_type();
        if stanza_type != "get" && stanza_type != "set" {
            return Err(PubSubError::bad_request(element));
        }

        let name = node_attr(request)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("node-required"))?;
        let node = ctx.require_node(stanza, &name).await?;

        let affiliations = node.affiliations();
        if affiliations.get(&stanza.sender()) != Affiliation::Owner {
            return Err(PubSubError::forbidden(element));
        }

        if stanza_type == "get" {
            let mut entries = affiliations.all();
            entries.sort_by_key(|a| a.jid.to_string());
            let list = entries.into_iter().map(|ua| {
                Element::builder("affiliation", NS_PUBSUB_OWNER)
                    .attr("jid", ua.jid.to_string())
                    .attr("affiliation", ua.affiliation.as_str())
                    .build()
            });
            let payload = Element::builder("pubsub", NS_PUBSUB_OWNER)
                .append(
                    Element::builder("affiliations", NS_PUBSUB_OWNER)
                        .attr("node", name.as_str())
                        .append_all(list)
                        .build(),
                )
                .build();
            out.reply(stanza.result(Some(payload))).await;
            return Ok(());
        }

        let changes = parse_changes(element, request)?;
        for (jid, affiliation) in &changes {
            let previous = affiliations.get(jid);
            if previous == Affiliation::None && *affiliation != Affiliation::None {
                affiliations.add(jid.clone(), *affiliation);
            } else {
                affiliations.change(jid, *affiliation);
            }
            debug!(node = %name, jid = %jid, %previous, %affiliation, "Affiliation changed");
        }

        ctx.repository
            .update_affiliations(&node, affiliations)
            .await
            .map_err(storage_error(stanza))?;

        for (jid, affiliation) in &changes {
            ctx.notifier
                .affiliation_changed(&node, jid, *affiliation)
                .await;
        }

        out.reply(stanza.result(None)).await;
        Ok(())
    }
}
