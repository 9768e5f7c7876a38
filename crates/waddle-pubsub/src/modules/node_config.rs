//! Node configuration retrieval and update (owner namespace).

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, instrument};

use super::node_create::reject_collection;
use super::{storage_error, ModuleContext, PubSubModule};
use crate::access::check_node_access;
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::form::{DataForm, FormType};
use crate::outbound::StanzaSender;
use crate::stanzas::{node_attr, Stanza, NS_PUBSUB_OWNER};
use crate::types::Affiliation;

pub struct NodeConfigModule;

#[async_trait]
impl PubSubModule for NodeConfigModule {
    fn name(&self) -> &'static str {
        "NodeConfigModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB_OWNER)
                    .child(ElementCriteria::name("configure")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("config-node")]
    }

    #[instrument(skip(self, ctx, stanza, out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let configure = stanza
            .pubsub(NS_PUBSUB_OWNER)
            .and_then(|p| p.get_child("configure", NS_PUBSUB_OWNER))
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let stanza_type = stanza.stanza_type();
        if stanza_type != "get" && stanza_type != "set" {
            return Err(PubSubError::bad_request(element));
        }

        let name = node_attr(configure)
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("nodeid-required"))?;
        let node = ctx.require_node(stanza, &name).await?;
        let sender = stanza.sender();

        if stanza_type == "get" {
            check_node_access(&ctx.repository, element, &node, &sender).await?;

            let payload = Element::builder("pubsub", NS_PUBSUB_OWNER)
                .append(
                    Element::builder("configure", NS_PUBSUB_OWNER)
                        .attr("node", name.as_str())
                        .append(node.config().to_form().to_element())
                        .build(),
                )
                .build();
            out.reply(stanza.result(Some(payload))).await;
            return Ok(());
        }

        if node.affiliations().get(&sender) != Affiliation::Owner {
            return Err(PubSubError::forbidden(element));
        }

        let submitted = DataForm::find_in(configure);
        match submitted {
            Some(form) if form.form_type == FormType::Submit => {
                reject_collection(element, &form)?;
                ctx.repository
                    .update_node_config(&node, &form)
                    .await
                    .map_err(storage_error(stanza))?;

                if node.config().notify_config() {
                    ctx.notifier.configuration_changed(&node).await;
                }
            }
            Some(form) if form.form_type == FormType::Cancel => {
                debug!(node = %name, "Configuration cancelled");
            }
            _ => return Err(PubSubError::bad_request(element)),
        }

        out.reply(stanza.result(None)).await;
        Ok(())
    }
}
