//! Default node configuration retrieval.

use async_trait::async_trait;
use minidom::Element;

use super::{ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::node::NodeConfig;
use crate::outbound::StanzaSender;
use crate::stanzas::{Stanza, NS_PUBSUB_OWNER};

pub struct DefaultConfigModule;

#[async_trait]
impl PubSubModule for DefaultConfigModule {
    fn name(&self) -> &'static str {
        "DefaultConfigModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "get")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB_OWNER)
                    .child(ElementCriteria::name("default")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("retrieve-default")]
    }

    async fn process(
        &self,
        _ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let payload = Element::builder("pubsub", NS_PUBSUB_OWNER)
            .append(
                Element::builder("default", NS_PUBSUB_OWNER)
                    .append(NodeConfig::leaf().to_form().to_element())
                    .build(),
            )
            .build();
        out.reply(stanza.result(Some(payload))).await;
        Ok(())
    }
}
