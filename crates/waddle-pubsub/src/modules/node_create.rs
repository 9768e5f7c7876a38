//! Node creation, including instant nodes.

use async_trait::async_trait;
use minidom::Element;
use tracing::instrument;

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::form::{DataForm, FormType};
use crate::node::{NodeConfig, NodeType, FIELD_NODE_TYPE};
use crate::outbound::StanzaSender;
use crate::stanzas::{generate_id, node_attr, Stanza, NS_PUBSUB};

pub struct NodeCreateModule;

/// Reject a submitted configuration that asks for a collection node.
pub(crate) fn reject_collection(stanza: &Element, form: &DataForm) -> Result<(), PubSubError> {
    if form.value(FIELD_NODE_TYPE).and_then(NodeType::from_str) == Some(NodeType::Collection) {
        return Err(PubSubError::feature_not_implemented(stanza)
            .with_unsupported("collections")
            .with_unsupported("multi-collection"));
    }
    Ok(())
}

#[async_trait]
impl PubSubModule for NodeCreateModule {
    fn name(&self) -> &'static str {
        "NodeCreateModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("iq")
            .attr("type", "set")
            .child(
                ElementCriteria::name("pubsub")
                    .attr("xmlns", NS_PUBSUB)
                    .child(ElementCriteria::name("create")),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![
            Feature::pubsub_feature("create-nodes"),
            Feature::pubsub_feature("instant-nodes"),
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
        let pubsub = stanza
            .pubsub(NS_PUBSUB)
            .ok_or_else(|| PubSubError::bad_request(element))?;
        let create = pubsub
            .get_child("create", NS_PUBSUB)
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let requested = node_attr(create);
        let instant = requested.is_none();
        let name = requested.unwrap_or_else(generate_id);

        let existing = ctx
            .repository
            .get_node(stanza.service(), &name)
            .await
            .map_err(storage_error(stanza))?;
        if existing.is_some() {
            return Err(PubSubError::conflict(element));
        }

        let mut config = NodeConfig::leaf();
        let submitted = pubsub
            .get_child("configure", NS_PUBSUB)
            .and_then(DataForm::find_in)
            .filter(|form| form.form_type == FormType::Submit);
        if let Some(ref form) = submitted {
            reject_collection(element, form)?;
            config.merge_from(form);
        }

        ctx.repository
            .create_node(stanza.service(), &name, &stanza.sender(), config, None)
            .await
            .map_err(storage_error(stanza))?;

        let payload = instant.then(|| {
            Element::builder("pubsub", NS_PUBSUB)
                .append(
                    Element::builder("create", NS_PUBSUB)
                        .attr("node", name.as_str())
                        .build(),
                )
                .build()
        });
        out.reply(stanza.result(payload)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;
    use crate::modules::test_support::{jid, Harness, SERVICE};
    use crate::node::AccessModel;
    use crate::types::Affiliation;

    #[tokio::test]
    async fn test_create_named_node() {
        let mut harness = Harness::new();
        harness
            .run(
                &NodeCreateModule,
                "<iq xmlns='jabber:client' type='set' id='c1' from='alice@example.com/desk' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='news'/></pubsub></iq>",
            )
            .await
            .expect("create");

        let reply = harness.drain().pop().expect("reply");
        assert_eq!(reply.attr("type"), Some("result"));
        assert!(reply.get_child("pubsub", NS_PUBSUB).is_none());

        let node = harness
            .ctx
            .repository
            .get_node(&jid(SERVICE), "news")
            .await
            .expect("lookup")
            .expect("created");
        assert_eq!(
            node.affiliations().get(&jid("alice@example.com")),
            Affiliation::Owner
        );
    }

    #[tokio::test]
    async fn test_instant_node_echoes_name() {
        let mut harness = Harness::new();
        harness
            .run(
                &NodeCreateModule,
                "<iq xmlns='jabber:client' type='set' id='c2' from='alice@example.com/desk' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><create/></pubsub></iq>",
            )
            .await
            .expect("create");

        let reply = harness.drain().pop().expect("reply");
        let name = reply
            .get_child("pubsub", NS_PUBSUB)
            .and_then(|p| p.get_child("create", NS_PUBSUB))
            .and_then(|c| c.attr("node"))
            .expect("instant node name")
            .to_string();
        assert_eq!(name.len(), 32);
        assert!(harness
            .ctx
            .repository
            .get_node(&jid(SERVICE), &name)
            .await
            .expect("lookup")
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_is_conflict() {
        let (harness, _node) = Harness::with_node("news").await;
        let err = harness
            .run(
                &NodeCreateModule,
                "<iq xmlns='jabber:client' type='set' id='c3' from='bob@example.com/home' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='news'/></pubsub></iq>",
            )
            .await
            .expect_err("exists");
        assert_eq!(err.condition(), StanzaErrorCondition::Conflict);
    }

    #[tokio::test]
    async fn test_create_with_configuration() {
        let harness = Harness::new();
        harness
            .run(
                &NodeCreateModule,
                "<iq xmlns='jabber:client' type='set' id='c4' from='alice@example.com/desk' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='private'/><configure><x xmlns='jabber:x:data' type='submit'><field var='FORM_TYPE' type='hidden'><value>http://jabber.org/protocol/pubsub#node_config</value></field><field var='pubsub#access_model'><value>whitelist</value></field></x></configure></pubsub></iq>",
            )
            .await
            .expect("create");

        let node = harness
            .ctx
            .repository
            .get_node(&jid(SERVICE), "private")
            .await
            .expect("lookup")
            .expect("created");
        assert_eq!(node.config().access_model(), Some(AccessModel::Whitelist));
        assert!(node.config().persist_items());
    }

    #[tokio::test]
    async fn test_collection_is_not_implemented() {
        let harness = Harness::new();
        let err = harness
            .run(
                &NodeCreateModule,
                "<iq xmlns='jabber:client' type='set' id='c5' from='alice@example.com/desk' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='all'/><configure><x xmlns='jabber:x:data' type='submit'><field var='pubsub#node_type'><value>collection</value></field></x></configure></pubsub></iq>",
            )
            .await
            .expect_err("collections unsupported");
        assert_eq!(err.condition(), StanzaErrorCondition::FeatureNotImplemented);
        assert!(err.has_condition("unsupported"));
        assert!(harness
            .ctx
            .repository
            .get_node(&jid(SERVICE), "all")
            .await
            .expect("lookup")
            .is_none());
    }
}
