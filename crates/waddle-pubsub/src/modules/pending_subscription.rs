//! Owner decisions on pending subscription requests.
//!
//! Owners answer the authorization form sent on a subscribe request to an
//! `authorize` node by submitting it back inside a `<message/>`.

use async_trait::async_trait;
use jid::BareJid;
use tracing::{debug, info, instrument};

use super::{storage_error, ModuleContext, PubSubModule};
use crate::criteria::{Criteria, ElementCriteria};
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::form::{DataForm, FormType, DATA_FORMS_NS};
use crate::outbound::StanzaSender;
use crate::stanzas::{Stanza, NS_PUBSUB_SUBSCRIBE_AUTHORIZATION};
use crate::types::{Affiliation, Subscription};

pub struct PendingSubscriptionModule;

const FIELD_SUBID: &str = "pubsub#subid";
const FIELD_NODE: &str = "pubsub#node";
const FIELD_SUBSCRIBER: &str = "pubsub#subscriber_jid";
const FIELD_ALLOW: &str = "pubsub#allow";

#[async_trait]
impl PubSubModule for PendingSubscriptionModule {
    fn name(&self) -> &'static str {
        "PendingSubscriptionModule"
    }

    fn criteria(&self) -> Criteria {
        ElementCriteria::name("message")
            .child(
                ElementCriteria::name("x")
                    .attr("xmlns", DATA_FORMS_NS)
                    .attr("type", "submit")
                    .child(
                        ElementCriteria::name("field").attr("var", "FORM_TYPE").child(
                            ElementCriteria::name("value").cdata(NS_PUBSUB_SUBSCRIBE_AUTHORIZATION),
                        ),
                    ),
            )
            .into()
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::pubsub_feature("get-pending")]
    }

    #[instrument(skip(self, ctx, stanza, _out), fields(service = %stanza.service(), from = %stanza.from()))]
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        _out: &StanzaSender,
    ) -> Result<(), PubSubError> {
        let element = stanza.element();
        let form = DataForm::find_in(element)
            .filter(|f| f.form_type == FormType::Submit)
            .ok_or_else(|| PubSubError::bad_request(element))?;

        let name = form
            .value(FIELD_NODE)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("node-required"))?;
        let node = ctx.require_node(stanza, name).await?;

        let affiliations = node.affiliations();
        if affiliations.get(&stanza.sender()) != Affiliation::Owner {
            return Err(PubSubError::forbidden(element));
        }

        let subscriber = form
            .value(FIELD_SUBSCRIBER)
            .and_then(|j| j.trim().parse::<BareJid>().ok())
            .ok_or_else(|| PubSubError::bad_request(element).with_condition("invalid-jid"))?;

        let subscriptions = node.subscriptions();
        if let Some(subid) = form.value(FIELD_SUBID).filter(|s| !s.is_empty()) {
            if subscriptions.subid(&subscriber).as_deref() != Some(subid) {
                return Err(PubSubError::not_acceptable(element).with_condition("invalid-subid"));
            }
        }

        if subscriptions.get(&subscriber) != Subscription::Pending {
            debug!(node = %name, subscriber = %subscriber, "No pending subscription, ignoring");
            return Ok(());
        }

        let decision = if form.bool_value(FIELD_ALLOW) {
            subscriptions.change(&subscriber, Subscription::Subscribed);
            let current = affiliations.get(&subscriber);
            affiliations.change(&subscriber, current.max_weight(Affiliation::Member));
            Subscription::Subscribed
        } else {
            subscriptions.change(&subscriber, Subscription::None);
            Subscription::None
        };

        ctx.repository
            .update_subscriptions(&node, subscriptions)
            .await
            .map_err(storage_error(stanza))?;
        ctx.repository
            .update_affiliations(&node, affiliations)
            .await
            .map_err(storage_error(stanza))?;

        info!(node = %name, subscriber = %subscriber, decision = %decision, "Pending subscription decided");
        ctx.notifier
            .subscription_decided(&node, &subscriber, decision)
            .await;
        Ok(())
    }
}
