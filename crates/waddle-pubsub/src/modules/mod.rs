//! Pub/sub operation handlers.
//!
//! One module per XEP-0060 use case. Every module declares the stanzas it
//! accepts as [`Criteria`], the disco features it adds, and processes a
//! matched stanza against the shared [`ModuleContext`].
//!
//! Handlers validate first and only then touch ledgers, storage, or the
//! notification service; a validation failure leaves no side effects.

use std::sync::Arc;

use async_trait::async_trait;

use crate::criteria::Criteria;
use crate::disco::{DiscoRegistry, Feature};
use crate::error::{PubSubError, RepositoryError};
use crate::notify::NotificationService;
use crate::outbound::StanzaSender;
use crate::repository::{Node, PubSubRepository};
use crate::stanzas::Stanza;

pub mod default_config;
pub mod discovery;
pub mod manage_affiliations;
pub mod manage_subscriptions;
pub mod node_config;
pub mod node_create;
pub mod node_delete;
pub mod pending_subscription;
pub mod publish;
pub mod purge;
pub mod retract;
pub mod retrieve_affiliations;
pub mod retrieve_items;
pub mod retrieve_subscriptions;
pub mod subscribe;
pub mod unsubscribe;

pub use default_config::DefaultConfigModule;
pub use discovery::DiscoveryModule;
pub use manage_affiliations::ManageAffiliationsModule;
pub use manage_subscriptions::ManageSubscriptionsModule;
pub use node_config::NodeConfigModule;
pub use node_create::NodeCreateModule;
pub use node_delete::NodeDeleteModule;
pub use pending_subscription::PendingSubscriptionModule;
pub use publish::PublishItemModule;
pub use purge::PurgeItemsModule;
pub use retract::RetractItemModule;
pub use retrieve_affiliations::RetrieveAffiliationsModule;
pub use retrieve_items::RetrieveItemsModule;
pub use retrieve_subscriptions::RetrieveSubscriptionsModule;
pub use subscribe::SubscribeNodeModule;
pub use unsubscribe::UnsubscribeNodeModule;

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct ModuleContext {
    pub repository: Arc<PubSubRepository>,
    pub notifier: Arc<dyn NotificationService>,
    pub disco: Arc<DiscoRegistry>,
}

impl ModuleContext {
    pub fn new(
        repository: Arc<PubSubRepository>,
        notifier: Arc<dyn NotificationService>,
        disco: Arc<DiscoRegistry>,
    ) -> Self {
        Self {
            repository,
            notifier,
            disco,
        }
    }

    /// Resolve a node on the stanza's service, or fail with `item-not-found`.
    pub async fn require_node(&self, stanza: &Stanza, name: &str) -> Result<Arc<Node>, PubSubError> {
        self.repository
            .get_node(stanza.service(), name)
            .await
            .map_err(storage_error(stanza))?
            .ok_or_else(|| PubSubError::item_not_found(stanza.element()))
    }
}

/// A pub/sub operation handler.
#[async_trait]
pub trait PubSubModule: Send + Sync + 'static {
    /// Unique module name used for registration.
    fn name(&self) -> &'static str;

    /// Stanzas this module handles.
    fn criteria(&self) -> Criteria;

    /// Disco features advertised on behalf of this module.
    fn features(&self) -> Vec<Feature> {
        Vec::new()
    }

    /// Handle a matched stanza, sending replies through `out`.
    async fn process(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> Result<(), PubSubError>;
}

/// Map a repository failure to `internal-server-error` for `stanza`.
pub(crate) fn storage_error(stanza: &Stanza) -> impl FnOnce(RepositoryError) -> PubSubError + '_ {
    move |e| PubSubError::internal_server_error(stanza.element(), e)
}

/// Every built-in module, in registration order.
pub fn default_modules() -> Vec<Box<dyn PubSubModule>> {
    vec![
        Box::new(DiscoveryModule),
        Box::new(NodeCreateModule),
        Box::new(NodeConfigModule),
        Box::new(NodeDeleteModule),
        Box::new(DefaultConfigModule),
        Box::new(SubscribeNodeModule),
        Box::new(UnsubscribeNodeModule),
        Box::new(PublishItemModule),
        Box::new(RetractItemModule),
        Box::new(PurgeItemsModule),
        Box::new(RetrieveItemsModule),
        Box::new(RetrieveAffiliationsModule),
        Box::new(ManageAffiliationsModule),
        Box::new(RetrieveSubscriptionsModule),
        Box::new(ManageSubscriptionsModule),
        Box::new(PendingSubscriptionModule),
    ]
}
