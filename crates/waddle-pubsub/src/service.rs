//! Per-host pub/sub service actor.
//!
//! Each configured host runs one actor task that owns a [`Dispatcher`] and
//! drains a bounded mailbox of inbound stanzas. Stanzas are processed one at
//! a time in arrival order. All hosts of a process share one
//! [`PubSubRepository`].
//!
//! [`PubSubService::stop`] is signalled out of band through a
//! [`CancellationToken`]; stanzas still queued in the mailbox are abandoned.
//! [`PubSubService::drain`] closes the mailbox instead and returns once every
//! queued stanza has been handled.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use jid::{BareJid, Jid};
use minidom::Element;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::disco::{DiscoEntry, DiscoRegistry, Feature, Identity};
use crate::dispatcher::Dispatcher;
use crate::error::ServiceError;
use crate::modules::ModuleContext;
use crate::notify::StanzaNotifier;
use crate::outbound::StanzaSender;
use crate::repository::PubSubRepository;
use crate::stanzas::Stanza;

fn default_name() -> String {
    "Publish-Subscribe".to_string()
}

fn default_mailbox_size() -> usize {
    2048
}

/// Configuration of one pub/sub host.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service domain, e.g. `pubsub.example.com`. Must be set.
    #[serde(default)]
    pub host: String,

    /// Display name advertised in the disco identity.
    #[serde(default = "default_name")]
    pub name: String,

    /// Capacity of the inbound stanza mailbox.
    #[serde(default = "default_mailbox_size")]
    pub mailbox_size: usize,
}

impl ServiceConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: default_name(),
            mailbox_size: default_mailbox_size(),
        }
    }
}

/// Handle to a running pub/sub service.
pub struct PubSubService {
    host: BareJid,
    mailbox: mpsc::Sender<Element>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PubSubService {
    /// Register the host for discovery and spawn its actor.
    #[instrument(skip_all, fields(host = %config.host))]
    pub fn start(
        config: &ServiceConfig,
        repository: Arc<PubSubRepository>,
        disco: Arc<DiscoRegistry>,
        out: StanzaSender,
    ) -> Result<Self, ServiceError> {
        let host: BareJid = config
            .host
            .parse()
            .map_err(|_| ServiceError::InvalidHost(config.host.clone()))?;

        let dispatcher = Dispatcher::with_default_modules();
        let modules = dispatcher.len();
        let mut features = vec![Feature::pubsub()];
        features.extend(dispatcher.features());
        disco.register(
            host.clone(),
            DiscoEntry {
                identity: Identity::pubsub_service(Some(&config.name)),
                features,
                items: Vec::new(),
            },
        )?;

        let notifier = Arc::new(StanzaNotifier::new(out.clone()));
        let ctx = ModuleContext::new(repository, notifier, disco);

        let (mailbox, rx) = mpsc::channel(config.mailbox_size.max(1));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(
            host.clone(),
            dispatcher,
            ctx,
            rx,
            out,
            shutdown.clone(),
        ));

        info!(modules, "Pub/sub service started");
        Ok(Self {
            host,
            mailbox,
            shutdown,
            task,
        })
    }

    pub fn host(&self) -> &BareJid {
        &self.host
    }

    /// Queue a stanza, waiting while the mailbox is full.
    pub async fn process(&self, stanza: Element) -> Result<(), ServiceError> {
        self.mailbox
            .send(stanza)
            .await
            .map_err(|_| ServiceError::Closed(self.host.to_string()))
    }

    /// Queue a stanza without waiting.
    pub fn try_process(&self, stanza: Element) -> Result<(), ServiceError> {
        self.mailbox.try_send(stanza).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ServiceError::MailboxFull(self.host.to_string()),
            mpsc::error::TrySendError::Closed(_) => ServiceError::Closed(self.host.to_string()),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Close the mailbox and wait until every queued stanza is handled.
    pub async fn drain(self) {
        let Self { host, mailbox, task, .. } = self;
        drop(mailbox);
        if let Err(e) = task.await {
            warn!(host = %host, error = %e, "Pub/sub service task failed");
        }
    }

    /// Signal shutdown and wait for the actor to finish.
    ///
    /// Stanzas still in the mailbox are not processed.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(host = %self.host, error = %e, "Pub/sub service task failed");
        }
    }
}

async fn run(
    host: BareJid,
    dispatcher: Dispatcher,
    ctx: ModuleContext,
    mut rx: mpsc::Receiver<Element>,
    out: StanzaSender,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(host = %host, "Shutdown requested");
                break;
            }
            next = rx.recv() => {
                let Some(element) = next else {
                    break;
                };
                match Stanza::parse(element) {
                    Ok(stanza) => {
                        dispatcher.dispatch(&ctx, &stanza, &out).await;
                    }
                    Err(e) => {
                        debug!(host = %host, error = %e, "Rejecting unaddressed stanza");
                        out.reply(e.to_stanza()).await;
                    }
                }
            }
        }
    }

    ctx.disco.unregister(&host);
    info!(host = %host, "Pub/sub service stopped");
}

/// Every pub/sub service of a process, keyed by host.
#[derive(Default)]
pub struct PubSubComponents {
    services: HashMap<BareJid, PubSubService>,
}

impl PubSubComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start one service per configuration, sharing the repository and
    /// discovery.
    pub fn start(
        configs: &[ServiceConfig],
        repository: Arc<PubSubRepository>,
        disco: Arc<DiscoRegistry>,
        out: StanzaSender,
    ) -> Result<Self, ServiceError> {
        let mut components = Self::new();
        for config in configs {
            let service =
                PubSubService::start(config, repository.clone(), disco.clone(), out.clone())?;
            components
                .services
                .insert(service.host().clone(), service);
        }
        Ok(components)
    }

    pub fn hosts(&self) -> Vec<BareJid> {
        self.services.keys().cloned().collect()
    }

    pub fn get(&self, host: &BareJid) -> Option<&PubSubService> {
        self.services.get(host)
    }

    /// Hand a stanza to the service named by its `to` address.
    ///
    /// Returns `Ok(false)` when no service serves that host.
    pub async fn route(&self, stanza: Element) -> Result<bool, ServiceError> {
        let host = stanza
            .attr("to")
            .and_then(|to| to.parse::<Jid>().ok())
            .map(|jid| jid.to_bare());
        match host.as_ref().and_then(|h| self.services.get(h)) {
            Some(service) => {
                service.process(stanza).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Let every service finish its queued stanzas, concurrently.
    pub async fn drain(self) {
        let count = self.services.len();
        join_all(self.services.into_values().map(PubSubService::drain)).await;
        info!(services = count, "Pub/sub services drained");
    }

    /// Stop every service concurrently.
    pub async fn shutdown(self) {
        let count = self.services.len();
        join_all(self.services.into_values().map(PubSubService::stop)).await;
        info!(services = count, "Pub/sub services stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::disco::DISCO_INFO_NS;
    use crate::stanzas::NS_PUBSUB;
    use crate::storage::InMemoryPubSubStorage;

    async fn next(rx: &mut mpsc::Receiver<Element>) -> Element {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("reply in time")
            .expect("channel open")
    }

    fn repository() -> Arc<PubSubRepository> {
        Arc::new(PubSubRepository::new(Arc::new(InMemoryPubSubStorage::new())))
    }

    fn create_xml(id: &str, host: &str, node: &str) -> Element {
        format!("<iq xmlns='jabber:client' type='set' id='{id}' from='alice@example.com/desk' to='{host}'><pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='{node}'/></pubsub></iq>")
            .parse()
            .expect("valid XML")
    }

    fn start(host: &str, disco: Arc<DiscoRegistry>) -> (PubSubService, mpsc::Receiver<Element>) {
        let (out, rx) = StanzaSender::channel(64);
        let service = PubSubService::start(
            &ServiceConfig::new(host),
            repository(),
            disco,
            out,
        )
        .expect("service starts");
        (service, rx)
    }

    #[test]
    fn test_config_defaults() {
        let config: ServiceConfig = toml::from_str("host = 'pubsub.example.com'").expect("parse");
        assert_eq!(config.name, "Publish-Subscribe");
        assert_eq!(config.mailbox_size, 2048);
    }

    #[tokio::test]
    async fn test_disco_registration_lifecycle() {
        let disco = Arc::new(DiscoRegistry::new());
        let (service, mut rx) = start("pubsub.example.com", disco.clone());
        let host: BareJid = "pubsub.example.com".parse().expect("valid JID");
        assert!(disco.is_registered(&host));

        service
            .process(
                "<iq xmlns='jabber:client' type='get' id='d1' from='bob@example.com/home' to='pubsub.example.com'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>"
                    .parse()
                    .expect("valid XML"),
            )
            .await
            .expect("queued");

        let reply = next(&mut rx).await;
        let query = reply
            .get_child("query", DISCO_INFO_NS)
            .expect("disco#info query");
        let features: Vec<_> = query
            .children()
            .filter(|c| c.name() == "feature")
            .filter_map(|c| c.attr("var"))
            .collect();
        assert!(features.contains(&NS_PUBSUB));
        assert!(features.contains(&"http://jabber.org/protocol/pubsub#publish"));

        service.stop().await;
        assert!(!disco.is_registered(&host));
    }

    #[tokio::test]
    async fn test_duplicate_host_rejected() {
        let disco = Arc::new(DiscoRegistry::new());
        let (service, _rx) = start("pubsub.example.com", disco.clone());

        let (out, _rx2) = StanzaSender::channel(4);
        let second = PubSubService::start(
            &ServiceConfig::new("pubsub.example.com"),
            repository(),
            disco,
            out,
        );
        assert!(matches!(second, Err(ServiceError::AlreadyRegistered(_))));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stanzas_processed_in_order() {
        let disco = Arc::new(DiscoRegistry::new());
        let (service, mut rx) = start("pubsub.example.com", disco);

        for id in ["c1", "c2"] {
            service
                .process(
                    format!("<iq xmlns='jabber:client' type='set' id='{id}' from='alice@example.com/desk' to='pubsub.example.com'><pubsub xmlns='http://jabber.org/protocol/pubsub'><create node='news'/></pubsub></iq>")
                        .parse()
                        .expect("valid XML"),
                )
                .await
                .expect("queued");
        }

        let first = next(&mut rx).await;
        assert_eq!(first.attr("id"), Some("c1"));
        assert_eq!(first.attr("type"), Some("result"));
        let second = next(&mut rx).await;
        assert_eq!(second.attr("id"), Some("c2"));
        assert_eq!(second.attr("type"), Some("error"));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_components_route_by_host() {
        let disco = Arc::new(DiscoRegistry::new());
        let (out, mut rx) = StanzaSender::channel(16);
        let components = PubSubComponents::start(
            &[
                ServiceConfig::new("pubsub.example.com"),
                ServiceConfig::new("pubsub.example.org"),
            ],
            repository(),
            disco.clone(),
            out,
        )
        .expect("start");
        assert_eq!(components.hosts().len(), 2);

        let routed = components
            .route(
                "<iq xmlns='jabber:client' type='get' id='d2' from='bob@example.com/home' to='pubsub.example.org'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>"
                    .parse()
                    .expect("valid XML"),
            )
            .await
            .expect("route");
        assert!(routed);
        assert_eq!(next(&mut rx).await.attr("from"), Some("pubsub.example.org"));

        let unknown = components
            .route(
                "<iq xmlns='jabber:client' type='get' id='d3' from='bob@example.com/home' to='elsewhere.example.net'/>"
                    .parse()
                    .expect("valid XML"),
            )
            .await
            .expect("route");
        assert!(!unknown);

        components.shutdown().await;
        assert!(!disco.is_registered(&"pubsub.example.com".parse().expect("valid JID")));
    }

    #[tokio::test]
    async fn test_mailbox_closed_after_stop() {
        let disco = Arc::new(DiscoRegistry::new());
        let (service, mut rx) = start("pubsub.example.com", disco);
        service
            .try_process(
                "<iq xmlns='jabber:client' type='get' id='d4' from='bob@example.com/home' to='pubsub.example.com'><query xmlns='http://jabber.org/protocol/disco#items'/></iq>"
                    .parse()
                    .expect("valid XML"),
            )
            .expect("queued");
        assert_eq!(next(&mut rx).await.attr("type"), Some("result"));

        let mailbox = service.mailbox.clone();
        service.stop().await;

        let err = mailbox
            .try_send(Element::builder("iq", "jabber:client").build())
            .expect_err("actor gone");
        assert!(matches!(err, mpsc::error::TrySendError::Closed(_)));
    }

    #[tokio::test]
    async fn test_components_share_repository() {
        let repository = repository();
        let (out, mut rx) = StanzaSender::channel(16);
        let components = PubSubComponents::start(
            &[
                ServiceConfig::new("pubsub.example.com"),
                ServiceConfig::new("pubsub.example.org"),
            ],
            repository.clone(),
            Arc::new(DiscoRegistry::new()),
            out,
        )
        .expect("start");

        for (id, host) in [("c1", "pubsub.example.com"), ("c2", "pubsub.example.org")] {
            assert!(components
                .route(create_xml(id, host, "news"))
                .await
                .expect("route"));
            assert_eq!(next(&mut rx).await.attr("type"), Some("result"));
        }

        assert_eq!(repository.cached_nodes(), 2);
        for host in ["pubsub.example.com", "pubsub.example.org"] {
            let host: BareJid = host.parse().expect("valid JID");
            assert!(repository
                .get_node(&host, "news")
                .await
                .expect("lookup")
                .is_some());
        }
        components.shutdown().await;
    }

    #[tokio::test]
    async fn test_replies_wait_for_slow_consumer() {
        let (out, mut rx) = StanzaSender::channel(1);
        let service = PubSubService::start(
            &ServiceConfig::new("pubsub.example.com"),
            repository(),
            Arc::new(DiscoRegistry::new()),
            out,
        )
        .expect("service starts");

        for id in ["c1", "c2", "c3"] {
            service
                .process(create_xml(id, "pubsub.example.com", id))
                .await
                .expect("queued");
        }
        for id in ["c1", "c2", "c3"] {
            let reply = next(&mut rx).await;
            assert_eq!(reply.attr("id"), Some(id));
            assert_eq!(reply.attr("type"), Some("result"));
        }
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_abandons_queued_stanzas() {
        let disco = Arc::new(DiscoRegistry::new());
        let (service, mut rx) = start("pubsub.example.com", disco.clone());

        // The actor has not been polled yet on this single-threaded runtime.
        for id in ["c1", "c2"] {
            service
                .try_process(create_xml(id, "pubsub.example.com", id))
                .expect("queued");
        }
        service.stop().await;

        assert!(rx.recv().await.is_none());
        assert!(!disco.is_registered(&"pubsub.example.com".parse().expect("valid JID")));
    }

    #[tokio::test]
    async fn test_drain_handles_queued_stanzas() {
        let disco = Arc::new(DiscoRegistry::new());
        let (service, mut rx) = start("pubsub.example.com", disco.clone());

        for id in ["c1", "c2"] {
            service
                .try_process(create_xml(id, "pubsub.example.com", id))
                .expect("queued");
        }
        service.drain().await;

        let mut ids = Vec::new();
        while let Some(reply) = rx.recv().await {
            ids.push(reply.attr("id").map(String::from));
        }
        assert_eq!(ids, vec![Some("c1".to_string()), Some("c2".to_string())]);
        assert!(!disco.is_registered(&"pubsub.example.com".parse().expect("valid JID")));
    }
}
