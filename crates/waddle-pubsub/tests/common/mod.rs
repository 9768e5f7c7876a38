//! Test utilities for driving a pub/sub service end to end.
//!
//! Provides a running service over in-memory storage, stanza builders, and
//! helpers for collecting what the service sends back out.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use jid::BareJid;
use minidom::Element;
use tokio::sync::mpsc;
use tokio::time::timeout;
use waddle_pubsub::{
    DiscoRegistry, InMemoryPubSubStorage, PubSubRepository, PubSubService, ServiceConfig,
    StanzaSender,
};

/// Service domain used by every test.
pub const SERVICE: &str = "pubsub.example.com";

/// How long to wait for the first outbound stanza.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet period after which no more outbound stanzas are expected.
pub const SETTLE: Duration = Duration::from_millis(100);

pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
pub const NS_PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Install a test log subscriber once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("waddle_pubsub=debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> BareJid {
    s.parse().expect("valid JID")
}

/// A running pub/sub service with its outbound channel.
pub struct TestService {
    pub service: PubSubService,
    pub storage: Arc<InMemoryPubSubStorage>,
    pub disco: Arc<DiscoRegistry>,
    pub outbound: mpsc::Receiver<Element>,
}

impl TestService {
    pub fn start() -> Self {
        init_tracing();
        let storage = Arc::new(InMemoryPubSubStorage::new());
        let disco = Arc::new(DiscoRegistry::new());
        let (out, outbound) = StanzaSender::channel(256);
        let service = PubSubService::start(
            &ServiceConfig::new(SERVICE),
            Arc::new(PubSubRepository::new(storage.clone())),
            disco.clone(),
            out,
        )
        .expect("service should start");
        Self {
            service,
            storage,
            disco,
            outbound,
        }
    }

    /// Send a stanza and collect everything the service emits in response.
    pub async fn exchange(&mut self, xml: &str) -> Vec<Element> {
        let stanza: Element = xml.parse().expect("valid XML");
        self.service.process(stanza).await.expect("stanza queued");
        collect_outbound(&mut self.outbound).await
    }

    /// Send a stanza and return the reply carrying the same id.
    pub async fn request(&mut self, xml: &str) -> (Element, Vec<Element>) {
        let stanza: Element = xml.parse().expect("valid XML");
        let id = stanza.attr("id").expect("stanza id").to_string();
        let mut sent = self.exchange(xml).await;
        let position = sent
            .iter()
            .position(|s| s.attr("id") == Some(id.as_str()))
            .expect("reply to request");
        let reply = sent.remove(position);
        (reply, sent)
    }

    pub async fn stop(self) {
        self.service.stop().await;
    }
}

/// Drain outbound stanzas until the service goes quiet.
pub async fn collect_outbound(rx: &mut mpsc::Receiver<Element>) -> Vec<Element> {
    let mut collected = Vec::new();
    match timeout(DEFAULT_TIMEOUT, rx.recv()).await {
        Ok(Some(stanza)) => collected.push(stanza),
        _ => return collected,
    }
    while let Ok(Some(stanza)) = timeout(SETTLE, rx.recv()).await {
        collected.push(stanza);
    }
    collected
}

/// Build an IQ from `from` to the service.
pub fn iq(iq_type: &str, id: &str, from: &str, payload: &str) -> String {
    format!("<iq xmlns='jabber:client' type='{iq_type}' id='{id}' from='{from}' to='{SERVICE}'>{payload}</iq>")
}

pub fn pubsub(payload: &str) -> String {
    format!("<pubsub xmlns='{NS_PUBSUB}'>{payload}</pubsub>")
}

pub fn pubsub_owner(payload: &str) -> String {
    format!("<pubsub xmlns='{NS_PUBSUB_OWNER}'>{payload}</pubsub>")
}

/// A submitted node configuration form with the given field values.
pub fn config_form(fields: &[(&str, &str)]) -> String {
    let mut form = String::from("<x xmlns='jabber:x:data' type='submit'><field var='FORM_TYPE' type='hidden'><value>http://jabber.org/protocol/pubsub#node_config</value></field>");
    for (var, value) in fields {
        form.push_str(&format!("<field var='{var}'><value>{value}</value></field>"));
    }
    form.push_str("</x>");
    form
}

/// The defined condition of an error reply.
pub fn error_condition(reply: &Element) -> Option<String> {
    reply
        .children()
        .find(|c| c.name() == "error")?
        .children()
        .find(|c| c.ns() == NS_STANZAS && c.name() != "text")
        .map(|c| c.name().to_string())
}

/// Whether an error reply carries the given `pubsub#errors` condition.
pub fn has_app_condition(reply: &Element, name: &str) -> bool {
    reply
        .children()
        .filter(|c| c.name() == "error")
        .flat_map(|e| e.children())
        .any(|c| c.ns() == NS_PUBSUB_ERRORS && c.name() == name)
}
