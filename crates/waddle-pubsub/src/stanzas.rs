//! PubSub stanza parsing and building.
//!
//! Wraps inbound stanzas with their resolved addresses and builds the
//! result IQs and event messages sent back out.

use jid::{BareJid, Jid};
use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};

use crate::error::PubSubError;

/// Client stanza namespace.
pub const NS_CLIENT: &str = "jabber:client";

/// Stanza error conditions namespace (RFC 6120).
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// PubSub owner namespace for node management.
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";

/// PubSub errors namespace.
pub const NS_PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";

/// FORM_TYPE of node configuration forms.
pub const NS_PUBSUB_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";

/// FORM_TYPE of subscription authorization forms.
pub const NS_PUBSUB_SUBSCRIBE_AUTHORIZATION: &str =
    "http://jabber.org/protocol/pubsub#subscribe_authorization";

/// An inbound stanza addressed to a pub/sub service.
///
/// The stanza arrives already authenticated; `from` is the sender's JID and
/// `to` resolves to the bare service JID.
#[derive(Debug, Clone)]
pub struct Stanza {
    element: Element,
    from: Jid,
    service: BareJid,
}

impl Stanza {
    /// Resolve addresses of a raw stanza.
    pub fn parse(element: Element) -> Result<Self, PubSubError> {
        let from = match element.attr("from").map(str::parse::<Jid>) {
            Some(Ok(jid)) => jid,
            _ => return Err(PubSubError::jid_malformed(&element).with_text("Missing or invalid from")),
        };

        let service = match element.attr("to").map(str::parse::<Jid>) {
            Some(Ok(jid)) => jid.to_bare(),
            _ => return Err(PubSubError::jid_malformed(&element).with_text("Missing or invalid to")),
        };

        Ok(Self {
            element,
            from,
            service,
        })
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Element name: `iq`, `message` or `presence`.
    pub fn name(&self) -> &str {
        self.element.name()
    }

    pub fn id(&self) -> &str {
        self.element.attr("id").unwrap_or_default()
    }

    /// The `type` attribute, lowercased.
    pub fn stanza_type(&self) -> String {
        self.element
            .attr("type")
            .map(str::to_lowercase)
            .unwrap_or_default()
    }

    pub fn from(&self) -> &Jid {
        &self.from
    }

    /// The sender's bare JID, which keys affiliations and subscriptions.
    pub fn sender(&self) -> BareJid {
        self.from.to_bare()
    }

    pub fn service(&self) -> &BareJid {
        &self.service
    }

    /// The `<pubsub/>` child in the given namespace.
    pub fn pubsub(&self, ns: &str) -> Option<&Element> {
        self.element.get_child("pubsub", ns)
    }

    /// Build an IQ result addressed back to the sender.
    pub fn result(&self, payload: Option<Element>) -> Element {
        let iq = Iq {
            from: Some(Jid::from(self.service.clone())),
            to: Some(self.from.clone()),
            id: self.id().to_string(),
            payload: IqType::Result(payload),
        };
        iq.into()
    }
}

/// Read a trimmed `node` attribute, treating blank values as absent.
pub fn node_attr(element: &Element) -> Option<String> {
    element
        .attr("node")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
}

/// The bare form of a `jid` attribute, which may carry a resource.
pub fn jid_attr(element: &Element) -> Option<BareJid> {
    element
        .attr("jid")
        .and_then(|j| j.trim().parse::<Jid>().ok())
        .map(|jid| jid.to_bare())
}

/// Copy an element into another namespace, keeping attributes and children.
///
/// Used to move `item` elements from the request namespace into the
/// `pubsub#event` namespace of notifications.
pub fn with_namespace(element: &Element, ns: &str) -> Element {
    let mut builder = Element::builder(element.name(), ns);
    for (name, value) in element.attrs() {
        builder = builder.attr(name, value);
    }
    builder.append_all(element.nodes().cloned()).build()
}

/// Build a `<message/>` carrying a `pubsub#event` payload.
pub fn build_event_message(from: &BareJid, to: &BareJid, payload: Element) -> Element {
    Element::builder("message", NS_CLIENT)
        .attr("from", from.to_string())
        .attr("to", to.to_string())
        .attr("id", uuid::Uuid::new_v4().to_string())
        .append(
            Element::builder("event", NS_PUBSUB_EVENT)
                .append(payload)
                .build(),
        )
        .build()
}

/// Build a `<message/>` carrying a `<pubsub/>` payload.
///
/// Affiliation and subscription change notices use this envelope.
pub fn build_pubsub_message(from: &BareJid, to: &BareJid, payload: Element) -> Element {
    Element::builder("message", NS_CLIENT)
        .attr("from", from.to_string())
        .attr("to", to.to_string())
        .attr("id", uuid::Uuid::new_v4().to_string())
        .append(Element::builder("pubsub", NS_PUBSUB).append(payload).build())
        .build()
}

/// Generate an identifier without dashes, as used for item and subscription ids.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
