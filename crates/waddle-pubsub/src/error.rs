//! Error types for the pub/sub engine.
//!
//! Operation handlers never propagate failures as panics or opaque errors:
//! every validation failure becomes a [`PubSubError`] that pairs the
//! offending stanza with a structured condition list, and the dispatcher
//! renders it back to the sender with [`PubSubError::to_stanza`].

use std::fmt;

use minidom::Element;
use thiserror::Error;
use tracing::warn;

use crate::stanzas::{NS_PUBSUB_ERRORS, NS_STANZAS};

/// Failures reported by a storage backend.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// No node with this name exists for the service
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// A node with this name already exists for the service
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// Stored data could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Backend failure (connection lost, constraint violation, ...)
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Failures raised by the node repository.
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    /// Underlying storage failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The node was written but its identifier could not be read back
    #[error("Creating node failed!")]
    CreateFailed,

    /// A ledger was passed that is not the one owned by the cached node
    #[error("INCORRECT: ledger is not owned by cached node '{0}'")]
    LedgerMismatch(String),

    /// The in-memory node instance was deleted and evicted
    #[error("Node '{0}' has been deleted")]
    NodeDeleted(String),

    /// A stored configuration form could not be decoded
    #[error("Invalid node configuration: {0}")]
    InvalidConfig(String),
}

/// Failures of the per-host service actor.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The actor has stopped and no longer accepts stanzas
    #[error("Pub/sub service for '{0}' is not running")]
    Closed(String),

    /// The mailbox is at capacity
    #[error("Pub/sub mailbox for '{0}' is full")]
    MailboxFull(String),

    /// A service is already registered for this host
    #[error("Pub/sub service for '{0}' is already registered")]
    AlreadyRegistered(String),

    /// The configured host is not a valid JID
    #[error("Invalid pub/sub host '{0}'")]
    InvalidHost(String),
}

/// XMPP stanza error conditions used by pub/sub (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    ServiceUnavailable,
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// The error type RFC 6120 associates with this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable => StanzaErrorType::Modify,
            Self::Forbidden | Self::NotAuthorized => StanzaErrorType::Auth,
            Self::InternalServerError | Self::UnexpectedRequest => StanzaErrorType::Wait,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::ServiceUnavailable => StanzaErrorType::Cancel,
        }
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A failed pub/sub operation.
///
/// Holds the stanza that caused the failure together with the defined
/// condition and any `pubsub#errors` application conditions.
#[derive(Debug, Clone, Error)]
#[error("{condition} ({error_type})")]
pub struct PubSubError {
    stanza: Element,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    app_conditions: Vec<Element>,
    text: Option<String>,
}

impl PubSubError {
    /// Create an error for `stanza` with the condition's default type.
    pub fn new(stanza: &Element, condition: StanzaErrorCondition) -> Self {
        Self {
            stanza: stanza.clone(),
            condition,
            error_type: condition.default_type(),
            app_conditions: Vec::new(),
            text: None,
        }
    }

    pub fn bad_request(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::BadRequest)
    }

    pub fn conflict(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::Conflict)
    }

    pub fn feature_not_implemented(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::FeatureNotImplemented)
    }

    pub fn forbidden(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::Forbidden)
    }

    pub fn item_not_found(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::ItemNotFound)
    }

    pub fn jid_malformed(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::JidMalformed)
    }

    pub fn not_acceptable(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::NotAcceptable)
    }

    pub fn not_allowed(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::NotAllowed)
    }

    pub fn not_authorized(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::NotAuthorized)
    }

    pub fn unexpected_request(stanza: &Element) -> Self {
        Self::new(stanza, StanzaErrorCondition::UnexpectedRequest)
    }

    /// Create an `internal-server-error` for a failed persistence call.
    pub fn internal_server_error(stanza: &Element, cause: impl fmt::Display) -> Self {
        warn!(error = %cause, stanza = %stanza.name(), "Pub/sub operation aborted");
        Self::new(stanza, StanzaErrorCondition::InternalServerError)
    }

    /// Add a `<name xmlns='http://jabber.org/protocol/pubsub#errors'/>` condition.
    pub fn with_condition(mut self, name: &str) -> Self {
        self.app_conditions
            .push(Element::builder(name, NS_PUBSUB_ERRORS).build());
        self
    }

    /// Add an `<unsupported feature='...'/>` condition.
    pub fn with_unsupported(mut self, feature: &str) -> Self {
        self.app_conditions.push(
            Element::builder("unsupported", NS_PUBSUB_ERRORS)
                .attr("feature", feature)
                .build(),
        );
        self
    }

    /// Attach a human-readable description.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn condition(&self) -> StanzaErrorCondition {
        self.condition
    }

    pub fn error_type(&self) -> StanzaErrorType {
        self.error_type
    }

    pub fn app_conditions(&self) -> &[Element] {
        &self.app_conditions
    }

    /// Whether an application condition with this element name is present.
    pub fn has_condition(&self, name: &str) -> bool {
        self.app_conditions.iter().any(|c| c.name() == name)
    }

    /// The stanza that triggered the error.
    pub fn stanza(&self) -> &Element {
        &self.stanza
    }

    /// Render the error reply for the original sender.
    pub fn to_stanza(&self) -> Element {
        let ns = self.stanza.ns();
        let mut builder = Element::builder(self.stanza.name(), ns.clone()).attr("type", "error");

        if let Some(id) = self.stanza.attr("id") {
            builder = builder.attr("id", id);
        }
        if let Some(to) = self.stanza.attr("to") {
            builder = builder.attr("from", to);
        }
        if let Some(from) = self.stanza.attr("from") {
            builder = builder.attr("to", from);
        }

        let mut error = Element::builder("error", ns)
            .attr("type", self.error_type.as_str())
            .append(Element::builder(self.condition.as_str(), NS_STANZAS).build());

        for condition in &self.app_conditions {
            error = error.append(condition.clone());
        }

        if let Some(ref text) = self.text {
            error = error.append(
                Element::builder("text", NS_STANZAS)
                    .append(text.as_str())
                    .build(),
            );
        }

        builder.append(error.build()).build()
    }
}
