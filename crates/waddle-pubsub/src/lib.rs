//! # waddle-pubsub
//!
//! XEP-0060 Publish-Subscribe engine for Waddle Social.
//!
//! This crate implements the node, affiliation and subscription state
//! machine of a pub/sub service, independent of any transport. Stanzas come
//! in through a per-host service actor and replies and notifications leave
//! through an outbound channel.
//!
//! ## Architecture
//!
//! - **Service**: one actor per configured host with a bounded mailbox
//! - **Dispatcher**: routes stanzas to operation modules by structural criteria
//! - **Modules**: one handler per XEP-0060 use case
//! - **Repository**: cached nodes over a pluggable storage port
//! - **Access**: the five node access models
//! - **Notify**: event fan-out to subscribers and owners
//!
//! ## XEP Support
//!
//! - XEP-0004 (Data Forms) for node configuration and subscription authorization
//! - XEP-0030 (Service Discovery)
//! - XEP-0060 (Publish-Subscribe), leaf nodes only

pub mod access;
pub mod criteria;
pub mod disco;
pub mod dispatcher;
pub mod form;
pub mod ledger;
pub mod modules;
pub mod node;
pub mod notify;
pub mod outbound;
pub mod repository;
pub mod service;
pub mod stanzas;
pub mod storage;

mod error;
mod types;

pub use disco::{DiscoRegistry, Feature, Identity};
pub use dispatcher::Dispatcher;
pub use error::{
    PubSubError, RepositoryError, ServiceError, StanzaErrorCondition, StanzaErrorType,
    StorageError,
};
pub use modules::{ModuleContext, PubSubModule};
pub use node::{AccessModel, NodeConfig, NodeType, PublishModel};
pub use notify::{NotificationService, StanzaNotifier};
pub use outbound::{SendResult, StanzaSender};
pub use repository::{Node, PubSubRepository};
pub use service::{PubSubComponents, PubSubService, ServiceConfig};
pub use stanzas::Stanza;
pub use storage::{InMemoryPubSubStorage, PubSubStorage, RosterSubscription};
pub use types::*;
