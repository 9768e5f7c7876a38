//! Module registry and stanza dispatch.
//!
//! Modules are kept in registration order. An inbound stanza is offered to
//! every module whose criteria match it; each failure is answered with its
//! own error stanza. A stanza no module claims is answered with
//! `feature-not-implemented`.

use std::collections::BTreeSet;

use tracing::{debug, info, instrument, warn};

use crate::criteria::Criteria;
use crate::disco::Feature;
use crate::error::PubSubError;
use crate::modules::{default_modules, ModuleContext, PubSubModule};
use crate::outbound::StanzaSender;
use crate::stanzas::Stanza;

struct Registered {
    module: Box<dyn PubSubModule>,
    criteria: Criteria,
}

/// Ordered collection of pub/sub modules.
#[derive(Default)]
pub struct Dispatcher {
    modules: Vec<Registered>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher holding every built-in module.
    pub fn with_default_modules() -> Self {
        let mut dispatcher = Self::new();
        for module in default_modules() {
            dispatcher.register(module);
        }
        dispatcher
    }

    /// Add a module, returning false when one with the same name exists.
    pub fn register(&mut self, module: Box<dyn PubSubModule>) -> bool {
        let name = module.name();
        if self.modules.iter().any(|r| r.module.name() == name) {
            warn!(module = name, "Module already registered");
            return false;
        }
        let criteria = module.criteria();
        self.modules.push(Registered { module, criteria });
        debug!(module = name, "Module registered");
        true
    }

    /// Remove a module by name, returning whether it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.modules.len();
        self.modules.retain(|r| r.module.name() != name);
        before != self.modules.len()
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|r| r.module.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Union of every module's features, sorted and without duplicates.
    pub fn features(&self) -> Vec<Feature> {
        self.modules
            .iter()
            .flat_map(|r| r.module.features())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Offer a stanza to every matching module.
    ///
    /// Returns the number of modules that handled it.
    #[instrument(skip(self, ctx, stanza, out), fields(stanza = %stanza.name(), id = %stanza.id()))]
    pub async fn dispatch(
        &self,
        ctx: &ModuleContext,
        stanza: &Stanza,
        out: &StanzaSender,
    ) -> usize {
        let mut handled = 0;
        for registered in &self.modules {
            if !registered.criteria.matches(stanza.element()) {
                continue;
            }
            handled += 1;
            let name = registered.module.name();
            debug!(module = name, "Dispatching stanza");
            if let Err(e) = registered.module.process(ctx, stanza, out).await {
                info!(module = name, error = %e, "Pub/sub request failed");
                out.reply(e.to_stanza()).await;
            }
        }

        if handled == 0 {
            debug!("No module accepts stanza");
            if stanza.stanza_type() != "error" && stanza.stanza_type() != "result" {
                let error = PubSubError::feature_not_implemented(stanza.element());
                out.reply(error.to_stanza()).await;
            }
        }
        handled
    }
}
