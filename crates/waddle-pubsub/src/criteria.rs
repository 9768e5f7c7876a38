//! Structural element matching.
//!
//! Each operation handler describes the stanzas it accepts as a small
//! criteria tree: element name, required attributes, character data, and a
//! nested criteria that at least one direct child must satisfy. The
//! `xmlns` attribute key matches against the element namespace.

use minidom::Element;

/// A matcher over elements.
#[derive(Debug, Clone)]
pub enum Criteria {
    Element(ElementCriteria),
    /// Matches when any alternative matches.
    Or(Vec<ElementCriteria>),
}

impl Criteria {
    pub fn matches(&self, element: &Element) -> bool {
        match self {
            Criteria::Element(c) => c.matches(element),
            Criteria::Or(alternatives) => alternatives.iter().any(|c| c.matches(element)),
        }
    }

    pub fn or(alternatives: impl IntoIterator<Item = ElementCriteria>) -> Self {
        Criteria::Or(alternatives.into_iter().collect())
    }
}

impl From<ElementCriteria> for Criteria {
    fn from(c: ElementCriteria) -> Self {
        Criteria::Element(c)
    }
}

/// Matches a single element and, optionally, one of its children.
#[derive(Debug, Clone, Default)]
pub struct ElementCriteria {
    name: Option<String>,
    attrs: Vec<(String, String)>,
    cdata: Option<String>,
    next: Option<Box<Criteria>>,
}

impl ElementCriteria {
    /// Criteria matching any element.
    pub fn new() -> Self {
        Self::default()
    }

    /// Criteria matching elements with this name.
    pub fn name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Require an attribute value; `xmlns` requires the namespace.
    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.retain(|(n, _)| n != name);
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    /// Require exact character data.
    pub fn cdata(mut self, cdata: &str) -> Self {
        self.cdata = Some(cdata.to_string());
        self
    }

    /// Require a child matching `next`. Only the first call takes effect.
    pub fn child(mut self, next: impl Into<Criteria>) -> Self {
        if self.next.is_none() {
            self.next = Some(Box::new(next.into()));
        }
        self
    }

    pub fn matches(&self, element: &Element) -> bool {
        if let Some(ref name) = self.name {
            if name != element.name() {
                return false;
            }
        }

        if let Some(ref cdata) = self.cdata {
            let text = element.text();
            if text.is_empty() || &text != cdata {
                return false;
            }
        }

        let attrs_match = self.attrs.iter().all(|(name, value)| {
            if name == "xmlns" {
                element.ns() == *value
            } else {
                element.attr(name) == Some(value.as_str())
            }
        });
        if !attrs_match {
            return false;
        }

        match self.next {
            Some(ref next) => element.children().any(|child| next.matches(child)),
            None => true,
        }
    }
}
