//! Data Forms (XEP-0004).
//!
//! Node configuration and subscription authorization travel as `jabber:x:data`
//! forms. A [`DataForm`] holds at most one field per `var`; adding a field
//! with an existing name replaces it.

use std::fmt;

use minidom::Element;
use tracing::debug;

/// Data Forms namespace (XEP-0004).
pub const DATA_FORMS_NS: &str = "jabber:x:data";

/// The `type` attribute of an `<x/>` form element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormType {
    #[default]
    Form,
    Submit,
    Cancel,
    Result,
}

impl FormType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "form" => Some(FormType::Form),
            "submit" => Some(FormType::Submit),
            "cancel" => Some(FormType::Cancel),
            "result" => Some(FormType::Result),
            _ => None,
        }
    }
}

impl fmt::Display for FormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FormType::Form => "form",
            FormType::Submit => "submit",
            FormType::Cancel => "cancel",
            FormType::Result => "result",
        };
        write!(f, "{}", s)
    }
}

/// The `type` attribute of a form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Fixed,
    Hidden,
    JidMulti,
    JidSingle,
    ListMulti,
    ListSingle,
    TextMulti,
    TextPrivate,
    TextSingle,
}

impl FieldType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "boolean" => Some(FieldType::Boolean),
            "fixed" => Some(FieldType::Fixed),
            "hidden" => Some(FieldType::Hidden),
            "jid-multi" => Some(FieldType::JidMulti),
            "jid-single" => Some(FieldType::JidSingle),
            "list-multi" => Some(FieldType::ListMulti),
            "list-single" => Some(FieldType::ListSingle),
            "text-multi" => Some(FieldType::TextMulti),
            "text-private" => Some(FieldType::TextPrivate),
            "text-single" => Some(FieldType::TextSingle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Boolean => "boolean",
            FieldType::Fixed => "fixed",
            FieldType::Hidden => "hidden",
            FieldType::JidMulti => "jid-multi",
            FieldType::JidSingle => "jid-single",
            FieldType::ListMulti => "list-multi",
            FieldType::ListSingle => "list-single",
            FieldType::TextMulti => "text-multi",
            FieldType::TextPrivate => "text-private",
            FieldType::TextSingle => "text-single",
        }
    }
}

/// A single form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub var: String,
    pub field_type: Option<FieldType>,
    pub label: Option<String>,
    pub values: Vec<String>,
    /// Allowed values for list fields.
    pub options: Vec<String>,
}

impl FormField {
    fn new(var: &str, field_type: FieldType, label: &str, values: Vec<String>) -> Self {
        Self {
            var: var.to_string(),
            field_type: Some(field_type),
            label: (!label.is_empty()).then(|| label.to_string()),
            values,
            options: Vec::new(),
        }
    }

    /// Build a hidden field.
    pub fn hidden(var: &str, value: &str) -> Self {
        Self::new(var, FieldType::Hidden, "", vec![value.to_string()])
    }

    /// Build a text-single field.
    pub fn text_single(var: &str, label: &str, value: &str) -> Self {
        Self::new(var, FieldType::TextSingle, label, vec![value.to_string()])
    }

    /// Build a text-multi field.
    pub fn text_multi(var: &str, label: &str, values: &[&str]) -> Self {
        let values = values.iter().map(|v| v.to_string()).collect();
        Self::new(var, FieldType::TextMulti, label, values)
    }

    /// Build a boolean field.
    pub fn boolean(var: &str, label: &str, value: bool) -> Self {
        let value = if value { "1" } else { "0" };
        Self::new(var, FieldType::Boolean, label, vec![value.to_string()])
    }

    /// Build a list-single field with its options.
    pub fn list_single(var: &str, label: &str, value: &str, options: &[&str]) -> Self {
        let mut field = Self::new(var, FieldType::ListSingle, label, vec![value.to_string()]);
        field.options = options.iter().map(|o| o.to_string()).collect();
        field
    }

    /// First value, if any.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("field", DATA_FORMS_NS).attr("var", self.var.as_str());

        if let Some(field_type) = self.field_type {
            builder = builder.attr("type", field_type.as_str());
        }
        if let Some(ref label) = self.label {
            builder = builder.attr("label", label.as_str());
        }

        for option in &self.options {
            builder = builder.append(
                Element::builder("option", DATA_FORMS_NS)
                    .append(
                        Element::builder("value", DATA_FORMS_NS)
                            .append(option.as_str())
                            .build(),
                    )
                    .build(),
            );
        }

        for value in &self.values {
            builder = builder.append(
                Element::builder("value", DATA_FORMS_NS)
                    .append(value.as_str())
                    .build(),
            );
        }

        builder.build()
    }

    /// Parse a `<field/>` element. Fields without `var` are skipped.
    pub fn from_element(elem: &Element) -> Option<Self> {
        let var = elem.attr("var")?;

        let values = elem
            .children()
            .filter(|c| c.is("value", DATA_FORMS_NS))
            .map(|c| c.text())
            .collect();

        let options = elem
            .children()
            .filter(|c| c.is("option", DATA_FORMS_NS))
            .filter_map(|o| o.get_child("value", DATA_FORMS_NS).map(|v| v.text()))
            .collect();

        Some(Self {
            var: var.to_string(),
            field_type: elem.attr("type").and_then(FieldType::parse),
            label: elem.attr("label").map(String::from),
            values,
            options,
        })
    }
}

/// A `jabber:x:data` form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataForm {
    pub form_type: FormType,
    pub title: Option<String>,
    fields: Vec<FormField>,
}

impl DataForm {
    pub fn new(form_type: FormType) -> Self {
        Self {
            form_type,
            title: None,
            fields: Vec::new(),
        }
    }

    /// Add a field, replacing any existing field with the same `var`.
    pub fn add_field(&mut self, field: FormField) {
        match self.fields.iter_mut().find(|f| f.var == field.var) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    /// Replace the values of a field, creating an untyped field if absent.
    pub fn set_values(&mut self, var: &str, values: Vec<String>) {
        match self.fields.iter_mut().find(|f| f.var == var) {
            Some(existing) => existing.values = values,
            None => self.fields.push(FormField {
                var: var.to_string(),
                field_type: None,
                label: None,
                values,
                options: Vec::new(),
            }),
        }
    }

    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    /// First value of a field.
    pub fn value(&self, var: &str) -> Option<&str> {
        self.field(var).and_then(FormField::value)
    }

    /// All values of a field, empty when absent.
    pub fn values(&self, var: &str) -> Vec<String> {
        self.field(var).map(|f| f.values.clone()).unwrap_or_default()
    }

    /// Boolean value of a field; absent fields read as false.
    pub fn bool_value(&self, var: &str) -> bool {
        self.value(var).map(parse_boolean).unwrap_or(false)
    }

    /// The hidden `FORM_TYPE` value.
    pub fn form_namespace(&self) -> Option<&str> {
        self.value("FORM_TYPE")
    }

    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("x", DATA_FORMS_NS).attr("type", self.form_type.to_string());

        if let Some(ref title) = self.title {
            builder = builder.append(
                Element::builder("title", DATA_FORMS_NS)
                    .append(title.as_str())
                    .build(),
            );
        }

        for field in &self.fields {
            builder = builder.append(field.to_element());
        }

        builder.build()
    }

    /// Parse an `<x xmlns='jabber:x:data'/>` element.
    pub fn from_element(elem: &Element) -> Option<Self> {
        if !elem.is("x", DATA_FORMS_NS) {
            return None;
        }

        let form_type = elem
            .attr("type")
            .and_then(FormType::parse)
            .unwrap_or_default();

        let mut form = DataForm::new(form_type);
        form.title = elem.get_child("title", DATA_FORMS_NS).map(|t| t.text());

        for child in elem.children().filter(|c| c.is("field", DATA_FORMS_NS)) {
            match FormField::from_element(child) {
                Some(field) => form.add_field(field),
                None => debug!("Ignoring form field without var"),
            }
        }

        Some(form)
    }

    /// Find and parse the first data form child of `parent`.
    pub fn find_in(parent: &Element) -> Option<Self> {
        parent
            .get_child("x", DATA_FORMS_NS)
            .and_then(DataForm::from_element)
    }
}

/// Parse a boolean value from a data form field.
///
/// XEP-0004 boolean values can be: "1", "true", "0", "false"
pub fn parse_boolean(s: &str) -> bool {
    matches!(s.trim(), "1" | "true")
}
