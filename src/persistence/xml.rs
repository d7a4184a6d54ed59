use std::io::Cursor;

use anyhow::Context as AnyhowContext;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::error::{EngineError, Result};

/// Fluent construction of a memento document.
pub(crate) struct XmlBuilder {
    root: Element,
}

impl XmlBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            root: Element::new(name),
        }
    }

    pub fn attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.root.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn text(mut self, name: &str, value: impl Into<String>) -> Self {
        self.root.children.push(XMLNode::Element(text_element(name, value)));
        self
    }

    pub fn opt_text(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.text(name, v),
            None => self,
        }
    }

    pub fn child(mut self, element: Element) -> Self {
        self.root.children.push(XMLNode::Element(element));
        self
    }

    pub fn body(mut self, value: impl Into<String>) -> Self {
        self.root.children.push(XMLNode::Text(value.into()));
        self
    }

    pub fn build(self) -> Element {
        self.root
    }
}

pub(crate) fn text_element(name: &str, value: impl Into<String>) -> Element {
    let mut el = Element::new(name);
    let value = value.into();
    if !value.is_empty() {
        el.children.push(XMLNode::Text(value));
    }
    el
}

/// Indented, without a declaration; the same element always renders to the
/// same bytes.
pub(crate) fn render(element: &Element) -> Result<String> {
    let mut buf = Vec::new();
    let config = EmitterConfig::new()
        .perform_indent(true)
        .write_document_declaration(false);
    element
        .write_with_config(Cursor::new(&mut buf), config)
        .context("Failed to write memento XML")?;
    let mut out = String::from_utf8(buf).context("Memento XML is not UTF-8")?;
    out.push('\n');
    Ok(out)
}

pub(crate) fn parse(content: &str) -> Result<Element> {
    Ok(Element::parse(Cursor::new(content.as_bytes())).context("Malformed memento XML")?)
}

pub(crate) fn child_text(element: &Element, name: &str) -> Option<String> {
    element
        .get_child(name)
        .map(|c| c.get_text().map(|t| t.into_owned()).unwrap_or_default())
}

pub(crate) fn require_text(element: &Element, name: &str) -> Result<String> {
    child_text(element, name).ok_or_else(|| {
        EngineError::Persistence(anyhow::anyhow!(
            "<{}> memento is missing <{}>",
            element.name,
            name
        ))
    })
}

pub(crate) fn children_named<'a>(
    element: &'a Element,
    name: &'a str,
) -> impl Iterator<Item = &'a Element> + 'a {
    element.children.iter().filter_map(move |node| match node {
        XMLNode::Element(e) if e.name == name => Some(e),
        _ => None,
    })
}
