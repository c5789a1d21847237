//! PrairieLearn tag rewriting.
//!
//! Question HTML produced by the pipeline uses `pl-*` custom elements. For a live preview
//! we translate them into plain Bootstrap markup using a table of [`TagRule`]s.

use std::collections::HashMap;

use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Attr {
  pub name: String,
  pub value: String,
}

/// Copy the value of attribute `from` on the old element into attribute `to` on the new one.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AttrMapping {
  pub from: String,
  pub to: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TagRule {
  pub target_tag: String,
  pub replacement_tag: String,
  /// Base attributes of the replacement element.
  #[serde(default)]
  pub attributes: Vec<Attr>,
  /// Applied in order; a later pair wins when two pairs target the same name.
  #[serde(default)]
  pub mapping: Vec<AttrMapping>,
}

impl TagRule {
  fn new(target: &str, replacement: &str, attributes: &[(&str, &str)], mapping: &[(&str, &str)]) -> Self {
    Self {
      target_tag: target.into(),
      replacement_tag: replacement.into(),
      attributes: attributes.iter().map(|(n, v)| Attr { name: (*n).into(), value: (*v).into() }).collect(),
      mapping: mapping.iter().map(|(f, t)| AttrMapping { from: (*f).into(), to: (*t).into() }).collect(),
    }
  }

  /// Base attributes overlaid by mapped ones, preserving first-insertion order.
  fn replacement_attrs<'a>(&self, old: impl Iterator<Item = (&'a str, &'a str)>) -> Vec<(String, String)> {
    let old: HashMap<&str, &str> = old.collect();
    let mut out: Vec<(String, String)> = self.attributes.iter().map(|a| (a.name.clone(), a.value.clone())).collect();
    for m in &self.mapping {
      if let Some(v) = old.get(m.from.as_str()) {
        match out.iter_mut().find(|(n, _)| *n == m.to) {
          Some(slot) => slot.1 = (*v).to_string(),
          None => out.push((m.to.clone(), (*v).to_string())),
        }
      }
    }
    let unmapped: Vec<&&str> = old.keys().filter(|k| !self.mapping.iter().any(|m| m.from == **k)).collect();
    if !unmapped.is_empty() {
      debug!(target: "gestalt_backend", tag = %self.target_tag, ?unmapped, "Dropping unmapped attributes");
    }
    out
  }
}

/// The built-in PrairieLearn -> Bootstrap table.
pub fn default_rules() -> Vec<TagRule> {
  vec![
    TagRule::new("pl-question-panel", "div", &[("class", "card mb-4 p-3 bg-light")], &[]),
    TagRule::new(
      "pl-checkbox",
      "fieldset",
      &[("class", "form-check mb-3")],
      &[("answers-name", "answers-name"), ("weight", "data-weight"), ("inline", "data-inline")],
    ),
    TagRule::new(
      "pl-answer",
      "input",
      &[("type", "checkbox"), ("class", "form-check-input me-2")],
      &[("correct", "data-correct")],
    ),
    TagRule::new(
      "pl-number-input",
      "input",
      &[("type", "number"), ("size", "50"), ("value", ""), ("step", "any"), ("class", "form-control mb-2")],
      &[
        ("answers-name", "answers-name"),
        ("id", "answers-name"),
        ("comparison", "comparison"),
        ("digits", "digits"),
        ("label", "label"),
      ],
    ),
    TagRule::new("pl-solution-panel", "div", &[("class", "alert alert-info p-3")], &[]),
    TagRule::new(
      "pl-hint",
      "div",
      &[("class", "alert alert-warning p-3")],
      &[("data-type", "data-type"), ("level", "data-level")],
    ),
    TagRule::new(
      "pl-multiple-choice",
      "fieldset",
      &[("class", "card p-3 mb-3")],
      &[("answers-name", "answers-name"), ("inline", "data-inline"), ("weight", "data-weight")],
    ),
    TagRule::new(
      "pl-text-input",
      "input",
      &[("type", "text"), ("size", "50"), ("value", ""), ("class", "form-control mb-2")],
      &[("answers-name", "answers-name"), ("label", "aria-label")],
    ),
    TagRule::new(
      "pl-figure",
      "img",
      &[("alt", "Picture for problem"), ("width", "300"), ("height", "300"), ("class", "img-fluid mx-auto d-block mb-3")],
      &[("file-name", "src")],
    ),
    TagRule::new(
      "pl-input-field",
      "input",
      &[("type", "number"), ("size", "50"), ("value", ""), ("step", "any"), ("class", "form-control mb-2")],
      &[("variable-name", "name"), ("id", "variable-name"), ("label", "aria-label"), ("placeholder", "placeholder")],
    ),
    TagRule::new("pl-input-panel", "div", &[("class", "card p-3 mb-3")], &[]),
  ]
}

const VOID_ELEMENTS: &[&str] = &[
  "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

fn is_void(tag: &str) -> bool {
  VOID_ELEMENTS.contains(&tag)
}

fn escape_text(s: &str, out: &mut String) {
  for ch in s.chars() {
    match ch {
      '&' => out.push_str("&amp;"),
      '<' => out.push_str("&lt;"),
      '>' => out.push_str("&gt;"),
      c => out.push(c),
    }
  }
}

fn escape_attr(s: &str, out: &mut String) {
  for ch in s.chars() {
    match ch {
      '&' => out.push_str("&amp;"),
      '"' => out.push_str("&quot;"),
      c => out.push(c),
    }
  }
}

fn write_open_tag(name: &str, attrs: &[(String, String)], out: &mut String) {
  out.push('<');
  out.push_str(name);
  for (k, v) in attrs {
    out.push(' ');
    out.push_str(k);
    out.push_str("=\"");
    escape_attr(v, out);
    out.push('"');
  }
  out.push('>');
}

/// Rewrites HTML fragments according to a rule table.
#[derive(Clone, Debug)]
pub struct TagReplacer {
  rules: Vec<TagRule>,
}

impl TagReplacer {
  pub fn new(rules: Vec<TagRule>) -> Self {
    Self { rules }
  }

  pub fn rules(&self) -> &[TagRule] {
    &self.rules
  }

  fn rule_for(&self, tag: &str) -> Option<&TagRule> {
    self.rules.iter().find(|r| r.target_tag.eq_ignore_ascii_case(tag))
  }

  /// Rewrite every element matched by a rule; everything else is serialized unchanged.
  pub fn rewrite(&self, html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len() + html.len() / 4);
    self.write_children(doc.root_element(), false, &mut out);
    out
  }

  fn write_children(&self, el: ElementRef<'_>, raw_text: bool, out: &mut String) {
    for child in el.children() {
      match child.value() {
        Node::Text(t) => {
          if raw_text { out.push_str(t) } else { escape_text(t, out) }
        }
        Node::Comment(c) => {
          out.push_str("<!--");
          out.push_str(c);
          out.push_str("-->");
        }
        Node::Element(_) => {
          if let Some(child_el) = ElementRef::wrap(child) {
            self.write_element(child_el, out);
          }
        }
        _ => {}
      }
    }
  }

  fn write_element(&self, el: ElementRef<'_>, out: &mut String) {
    let name = el.value().name();
    let (tag, attrs) = match self.rule_for(name) {
      Some(rule) => (rule.replacement_tag.as_str(), rule.replacement_attrs(el.value().attrs())),
      None => (name, el.value().attrs().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
    };
    write_open_tag(tag, &attrs, out);
    let raw = matches!(tag, "script" | "style");
    self.write_children(el, raw, out);
    if !is_void(tag) {
      out.push_str("</");
      out.push_str(tag);
      out.push('>');
    }
  }
}

impl Default for TagReplacer {
  fn default() -> Self {
    Self::new(default_rules())
  }
}
