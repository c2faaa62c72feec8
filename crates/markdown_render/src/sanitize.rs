use std::collections::BTreeSet;

use indexmap::IndexMap;
use tracing::trace;

use crate::hast::{Element, HtmlNode};
use crate::schema::Schema;

const UNSAFE_STYLE_FRAGMENTS: &[&str] = &[
    "expression(",
    "javascript:",
    "vbscript:",
    "url(",
    "@import",
    "behavior:",
    "-moz-binding",
    "\\",
];

/// Filters `nodes` against `schema`. Stripped tags vanish with their content,
/// other disallowed tags are replaced by their (sanitized) children.
pub fn sanitize(nodes: Vec<HtmlNode>, schema: &Schema) -> Vec<HtmlNode> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        sanitize_node(node, schema, &mut out);
    }
    out
}

fn sanitize_node(node: HtmlNode, schema: &Schema, out: &mut Vec<HtmlNode>) {
    let element = match node {
        HtmlNode::Text(value) => {
            out.push(HtmlNode::Text(value));
            return;
        }
        HtmlNode::Element(element) => element,
    };

    let tag = element.tag.to_ascii_lowercase();
    if schema.strip.contains(&tag) {
        trace!(%tag, "stripped element");
        return;
    }

    let children = sanitize(element.children, schema);
    if !schema.allows_tag(&tag) {
        trace!(%tag, "unwrapped disallowed element");
        out.extend(children);
        return;
    }

    let mut attrs: IndexMap<String, String> = element
        .attrs
        .into_iter()
        .filter_map(|(name, value)| sanitize_attribute(schema, &tag, name, value))
        .collect();
    if let Some(required) = schema.required.get(&tag) {
        for (name, value) in required {
            attrs.insert(name.clone(), value.clone());
        }
    }

    out.push(
        Element {
            tag,
            attrs,
            children,
        }
        .into(),
    );
}

fn sanitize_attribute(
    schema: &Schema,
    tag: &str,
    name: String,
    value: String,
) -> Option<(String, String)> {
    if name.to_ascii_lowercase().starts_with("on") || !schema.allows_attribute(tag, &name) {
        return None;
    }
    if let Some(protocols) = schema.protocols.get(&name) {
        if !has_allowed_protocol(&value, protocols) {
            return None;
        }
    }
    if name == "style" && !is_safe_style(&value) {
        return None;
    }
    if schema.clobber.contains(&name) {
        let prefixed = format!("{}{value}", schema.clobber_prefix);
        return Some((name, prefixed));
    }
    Some((name, value))
}

fn has_allowed_protocol(value: &str, protocols: &BTreeSet<String>) -> bool {
    let value = value.trim();
    let Some(colon) = value.find(':') else {
        return true;
    };
    let scheme = &value[..colon];
    if scheme.contains(['/', '?', '#']) {
        return true;
    }
    protocols.contains(&scheme.to_ascii_lowercase())
}

fn is_safe_style(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    !UNSAFE_STYLE_FRAGMENTS
        .iter()
        .any(|fragment| normalized.contains(fragment))
}
