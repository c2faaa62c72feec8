use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::hast::{Element, HtmlNode};

#[derive(Debug, Clone, Default)]
pub enum CodeIdSource {
    Counter(Arc<AtomicU64>),
    #[default]
    Ephemeral,
}

impl CodeIdSource {
    pub fn next_id(&self) -> String {
        match self {
            CodeIdSource::Counter(counter) => {
                format!("code-{}", counter.fetch_add(1, Ordering::Relaxed) + 1)
            }
            CodeIdSource::Ephemeral => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_millis())
                    .unwrap_or_default();
                let suffix: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(5)
                    .map(|byte| char::from(byte).to_ascii_lowercase())
                    .collect();
                format!("code-{millis}-{suffix}")
            }
        }
    }
}

pub fn enhance_code_blocks(nodes: &mut [HtmlNode], ids: &CodeIdSource) {
    for node in nodes.iter_mut() {
        let HtmlNode::Element(element) = node else {
            continue;
        };
        if element.tag == "pre" && element.children.iter().any(|c| c.is_element("code")) {
            let pre = std::mem::take(element);
            *node = wrap_code_block(pre, ids).into();
        } else {
            enhance_code_blocks(&mut element.children, ids);
        }
    }
}

fn wrap_code_block(mut pre: Element, ids: &CodeIdSource) -> Element {
    let id = ids.next_id();
    let mut language = "text".to_string();

    for child in pre.children.iter_mut() {
        if let HtmlNode::Element(code) = child {
            if code.tag == "code" {
                if let Some(lang) = code.classes().find_map(|c| c.strip_prefix("language-")) {
                    language = lang.to_string();
                }
                code.set_attr("data-code-id", id.as_str());
                break;
            }
        }
    }
    pre.set_attr("class", "code-block-pre");

    Element::new("div")
        .class("code-block")
        .child(header(&language, &id))
        .child(pre)
}

fn header(language: &str, id: &str) -> Element {
    let copy_button = Element::new("button")
        .class("code-block-copy")
        .attr("data-code-id", id)
        .attr("title", "Copy code")
        .attr("type", "button")
        .child(copy_icon());

    Element::new("div")
        .class("code-block-header")
        .child(
            Element::new("span")
                .class("code-block-language")
                .text(language),
        )
        .child(
            Element::new("div")
                .class("code-block-actions")
                .child(copy_button),
        )
}

fn copy_icon() -> Element {
    Element::new("svg")
        .attr("xmlns", "http://www.w3.org/2000/svg")
        .attr("width", "16")
        .attr("height", "16")
        .attr("viewBox", "0 0 24 24")
        .attr("fill", "none")
        .attr("stroke", "currentColor")
        .attr("stroke-width", "2")
        .attr("stroke-linecap", "round")
        .attr("stroke-linejoin", "round")
        .attr("class", "lucide lucide-copy-icon lucide-copy")
        .child(
            Element::new("rect")
                .attr("width", "14")
                .attr("height", "14")
                .attr("x", "8")
                .attr("y", "8")
                .attr("rx", "2")
                .attr("ry", "2"),
        )
        .child(
            Element::new("path")
                .attr("d", "M4 16c-1.1 0-2-.9-2-2V4c0-1.1.9-2 2-2h10c1.1 0 2 .9 2 2"),
        )
}
