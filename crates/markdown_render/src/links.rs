use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::hast::{Element, HtmlNode};

const SAFE_SCHEMES: &[&str] = &["http", "https", "mailto", "tel"];
const RELATIVE_PREFIXES: &[&str] = &["#", "/", "./", "../"];

static SCHEME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*:").expect("valid scheme pattern"));

pub fn is_safe_url(raw: &str) -> bool {
    let href = raw.trim();
    if href.is_empty() {
        return false;
    }
    if RELATIVE_PREFIXES.iter().any(|prefix| href.starts_with(prefix)) {
        return true;
    }
    if !SCHEME_PATTERN.is_match(href) {
        return true;
    }
    match Url::parse(href) {
        Ok(url) => SAFE_SCHEMES.contains(&url.scheme()),
        Err(_) => false,
    }
}

pub fn display_hostname(href: &str) -> String {
    Url::parse(href)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| href.to_string())
}

pub fn harden_links(nodes: &mut [HtmlNode]) {
    for node in nodes.iter_mut() {
        let replacement = match node {
            HtmlNode::Element(element) if element.tag == "a" => harden_anchor(element),
            HtmlNode::Element(element) => {
                harden_links(&mut element.children);
                None
            }
            HtmlNode::Text(_) => None,
        };
        if let Some(wrapper) = replacement {
            *node = wrapper.into();
        }
    }
}

fn harden_anchor(anchor: &mut Element) -> Option<Element> {
    let href = anchor.get_attr("href").filter(|href| !href.is_empty())?.to_string();

    if !is_safe_url(&href) {
        anchor.tag = "span".to_string();
        anchor.attrs.clear();
        harden_links(&mut anchor.children);
        return None;
    }

    anchor.set_attr("target", "_blank");
    anchor.set_attr("rel", "noopener noreferrer");
    anchor.set_attr("class", "mcp-link");

    let hostname = display_hostname(&href);
    let label = anchor.text_content().trim().to_string();
    let label = if label.is_empty() { hostname.clone() } else { label };

    anchor.children.push(arrow_icon().into());
    let anchor = std::mem::take(anchor);

    Some(
        Element::new("span")
            .class("mcp-link-wrap")
            .child(anchor)
            .child(source_badge(&hostname, &label)),
    )
}

fn favicon(class: &str, hostname: &str, size: &str) -> Element {
    Element::new("img")
        .class(class)
        .attr(
            "src",
            format!("https://www.google.com/s2/favicons?sz=64&domain_url={hostname}"),
        )
        .attr(
            "data-fallback",
            format!("https://icons.duckduckgo.com/ip3/{hostname}.ico"),
        )
        .attr("alt", format!("{hostname} favicon"))
        .attr("width", size)
        .attr("height", size)
        .attr("loading", "lazy")
        .attr("decoding", "async")
        .attr("referrerpolicy", "no-referrer")
}

fn source_badge(hostname: &str, label: &str) -> Element {
    let title = Element::new("span")
        .class("mcp-link-tooltip-title")
        .child(Element::new("span").class("mcp-link-tooltip-icon").child(link_icon()))
        .child(favicon("mcp-link-tooltip-favicon", hostname, "14"))
        .text(hostname);
    let subtitle = Element::new("span")
        .class("mcp-link-tooltip-subtitle")
        .text(format!("{label} | {hostname}"));
    let tooltip = Element::new("span").class("mcp-link-tooltip").child(
        Element::new("span")
            .class("mcp-link-tooltip-card")
            .child(title)
            .child(subtitle),
    );

    Element::new("span")
        .class("mcp-link-source")
        .child(favicon("mcp-link-favicon", hostname, "12"))
        .text(hostname)
        .child(tooltip)
}

fn lucide_svg(size: &str) -> Element {
    Element::new("svg")
        .attr("xmlns", "http://www.w3.org/2000/svg")
        .attr("width", size)
        .attr("height", size)
        .attr("viewBox", "0 0 24 24")
        .attr("fill", "none")
        .attr("stroke", "currentColor")
        .attr("stroke-width", "2")
        .attr("stroke-linecap", "round")
        .attr("stroke-linejoin", "round")
        .attr("aria-hidden", "true")
}

fn path(d: &str) -> Element {
    Element::new("path").attr("d", d)
}

fn arrow_icon() -> Element {
    lucide_svg("24")
        .attr("class", "mcp-link-arrow lucide lucide-external-link")
        .child(path("M7 7h10v10"))
        .child(path("M7 17 17 7"))
}

fn link_icon() -> Element {
    lucide_svg("14")
        .attr("class", "lucide lucide-link-2")
        .child(path("M15 7h3a5 5 0 0 1 0 10h-3"))
        .child(path("M9 17H6a5 5 0 0 1 0-10h3"))
        .child(
            Element::new("line")
                .attr("x1", "8")
                .attr("y1", "12")
                .attr("x2", "16")
                .attr("y2", "12"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hast::to_html;

    fn link(href: &str, label: &str) -> Vec<HtmlNode> {
        vec![Element::new("a").attr("href", href).text(label).into()]
    }

    #[test]
    fn classifies_urls() {
        for safe in [
            "https://example.com",
            "HTTP://example.com",
            "mailto:a@b.c",
            "tel:+123",
            "#top",
            "/docs",
            "./x",
            "../y",
            "//cdn.example.com/x",
            "relative/path",
        ] {
            assert!(is_safe_url(safe), "{safe} should be safe");
        }
        for unsafe_url in [
            "javascript:alert(1)",
            " JavaScript:alert(1)",
            "data:text/html;base64,AAAA",
            "vbscript:msgbox",
            "file:///etc/passwd",
            "",
            "   ",
        ] {
            assert!(!is_safe_url(unsafe_url), "{unsafe_url} should be unsafe");
        }
    }

    #[test]
    fn hostname_falls_back_to_raw_href() {
        assert_eq!(display_hostname("https://docs.rs/tokio"), "docs.rs");
        assert_eq!(display_hostname("mailto:a@b.c"), "mailto:a@b.c");
        assert_eq!(display_hostname("/docs"), "/docs");
    }

    #[test]
    fn demotes_unsafe_links_to_spans() {
        let mut tree = link("javascript:alert(1)", "click");
        harden_links(&mut tree);
        assert_eq!(to_html(&tree), "<span>click</span>");
    }

    #[test]
    fn wraps_safe_links_with_source_badge() {
        let mut tree = link("https://example.com/page", "Example");
        harden_links(&mut tree);
        let html = to_html(&tree);
        assert!(html.starts_with(
            "<span class=\"mcp-link-wrap\"><a href=\"https://example.com/page\" \
             target=\"_blank\" rel=\"noopener noreferrer\" class=\"mcp-link\">Example<svg"
        ));
        assert!(html.contains("lucide-external-link"));
        assert!(html.contains("domain_url=example.com\""));
        assert!(html.contains("data-fallback=\"https://icons.duckduckgo.com/ip3/example.com.ico\""));
        assert!(html.contains("Example | example.com"));
    }

    #[test]
    fn empty_label_uses_hostname() {
        let mut tree = link("https://example.com", "  ");
        harden_links(&mut tree);
        assert!(to_html(&tree).contains("example.com | example.com"));
    }

    #[test]
    fn anchors_without_href_are_left_alone() {
        let mut tree = vec![Element::new("a").text("anchor").into()];
        harden_links(&mut tree);
        assert_eq!(to_html(&tree), "<a>anchor</a>");
    }
}
