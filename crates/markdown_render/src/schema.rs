use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

pub const ANY_TAG: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub tag_names: BTreeSet<String>,
    pub attributes: BTreeMap<String, BTreeSet<String>>,
    pub protocols: BTreeMap<String, BTreeSet<String>>,
    pub required: BTreeMap<String, Vec<(String, String)>>,
    pub strip: BTreeSet<String>,
    pub clobber: BTreeSet<String>,
    pub clobber_prefix: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaExtension<'a> {
    pub tag_names: &'a [&'a str],
    pub global_attributes: &'a [&'a str],
    pub attributes: &'a [(&'a str, &'a [&'a str])],
}

const BASE_TAG_ATTRIBUTES: &[(&str, &[&str])] = &[
    ("a", &["href"]),
    ("blockquote", &["cite"]),
    ("del", &["cite"]),
    ("img", &["src", "longdesc"]),
    ("input", &["checked", "disabled", "type"]),
    ("ins", &["cite"]),
    ("li", &["class"]),
    ("ol", &["class", "start"]),
    ("ul", &["class"]),
    ("q", &["cite"]),
];

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

impl Schema {
    pub fn github_default() -> Self {
        let tag_names = set(&[
            "a", "b", "blockquote", "br", "code", "dd", "del", "details", "div", "dl", "dt", "em",
            "h1", "h2", "h3", "h4", "h5", "h6", "hr", "i", "img", "input", "ins", "kbd", "li",
            "ol", "p", "pre", "q", "rp", "rt", "ruby", "s", "samp", "section", "span", "strike",
            "strong", "sub", "summary", "sup", "table", "tbody", "td", "tfoot", "th", "thead",
            "tr", "tt", "ul", "var",
        ]);

        let mut attributes = BTreeMap::new();
        attributes.insert(
            ANY_TAG.to_string(),
            set(&[
                "abbr", "align", "alt", "aria-describedby", "aria-labelledby", "border",
                "cellpadding", "cellspacing", "colspan", "dir", "headers", "height", "hreflang",
                "id", "label", "lang", "name", "open", "rowspan", "scope", "span", "start",
                "summary", "tabindex", "title", "valign", "width",
            ]),
        );
        for (tag, attrs) in BASE_TAG_ATTRIBUTES {
            attributes.insert(tag.to_string(), set(attrs));
        }

        let mut protocols = BTreeMap::new();
        protocols.insert(
            "href".to_string(),
            set(&["http", "https", "mailto", "xmpp", "irc", "ircs"]),
        );
        for attr in ["src", "cite", "longdesc"] {
            protocols.insert(attr.to_string(), set(&["http", "https"]));
        }

        let mut required = BTreeMap::new();
        required.insert(
            "input".to_string(),
            vec![
                ("type".to_string(), "checkbox".to_string()),
                ("disabled".to_string(), String::new()),
            ],
        );

        Self {
            tag_names,
            attributes,
            protocols,
            required,
            strip: set(&[
                "script", "style", "iframe", "object", "embed", "noscript", "template", "textarea",
                "title",
            ]),
            clobber: set(&["id", "name"]),
            clobber_prefix: "user-content-".to_string(),
        }
    }

    /// Union of `self` and `extension`; nothing already allowed is removed and
    /// protocol, strip and clobber rules are carried over unchanged.
    pub fn merged(&self, extension: &SchemaExtension<'_>) -> Schema {
        let mut merged = self.clone();
        merged
            .tag_names
            .extend(extension.tag_names.iter().map(|tag| tag.to_string()));
        merged
            .attributes
            .entry(ANY_TAG.to_string())
            .or_default()
            .extend(extension.global_attributes.iter().map(|attr| attr.to_string()));
        for (tag, attrs) in extension.attributes {
            merged
                .attributes
                .entry(tag.to_string())
                .or_default()
                .extend(attrs.iter().map(|attr| attr.to_string()));
        }
        merged
    }

    pub fn allows_tag(&self, tag: &str) -> bool {
        self.tag_names.contains(tag)
    }

    pub fn allows_attribute(&self, tag: &str, attribute: &str) -> bool {
        [tag, ANY_TAG].iter().any(|key| {
            self.attributes
                .get(*key)
                .is_some_and(|allowed| allowed.contains(attribute))
        })
    }
}

const SVG_ATTRIBUTES: &[&str] = &[
    "xmlns",
    "width",
    "height",
    "viewBox",
    "fill",
    "stroke",
    "stroke-width",
    "stroke-linecap",
    "stroke-linejoin",
];

pub const RENDER_EXTENSION: SchemaExtension<'static> = SchemaExtension {
    tag_names: &[
        "div", "span", "pre", "code", "table", "thead", "tbody", "tr", "th", "td", "ul", "ol",
        "li", "blockquote", "hr", "br", "button", "svg", "path", "rect", "line", "img", "input",
        "h1", "h2", "h3", "h4", "h5", "h6", "math", "semantics", "annotation", "mrow", "mi", "mo",
        "mn", "msup", "msub", "msubsup", "mfrac", "msqrt", "mtext", "mspace", "munder", "mover",
        "munderover", "mtable", "mtr", "mtd", "mlabeledtr",
    ],
    global_attributes: &["class", "style", "aria-hidden", "aria-label", "role"],
    attributes: &[
        ("a", &["href", "title", "target", "rel"]),
        ("code", &["class", "data-code-id"]),
        ("div", &["data-block-id"]),
        ("button", &["type", "title", "data-code-id"]),
        ("svg", SVG_ATTRIBUTES),
        ("rect", &["width", "height", "x", "y", "rx", "ry"]),
        ("path", &["d"]),
        ("line", &["x1", "y1", "x2", "y2"]),
        (
            "img",
            &[
                "src",
                "alt",
                "title",
                "width",
                "height",
                "data-fallback",
                "loading",
                "decoding",
                "referrerpolicy",
            ],
        ),
        ("math", &["xmlns", "display"]),
        ("annotation", &["encoding"]),
        ("mi", &["mathvariant"]),
        ("mo", &["mathvariant"]),
        ("mn", &["mathvariant"]),
        ("mtext", &["mathvariant"]),
    ],
};

pub static SANITIZE_SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::github_default().merged(&RENDER_EXTENSION));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_a_union() {
        let base = Schema::github_default();
        let merged = base.merged(&SchemaExtension {
            tag_names: &["button", "a"],
            global_attributes: &["class"],
            attributes: &[("a", &["target"]), ("button", &["type"])],
        });

        assert!(base.tag_names.is_subset(&merged.tag_names));
        assert!(merged.allows_tag("button"));
        assert_eq!(
            merged.tag_names.len(),
            base.tag_names.len() + 1,
            "duplicates collapse"
        );
        assert!(merged.allows_attribute("a", "href"));
        assert!(merged.allows_attribute("a", "target"));
        assert!(merged.allows_attribute("p", "class"));
        assert!(!base.allows_attribute("button", "type"));
        assert_eq!(merged.protocols, base.protocols);
        assert_eq!(merged.strip, base.strip);
    }

    #[test]
    fn render_policy_covers_transform_output_but_not_handlers() {
        let schema = &*SANITIZE_SCHEMA;
        for tag in ["button", "svg", "math", "annotation", "msup", "line"] {
            assert!(schema.allows_tag(tag), "{tag}");
        }
        assert!(!schema.allows_tag("script"));
        assert!(!schema.allows_tag("iframe"));
        assert!(schema.allows_attribute("code", "data-code-id"));
        assert!(schema.allows_attribute("img", "data-fallback"));
        assert!(schema.allows_attribute("span", "aria-hidden"));
        assert!(!schema.allows_attribute("img", "onerror"));
        assert!(!schema.allows_attribute("a", "onclick"));
    }
}
