use crate::hast::{Element, HtmlNode};
use crate::mdast::{Align, MdNode, MdParent, ParentKind};

pub fn to_hast(root: &MdParent) -> Vec<HtmlNode> {
    convert_children(&root.children)
}

fn convert_children(nodes: &[MdNode]) -> Vec<HtmlNode> {
    nodes.iter().flat_map(convert_node).collect()
}

fn convert_node(node: &MdNode) -> Vec<HtmlNode> {
    let element = match node {
        MdNode::Text(value) => return vec![HtmlNode::text(value.as_str())],
        MdNode::Html(_) => return Vec::new(),
        MdNode::Parent(parent) => return convert_parent(parent),
        MdNode::InlineCode(value) => Element::new("code").text(value.as_str()),
        MdNode::InlineMath(value) => Element::new("code")
            .class("language-math")
            .class("math-inline")
            .text(value.as_str()),
        MdNode::DisplayMath(value) => Element::new("pre").child(
            Element::new("code")
                .class("language-math")
                .class("math-display")
                .text(value.as_str()),
        ),
        MdNode::Code { lang, value } => {
            let mut code = Element::new("code");
            if let Some(lang) = lang {
                code.add_class(&format!("language-{lang}"));
            }
            Element::new("pre").child(code.text(value.as_str()))
        }
        MdNode::Break => Element::new("br"),
        MdNode::ThematicBreak => Element::new("hr"),
        MdNode::TaskMarker(checked) => {
            let input = Element::new("input")
                .attr("type", "checkbox")
                .attr("disabled", "");
            if *checked {
                input.attr("checked", "")
            } else {
                input
            }
        }
    };
    vec![element.into()]
}

fn convert_parent(parent: &MdParent) -> Vec<HtmlNode> {
    let children = || convert_children(&parent.children);
    let element = match &parent.kind {
        ParentKind::Root | ParentKind::Fragment => return children(),
        ParentKind::Paragraph { tight: true, .. } => return children(),
        ParentKind::Paragraph { .. } => wrap("p", children()),
        ParentKind::Heading(level) => wrap(&format!("h{}", (*level).clamp(1, 6)), children()),
        ParentKind::BlockQuote => wrap("blockquote", children()),
        ParentKind::List { start } => {
            let mut list = match start {
                Some(start) => {
                    let list = Element::new("ol");
                    if *start != 1 {
                        list.attr("start", start.to_string())
                    } else {
                        list
                    }
                }
                None => Element::new("ul"),
            };
            if parent.children.iter().any(|child| match child {
                MdNode::Parent(item) => is_task_item(item),
                _ => false,
            }) {
                list.add_class("contains-task-list");
            }
            list.children = children();
            list
        }
        ParentKind::ListItem => {
            let mut item = wrap("li", children());
            if is_task_item(parent) {
                item.add_class("task-list-item");
            }
            item
        }
        ParentKind::Table(aligns) => convert_table(aligns, &parent.children),
        ParentKind::TableHead | ParentKind::TableRow => {
            convert_row(&parent.children, &[], "td")
        }
        ParentKind::TableCell => wrap("td", children()),
        ParentKind::Emphasis => wrap("em", children()),
        ParentKind::Strong => wrap("strong", children()),
        ParentKind::Delete => wrap("del", children()),
        ParentKind::Link { url, title } => {
            let mut link = Element::new("a").attr("href", url.as_str());
            if !title.is_empty() {
                link.set_attr("title", title.as_str());
            }
            link.children = children();
            link
        }
        ParentKind::Image { url, title } => {
            let mut alt = String::new();
            collect_plain_text(&parent.children, &mut alt);
            let mut image = Element::new("img")
                .attr("src", url.as_str())
                .attr("alt", alt);
            if !title.is_empty() {
                image.set_attr("title", title.as_str());
            }
            image
        }
    };
    vec![element.into()]
}

fn wrap(tag: &str, children: Vec<HtmlNode>) -> Element {
    let mut element = Element::new(tag);
    element.children = children;
    element
}

fn is_task_item(item: &MdParent) -> bool {
    match item.children.first() {
        Some(MdNode::TaskMarker(_)) => true,
        Some(MdNode::Parent(first)) if matches!(first.kind, ParentKind::Paragraph { .. }) => {
            matches!(first.children.first(), Some(MdNode::TaskMarker(_)))
        }
        _ => false,
    }
}

fn convert_table(aligns: &[Align], rows: &[MdNode]) -> Element {
    let mut table = Element::new("table");
    let mut body = Vec::new();
    for row in rows {
        let MdNode::Parent(row) = row else {
            continue;
        };
        match row.kind {
            ParentKind::TableHead => {
                let head = Element::new("thead").child(convert_row(&row.children, aligns, "th"));
                table.children.push(head.into());
            }
            ParentKind::TableRow => body.push(convert_row(&row.children, aligns, "td").into()),
            _ => {}
        }
    }
    if !body.is_empty() {
        table.children.push(wrap("tbody", body).into());
    }
    table
}

fn convert_row(cells: &[MdNode], aligns: &[Align], cell_tag: &str) -> Element {
    let mut row = Element::new("tr");
    for (index, cell) in cells.iter().enumerate() {
        let MdNode::Parent(cell) = cell else {
            continue;
        };
        let mut element = wrap(cell_tag, convert_children(&cell.children));
        let align = match aligns.get(index) {
            Some(Align::Left) => Some("left"),
            Some(Align::Center) => Some("center"),
            Some(Align::Right) => Some("right"),
            _ => None,
        };
        if let Some(align) = align {
            element.set_attr("align", align);
        }
        row.children.push(element.into());
    }
    row
}

fn collect_plain_text(nodes: &[MdNode], out: &mut String) {
    for node in nodes {
        match node {
            MdNode::Text(value) | MdNode::InlineCode(value) | MdNode::InlineMath(value) => {
                out.push_str(value)
            }
            MdNode::Parent(parent) => collect_plain_text(&parent.children, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hast::to_html;
    use crate::mdast::parse;

    fn render(markdown: &str) -> String {
        to_html(&to_hast(&parse(markdown)))
    }

    #[test]
    fn renders_basic_blocks() {
        assert_eq!(render("# Title\n\nsome *em* text"), "<h1>Title</h1><p>some <em>em</em> text</p>");
        assert_eq!(render("1. a\n2. b"), "<ol><li>a</li><li>b</li></ol>");
        assert_eq!(render("3. a"), "<ol start=\"3\"><li>a</li></ol>");
    }

    #[test]
    fn renders_tables_with_head_and_body() {
        let html = render("| a | b |\n|:-|-:|\n| 1 | 2 |");
        assert_eq!(
            html,
            "<table><thead><tr><th align=\"left\">a</th><th align=\"right\">b</th></tr></thead>\
             <tbody><tr><td align=\"left\">1</td><td align=\"right\">2</td></tr></tbody></table>"
        );
    }

    #[test]
    fn marks_math_and_code() {
        assert_eq!(
            render("$x$"),
            "<p><code class=\"language-math math-inline\">x</code></p>"
        );
        assert_eq!(
            render("```py\nx = 1\n```"),
            "<pre><code class=\"language-py\">x = 1\n</code></pre>"
        );
    }

    #[test]
    fn renders_task_lists() {
        let html = render("- [ ] todo");
        assert!(html.starts_with("<ul class=\"contains-task-list\"><li class=\"task-list-item\">"));
        assert!(html.contains("<input type=\"checkbox\" disabled=\"\">"));
        assert!(!html.contains("checked"));
    }

    #[test]
    fn drops_unconverted_raw_html() {
        assert_eq!(render("<script>alert(1)</script>"), "");
    }
}
