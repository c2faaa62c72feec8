use std::sync::LazyLock;

use regex::Regex;

use crate::hast::{Element, HtmlNode};

static BR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br pattern"));
static LIST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(?:<ul>\s*)?((?:<li>.*?</li>\s*)+)(?:</ul>)?$").expect("valid list pattern")
});
static LI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<li>(.*?)</li>").expect("valid li pattern"));

pub fn restore_table_html(nodes: &mut [HtmlNode]) {
    for node in nodes.iter_mut() {
        let HtmlNode::Element(element) = node else {
            continue;
        };
        if element.tag == "td" || element.tag == "th" {
            process_cell(&mut element.children);
        } else {
            restore_table_html(&mut element.children);
        }
    }
}

fn process_cell(children: &mut Vec<HtmlNode>) {
    let mut index = 0;
    while index < children.len() {
        if !matches!(children[index], HtmlNode::Text(_)) {
            if let HtmlNode::Element(element) = &mut children[index] {
                process_cell(&mut element.children);
            }
            index += 1;
            continue;
        }

        let end = run_end(children, index);
        let combined = combine_run(&children[index..end]);
        if let Some(list) = parse_list(&combined) {
            children.splice(index..end, [HtmlNode::from(list)]);
            index += 1;
            continue;
        }

        let expanded: Vec<HtmlNode> = children[index..end]
            .iter()
            .flat_map(|node| match node {
                HtmlNode::Text(value) => expand_br_tags(value),
                other => vec![other.clone()],
            })
            .collect();
        let replaced = expanded.len();
        children.splice(index..end, expanded);
        index += replaced;
    }
}

fn run_end(children: &[HtmlNode], start: usize) -> usize {
    children[start..]
        .iter()
        .position(|node| !matches!(node, HtmlNode::Text(_)) && !node.is_element("br"))
        .map_or(children.len(), |offset| start + offset)
}

fn combine_run(run: &[HtmlNode]) -> String {
    run.iter()
        .map(|node| match node {
            HtmlNode::Text(value) => value.as_str(),
            HtmlNode::Element(_) => "\n",
        })
        .collect()
}

fn expand_br_tags(value: &str) -> Vec<HtmlNode> {
    let mut nodes = Vec::new();
    let mut cursor = 0;
    for found in BR_PATTERN.find_iter(value) {
        if found.start() > cursor {
            nodes.push(HtmlNode::text(&value[cursor..found.start()]));
        }
        nodes.push(Element::new("br").into());
        cursor = found.end();
    }
    if cursor < value.len() || nodes.is_empty() {
        nodes.push(HtmlNode::text(&value[cursor..]));
    }
    nodes
}

fn parse_list(value: &str) -> Option<Element> {
    let captures = LIST_PATTERN.captures(value.trim())?;
    let body = captures.get(1)?.as_str();

    let mut list = Element::new("ul");
    let mut cursor = 0;
    for item in LI_PATTERN.captures_iter(body) {
        let whole = item.get(0)?;
        if !body[cursor..whole.start()].trim().is_empty() {
            return None;
        }
        let content = item.get(1).map_or("", |m| m.as_str());
        let mut li = Element::new("li");
        li.children = expand_br_tags(content);
        list.children.push(li.into());
        cursor = whole.end();
    }

    if list.children.is_empty() || !body[cursor..].trim().is_empty() {
        return None;
    }
    Some(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hast::to_html;

    fn cell(children: Vec<HtmlNode>) -> Vec<HtmlNode> {
        let mut td = Element::new("td");
        td.children = children;
        vec![Element::new("table").child(Element::new("tr").child(td)).into()]
    }

    fn restored(children: Vec<HtmlNode>) -> String {
        let mut tree = cell(children);
        restore_table_html(&mut tree);
        to_html(&tree)
    }

    #[test]
    fn turns_full_list_grammar_into_list() {
        let html = restored(vec![
            HtmlNode::text("<li>a</li>"),
            HtmlNode::text("<li>b<br>c</li>"),
        ]);
        assert_eq!(
            html,
            "<table><tr><td><ul><li>a</li><li>b<br>c</li></ul></td></tr></table>"
        );
    }

    #[test]
    fn accepts_wrapping_ul_and_break_separators() {
        let html = restored(vec![
            HtmlNode::text("<ul><li>a</li>"),
            Element::new("br").into(),
            HtmlNode::text("<li>b</li></ul>"),
        ]);
        assert_eq!(
            html,
            "<table><tr><td><ul><li>a</li><li>b</li></ul></td></tr></table>"
        );
    }

    #[test]
    fn stray_text_keeps_literal_markup() {
        let html = restored(vec![HtmlNode::text("see <li>a</li>")]);
        assert_eq!(
            html,
            "<table><tr><td>see &lt;li&gt;a&lt;/li&gt;</td></tr></table>"
        );
        assert!(parse_list("<li>a</li> trailing").is_none());
    }

    #[test]
    fn expands_literal_breaks_only_up_to_the_next_element() {
        let html = restored(vec![
            HtmlNode::text("one<br/>two"),
            Element::new("strong").text("x<BR>y").into(),
            HtmlNode::text("three"),
        ]);
        assert_eq!(
            html,
            "<table><tr><td>one<br>two<strong>x<br>y</strong>three</td></tr></table>"
        );
    }

    #[test]
    fn text_outside_cells_is_untouched() {
        let mut tree = vec![Element::new("p").text("a<br>b").into()];
        restore_table_html(&mut tree);
        assert_eq!(to_html(&tree), "<p>a&lt;br&gt;b</p>");
    }
}
