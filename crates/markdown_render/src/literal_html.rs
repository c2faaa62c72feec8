use crate::mdast::{MdNode, MdParent, ParentKind};

const NBSP: char = '\u{a0}';
const TAB_AS_NBSP: &str = "\u{a0}\u{a0}\u{a0}\u{a0}";

pub fn preserve_literal_html(root: &mut MdParent) {
    visit(root);
}

fn visit(parent: &mut MdParent) {
    let phrasing = parent.kind.is_phrasing();
    let original = std::mem::take(&mut parent.children);
    let mut out: Vec<MdNode> = Vec::with_capacity(original.len());

    for child in original {
        match child {
            MdNode::Html(value) => {
                let replacement = literal_nodes(&value);
                if phrasing {
                    out.extend(replacement);
                } else if let Some(previous) = last_literal_paragraph(&mut out) {
                    if !previous.children.is_empty()
                        && previous.children.last() != Some(&MdNode::Break)
                    {
                        previous.children.push(MdNode::Break);
                    }
                    previous.children.extend(replacement);
                } else {
                    out.push(MdNode::Parent(MdParent {
                        kind: ParentKind::Paragraph {
                            literal_html: true,
                            tight: false,
                        },
                        children: replacement,
                    }));
                }
            }
            MdNode::Parent(mut nested) => {
                visit(&mut nested);
                out.push(MdNode::Parent(nested));
            }
            other => out.push(other),
        }
    }

    parent.children = out;
}

fn last_literal_paragraph(nodes: &mut [MdNode]) -> Option<&mut MdParent> {
    match nodes.last_mut() {
        Some(MdNode::Parent(parent))
            if matches!(
                parent.kind,
                ParentKind::Paragraph {
                    literal_html: true,
                    ..
                }
            ) =>
        {
            Some(parent)
        }
        _ => None,
    }
}

fn literal_nodes(value: &str) -> Vec<MdNode> {
    let mut nodes = Vec::new();
    for (index, line) in value.split('\n').enumerate() {
        if index > 0 {
            nodes.push(MdNode::Break);
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        nodes.push(MdNode::Text(preserve_indent(line)));
    }
    nodes
}

fn preserve_indent(line: &str) -> String {
    let body = line.trim_start_matches([' ', '\t']);
    let indent = &line[..line.len() - body.len()];
    let mut out = String::with_capacity(line.len() + indent.len() * 4);
    for ch in indent.chars() {
        if ch == '\t' {
            out.push_str(TAB_AS_NBSP);
        } else {
            out.push(NBSP);
        }
    }
    out.push_str(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdast::parse;

    fn text(value: &str) -> MdNode {
        MdNode::Text(value.to_string())
    }

    #[test]
    fn converts_indentation() {
        assert_eq!(preserve_indent("  \tx y"), "\u{a0}\u{a0}\u{a0}\u{a0}\u{a0}\u{a0}x y");
        assert_eq!(preserve_indent("plain  "), "plain  ");
    }

    #[test]
    fn block_html_becomes_literal_paragraph() {
        let mut root = parse("<div>\n    indented\n</div>");
        preserve_literal_html(&mut root);
        let MdNode::Parent(paragraph) = &root.children[0] else {
            panic!("expected paragraph");
        };
        assert_eq!(
            paragraph.kind,
            ParentKind::Paragraph {
                literal_html: true,
                tight: false
            }
        );
        assert_eq!(
            paragraph.children,
            vec![
                text("<div>"),
                MdNode::Break,
                text("\u{a0}\u{a0}\u{a0}\u{a0}indented"),
                MdNode::Break,
                text("</div>"),
            ]
        );
    }

    #[test]
    fn merges_adjacent_html_blocks_with_a_break() {
        let mut root = MdParent {
            kind: ParentKind::Root,
            children: vec![
                MdNode::Html("<section>".to_string()),
                MdNode::Html("</section>".to_string()),
            ],
        };
        preserve_literal_html(&mut root);
        assert_eq!(root.children.len(), 1);
        let MdNode::Parent(paragraph) = &root.children[0] else {
            panic!("expected paragraph");
        };
        assert_eq!(
            paragraph.children,
            vec![text("<section>"), MdNode::Break, text("</section>")]
        );
    }

    #[test]
    fn inline_html_is_spliced_as_text() {
        let mut root = parse("a <b>bold</b> c");
        preserve_literal_html(&mut root);
        let MdNode::Parent(paragraph) = &root.children[0] else {
            panic!("expected paragraph");
        };
        assert!(paragraph.children.iter().all(|n| matches!(n, MdNode::Text(_))));
        assert!(paragraph.children.contains(&text("<b>")));
    }
}
