use pulldown_cmark::{Alignment, CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum MdNode {
    Parent(MdParent),
    Text(String),
    Html(String),
    InlineCode(String),
    InlineMath(String),
    DisplayMath(String),
    Code { lang: Option<String>, value: String },
    Break,
    ThematicBreak,
    TaskMarker(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MdParent {
    pub kind: ParentKind,
    pub children: Vec<MdNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    None,
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParentKind {
    Root,
    /// `tight` paragraphs are the implicit ones inside tight list items and
    /// render without a `<p>` wrapper. `literal_html` marks paragraphs
    /// synthesized from raw HTML blocks.
    Paragraph { literal_html: bool, tight: bool },
    Heading(u8),
    BlockQuote,
    List { start: Option<u64> },
    ListItem,
    Table(Vec<Align>),
    TableHead,
    TableRow,
    TableCell,
    Emphasis,
    Strong,
    Delete,
    Link { url: String, title: String },
    Image { url: String, title: String },
    /// Constructs the renderer has no dedicated node for; children are
    /// spliced into the enclosing parent.
    Fragment,
}

impl ParentKind {
    pub fn is_phrasing(&self) -> bool {
        matches!(
            self,
            ParentKind::Paragraph { .. }
                | ParentKind::Heading(_)
                | ParentKind::TableCell
                | ParentKind::Emphasis
                | ParentKind::Strong
                | ParentKind::Delete
                | ParentKind::Link { .. }
        )
    }

    fn is_inline(&self) -> bool {
        matches!(
            self,
            ParentKind::Emphasis
                | ParentKind::Strong
                | ParentKind::Delete
                | ParentKind::Link { .. }
                | ParentKind::Image { .. }
        )
    }
}

impl MdParent {
    pub fn new(kind: ParentKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }
}

impl MdNode {
    fn is_inline(&self) -> bool {
        match self {
            MdNode::Parent(parent) => parent.kind.is_inline(),
            MdNode::Code { .. } | MdNode::ThematicBreak => false,
            _ => true,
        }
    }
}

impl From<Alignment> for Align {
    fn from(alignment: Alignment) -> Self {
        match alignment {
            Alignment::None => Align::None,
            Alignment::Left => Align::Left,
            Alignment::Center => Align::Center,
            Alignment::Right => Align::Right,
        }
    }
}

pub fn parser_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_MATH
}

pub fn parse(markdown: &str) -> MdParent {
    let mut builder = TreeBuilder::default();
    for event in Parser::new_ext(markdown, parser_options()) {
        builder.push_event(event);
    }
    builder.finish()
}

struct TreeBuilder {
    stack: Vec<MdParent>,
    code: Option<(Option<String>, String)>,
    html: Option<String>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self {
            stack: vec![MdParent::new(ParentKind::Root)],
            code: None,
            html: None,
        }
    }
}

impl TreeBuilder {
    fn push_event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(Tag::CodeBlock(kind)) => {
                let lang = match kind {
                    CodeBlockKind::Fenced(info) => info
                        .split_whitespace()
                        .next()
                        .map(|lang| lang.trim_matches(['{', '}', '.']).to_string())
                        .filter(|lang| !lang.is_empty()),
                    CodeBlockKind::Indented => None,
                };
                self.code = Some((lang, String::new()));
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((lang, value)) = self.code.take() {
                    self.append(MdNode::Code { lang, value });
                }
            }
            Event::Start(Tag::HtmlBlock) => self.html = Some(String::new()),
            Event::End(TagEnd::HtmlBlock) => {
                if let Some(html) = self.html.take() {
                    let value = html.trim_end_matches(['\r', '\n']).to_string();
                    self.append(MdNode::Html(value));
                }
            }
            Event::Start(tag) => self.open(parent_kind(tag)),
            Event::End(_) => self.close(),
            Event::Text(text) => {
                if let Some((_, value)) = self.code.as_mut() {
                    value.push_str(&text);
                } else if let Some(html) = self.html.as_mut() {
                    html.push_str(&text);
                } else {
                    self.append_text(&text);
                }
            }
            Event::Html(html) => match self.html.as_mut() {
                Some(block) => block.push_str(&html),
                None => self.append(MdNode::Html(html.into_string())),
            },
            Event::InlineHtml(html) => self.append(MdNode::Html(html.into_string())),
            Event::Code(code) => self.append(MdNode::InlineCode(code.into_string())),
            Event::InlineMath(math) => self.append(MdNode::InlineMath(math.into_string())),
            Event::DisplayMath(math) => self.append(MdNode::DisplayMath(math.into_string())),
            Event::FootnoteReference(label) => self.append_text(&format!("[^{label}]")),
            Event::SoftBreak | Event::HardBreak => self.append(MdNode::Break),
            Event::Rule => self.append(MdNode::ThematicBreak),
            Event::TaskListMarker(checked) => self.append(MdNode::TaskMarker(checked)),
        }
    }

    /// Past `MAX_NESTING` open parents, new parents become fragments so the
    /// tree stays shallow. Rows and cells of a kept table are exempt.
    fn open(&mut self, kind: ParentKind) {
        let table_part = matches!(
            kind,
            ParentKind::TableHead | ParentKind::TableRow | ParentKind::TableCell
        );
        let too_deep = self.stack.len() > MAX_NESTING
            && !(table_part && self.current().kind != ParentKind::Fragment);
        let kind = if too_deep { ParentKind::Fragment } else { kind };
        self.stack.push(MdParent::new(kind));
    }

    fn current(&mut self) -> &mut MdParent {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn append(&mut self, node: MdNode) {
        self.current().children.push(node);
    }

    fn append_text(&mut self, text: &str) {
        let children = &mut self.current().children;
        if let Some(MdNode::Text(previous)) = children.last_mut() {
            previous.push_str(text);
        } else {
            children.push(MdNode::Text(text.to_string()));
        }
    }

    fn close(&mut self) {
        if self.stack.len() <= 1 {
            return;
        }
        let Some(mut node) = self.stack.pop() else {
            return;
        };
        if node.kind == ParentKind::ListItem {
            wrap_tight_runs(&mut node.children);
        }
        let parent = self.current();
        if node.kind == ParentKind::Fragment {
            parent.children.extend(node.children);
        } else {
            parent.children.push(MdNode::Parent(node));
        }
    }

    fn finish(mut self) -> MdParent {
        while self.stack.len() > 1 {
            self.close();
        }
        self.stack.pop().unwrap_or_else(|| MdParent::new(ParentKind::Root))
    }
}

fn parent_kind(tag: Tag<'_>) -> ParentKind {
    match tag {
        Tag::Paragraph => ParentKind::Paragraph {
            literal_html: false,
            tight: false,
        },
        Tag::Heading { level, .. } => ParentKind::Heading(level as u8),
        Tag::BlockQuote(_) => ParentKind::BlockQuote,
        Tag::List(start) => ParentKind::List { start },
        Tag::Item => ParentKind::ListItem,
        Tag::Table(alignments) => {
            ParentKind::Table(alignments.into_iter().map(Align::from).collect())
        }
        Tag::TableHead => ParentKind::TableHead,
        Tag::TableRow => ParentKind::TableRow,
        Tag::TableCell => ParentKind::TableCell,
        Tag::Emphasis => ParentKind::Emphasis,
        Tag::Strong => ParentKind::Strong,
        Tag::Strikethrough => ParentKind::Delete,
        Tag::Link {
            dest_url, title, ..
        } => ParentKind::Link {
            url: dest_url.into_string(),
            title: title.into_string(),
        },
        Tag::Image {
            dest_url, title, ..
        } => ParentKind::Image {
            url: dest_url.into_string(),
            title: title.into_string(),
        },
        _ => ParentKind::Fragment,
    }
}

fn wrap_tight_runs(children: &mut Vec<MdNode>) {
    let original = std::mem::take(children);
    let mut run = Vec::new();
    for child in original {
        if child.is_inline() {
            run.push(child);
        } else {
            flush_run(children, &mut run);
            children.push(child);
        }
    }
    flush_run(children, &mut run);
}

fn flush_run(children: &mut Vec<MdNode>, run: &mut Vec<MdNode>) {
    if run.is_empty() {
        return;
    }
    children.push(MdNode::Parent(MdParent {
        kind: ParentKind::Paragraph {
            literal_html: false,
            tight: true,
        },
        children: std::mem::take(run),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_child(root: &MdParent) -> &MdParent {
        match root.children.first() {
            Some(MdNode::Parent(parent)) => parent,
            other => panic!("expected parent, got {other:?}"),
        }
    }

    #[test]
    fn keeps_html_blocks_and_inline_html_as_raw_nodes() {
        let root = parse("<div>\n  hi\n</div>\n\npara <b>x</b>");
        assert_eq!(root.children[0], MdNode::Html("<div>\n  hi\n</div>".to_string()));
        let paragraph = match &root.children[1] {
            MdNode::Parent(parent) => parent,
            other => panic!("expected paragraph, got {other:?}"),
        };
        assert_eq!(
            paragraph.children,
            vec![
                MdNode::Text("para ".to_string()),
                MdNode::Html("<b>".to_string()),
                MdNode::Text("x".to_string()),
                MdNode::Html("</b>".to_string()),
            ]
        );
    }

    #[test]
    fn wraps_tight_list_items_in_implicit_paragraphs() {
        let root = parse("- [x] done\n- plain");
        let list = first_child(&root);
        assert_eq!(list.kind, ParentKind::List { start: None });
        let item = match &list.children[0] {
            MdNode::Parent(item) => item,
            other => panic!("expected item, got {other:?}"),
        };
        let paragraph = first_child(item);
        assert_eq!(
            paragraph.kind,
            ParentKind::Paragraph {
                literal_html: false,
                tight: true
            }
        );
        assert_eq!(paragraph.children[0], MdNode::TaskMarker(true));
    }

    #[test]
    fn records_code_language_and_math() {
        let root = parse("```rust title\nfn main() {}\n```\n\n$x^2$");
        assert_eq!(
            root.children[0],
            MdNode::Code {
                lang: Some("rust".to_string()),
                value: "fn main() {}\n".to_string(),
            }
        );
        let rest = MdParent {
            kind: ParentKind::Root,
            children: root.children[1..].to_vec(),
        };
        let paragraph = first_child(&rest);
        assert_eq!(paragraph.children, vec![MdNode::InlineMath("x^2".to_string())]);
    }

    fn depth(parent: &MdParent) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(parent, 1)];
        while let Some((node, level)) = pending.pop() {
            deepest = deepest.max(level);
            for child in &node.children {
                if let MdNode::Parent(child) = child {
                    pending.push((child, level + 1));
                }
            }
        }
        deepest
    }

    #[test]
    fn flattens_nesting_past_the_limit() {
        let markdown = format!("{}deep", "> ".repeat(10_000));
        let root = parse(&markdown);
        assert!(depth(&root) <= MAX_NESTING + 2, "depth {}", depth(&root));

        let mut text = String::new();
        let mut pending = vec![&root];
        while let Some(node) = pending.pop() {
            for child in &node.children {
                match child {
                    MdNode::Parent(child) => pending.push(child),
                    MdNode::Text(value) => text.push_str(value),
                    _ => {}
                }
            }
        }
        assert_eq!(text, "deep");
    }

    #[test]
    fn keeps_table_rows_at_the_nesting_limit() {
        let quote = "> ".repeat(MAX_NESTING - 1);
        let markdown = format!("{quote}| a |\n{quote}| - |\n{quote}| b |\n");
        let root = parse(&markdown);
        let mut tables = vec![];
        let mut pending = vec![&root];
        while let Some(node) = pending.pop() {
            if matches!(node.kind, ParentKind::Table(_)) {
                tables.push(node);
            }
            for child in &node.children {
                if let MdNode::Parent(child) = child {
                    pending.push(child);
                }
            }
        }
        let table = tables.first().expect("table survives");
        assert!(table.children.iter().all(|row| matches!(
            row,
            MdNode::Parent(MdParent { kind: ParentKind::TableHead | ParentKind::TableRow, .. })
        )));
    }
}
