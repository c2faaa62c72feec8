use std::sync::LazyLock;

use anyhow::Result;
use syntect::parsing::{
    BasicScopeStackOp, ParseState, Scope, ScopeStack, SyntaxReference, SyntaxSet,
};
use syntect::util::LinesWithEndings;
use tracing::debug;

use crate::hast::{Element, HtmlNode};

const CLASS_PREFIX: &str = "hljs-";
const MAX_SPAN_DEPTH: usize = 32;

static SYNTAXES: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);

pub trait Highlighter: Send + Sync {
    fn highlight(&self, language: &str, code: &str) -> Option<Vec<HtmlNode>>;
}

/// Scope spans from syntect's bundled grammars, one `hljs-<atom>` class per
/// scope atom.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntectHighlighter;

impl Highlighter for SyntectHighlighter {
    fn highlight(&self, language: &str, code: &str) -> Option<Vec<HtmlNode>> {
        let syntax = syntax_for(language)?;
        match classed_spans(syntax, code) {
            Ok(nodes) => Some(nodes),
            Err(err) => {
                debug!(%language, error = %err, "highlighting failed; leaving code plain");
                None
            }
        }
    }
}

fn syntax_for(language: &str) -> Option<&'static SyntaxReference> {
    let syntax = SYNTAXES.find_syntax_by_token(language)?;
    (syntax.name != "Plain Text").then_some(syntax)
}

fn classed_spans(syntax: &SyntaxReference, code: &str) -> Result<Vec<HtmlNode>> {
    let mut state = ParseState::new(syntax);
    let mut stack = ScopeStack::new();
    let mut spans = SpanBuilder::default();

    for line in LinesWithEndings::from(code) {
        let ops = state.parse_line(line, &SYNTAXES)?;
        let mut cursor = 0;
        for (offset, op) in ops {
            spans.text(&line[cursor..offset]);
            cursor = offset;
            stack.apply_with_hook(&op, |basic, _| match basic {
                BasicScopeStackOp::Push(scope) => spans.open(scope),
                BasicScopeStackOp::Pop => spans.close(),
            })?;
        }
        spans.text(&line[cursor..]);
    }

    Ok(spans.finish())
}

/// Builds nested spans from scope pushes and pops. Pushes beyond
/// `MAX_SPAN_DEPTH` are counted but produce no element.
#[derive(Default)]
struct SpanBuilder {
    root: Vec<HtmlNode>,
    open: Vec<Element>,
    skipped: usize,
}

impl SpanBuilder {
    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let children = match self.open.last_mut() {
            Some(span) => &mut span.children,
            None => &mut self.root,
        };
        match children.last_mut() {
            Some(HtmlNode::Text(previous)) => previous.push_str(text),
            _ => children.push(HtmlNode::text(text)),
        }
    }

    fn open(&mut self, scope: Scope) {
        if self.open.len() >= MAX_SPAN_DEPTH {
            self.skipped += 1;
            return;
        }
        let mut span = Element::new("span");
        for atom in scope.build_string().split('.') {
            span.add_class(&format!("{CLASS_PREFIX}{atom}"));
        }
        self.open.push(span);
    }

    fn close(&mut self) {
        if self.skipped > 0 {
            self.skipped -= 1;
            return;
        }
        if let Some(span) = self.open.pop() {
            self.attach(span);
        }
    }

    fn attach(&mut self, span: Element) {
        if span.children.is_empty() {
            return;
        }
        match self.open.last_mut() {
            Some(parent) => parent.children.push(span.into()),
            None => self.root.push(span.into()),
        }
    }

    fn finish(mut self) -> Vec<HtmlNode> {
        while let Some(span) = self.open.pop() {
            self.attach(span);
        }
        self.root
    }
}

pub fn highlight_code_blocks(nodes: &mut [HtmlNode], highlighter: &dyn Highlighter) {
    for node in nodes.iter_mut() {
        let HtmlNode::Element(element) = node else {
            continue;
        };
        if element.tag == "pre" {
            for child in element.children.iter_mut() {
                if let HtmlNode::Element(code) = child {
                    if code.tag == "code" {
                        highlight_code(code, highlighter);
                    }
                }
            }
        } else {
            highlight_code_blocks(&mut element.children, highlighter);
        }
    }
}

fn highlight_code(code: &mut Element, highlighter: &dyn Highlighter) {
    let Some(language) = code
        .classes()
        .find_map(|class| class.strip_prefix("language-"))
        .map(str::to_string)
    else {
        return;
    };
    if language == "math" {
        return;
    }
    if let Some(children) = highlighter.highlight(&language, &code.text_content()) {
        code.add_class("hljs");
        code.children = children;
    }
}
