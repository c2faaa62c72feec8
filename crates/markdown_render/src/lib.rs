mod code_blocks;
mod hast;
mod highlight;
mod latex;
mod links;
mod literal_html;
mod math;
mod mdast;
mod sanitize;
mod schema;
mod table_html;
mod to_hast;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tracing::debug;

pub use code_blocks::CodeIdSource;
pub use hast::{Element, HtmlNode};
pub use highlight::{Highlighter, SyntectHighlighter};
pub use latex::normalize_latex;
pub use links::{display_hostname, is_safe_url};
pub use math::{MathMlRenderer, MathRenderer};
pub use schema::{RENDER_EXTENSION, SANITIZE_SCHEMA, Schema, SchemaExtension};

pub struct MarkdownRenderer {
    code_ids: CodeIdSource,
    math: Box<dyn MathRenderer>,
    highlighter: Box<dyn Highlighter>,
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self {
            code_ids: CodeIdSource::Ephemeral,
            math: Box::new(MathMlRenderer),
            highlighter: Box::new(SyntectHighlighter),
        }
    }
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.code_ids = CodeIdSource::Counter(counter);
        self
    }

    pub fn with_math_renderer(mut self, renderer: impl MathRenderer + 'static) -> Self {
        self.math = Box::new(renderer);
        self
    }

    pub fn with_highlighter(mut self, highlighter: impl Highlighter + 'static) -> Self {
        self.highlighter = Box::new(highlighter);
        self
    }

    pub fn render(&self, markdown: &str) -> String {
        let normalized = latex::normalize_latex(markdown);

        let mut document = mdast::parse(&normalized);
        literal_html::preserve_literal_html(&mut document);

        let mut tree = to_hast::to_hast(&document);
        math::render_math(&mut tree, self.math.as_ref());
        highlight::highlight_code_blocks(&mut tree, self.highlighter.as_ref());
        table_html::restore_table_html(&mut tree);
        links::harden_links(&mut tree);
        code_blocks::enhance_code_blocks(&mut tree, &self.code_ids);

        let tree = sanitize::sanitize(tree, &SANITIZE_SCHEMA);
        let html = hast::to_html(&tree);
        debug!(input = markdown.len(), output = html.len(), "rendered markdown");
        html
    }
}

pub fn render_markdown(markdown: &str) -> String {
    MarkdownRenderer::default().render(markdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counted() -> MarkdownRenderer {
        MarkdownRenderer::new().with_code_counter(Arc::new(AtomicU64::new(0)))
    }

    #[test]
    fn script_links_never_become_anchors() {
        for markdown in [
            "[click](javascript:alert(1))",
            "[click](JAVASCRIPT:alert(1))",
            "[click](data:text/html;base64,PHNjcmlwdD4=)",
        ] {
            let html = render_markdown(markdown);
            assert!(!html.contains("<a"), "{markdown} -> {html}");
            assert!(html.contains("click"));
        }
    }

    #[test]
    fn https_links_open_in_new_tab() {
        let html = render_markdown("see [docs](https://docs.rs/tokio)");
        assert!(html.contains("href=\"https://docs.rs/tokio\""));
        assert!(html.contains("target=\"_blank\""));
        assert!(html.contains("rel=\"noopener noreferrer\""));
        assert!(html.contains("class=\"mcp-link-wrap\""));
        assert!(html.contains("docs | docs.rs"));
    }

    #[test]
    fn code_blocks_get_header_and_sequential_ids() {
        let renderer = counted();
        let first = renderer.render("```rust\nfn main() {}\n```");
        assert!(first.contains("data-code-id=\"code-1\""));
        assert!(first.contains("<span class=\"code-block-language\">rust</span>"));
        assert!(first.contains("lucide-copy-icon"));
        assert!(first.contains("language-rust hljs"));
        assert!(first.contains("hljs-rust"));

        let second = renderer.render("```\nplain\n```");
        assert!(second.contains("data-code-id=\"code-2\""));
        assert!(second.contains(">text</span>"));
    }

    #[test]
    fn latex_inside_code_is_not_converted() {
        let html = render_markdown("```\n\\(x\\)\n```");
        assert!(html.contains("\\(x\\)"));
        assert!(!html.contains("katex"));
    }

    #[test]
    fn latex_delimiters_render_as_math() {
        let html = render_markdown("Euler: \\(e^{i\\pi} + 1 = 0\\)");
        assert!(html.contains("<span class=\"katex\"><math"));
        assert!(html.contains("<annotation encoding=\"application/x-tex\">e^{i\\pi} + 1 = 0</annotation>"));

        let display = render_markdown("\\[\\frac{a}{b}\\]");
        assert!(display.contains("katex-display"));
        assert!(display.contains("<mfrac>"));
    }

    #[test]
    fn deeply_nested_input_renders_without_overflow() {
        let quotes = render_markdown(&format!("{}x", "> ".repeat(10_000)));
        assert!(quotes.contains('x'));
        assert!(quotes.matches("<blockquote>").count() <= 70);

        let braces = format!("${}x{}$", "{".repeat(10_000), "}".repeat(10_000));
        let math = render_markdown(&braces);
        assert!(math.contains("class=\"katex\""));
        assert!(math.matches("<mrow>").count() <= 50);
    }

    #[test]
    fn raw_html_is_shown_as_text() {
        let html = render_markdown("<script>alert(1)</script>");
        assert!(!html.contains("<script"));
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));

        let html = render_markdown("x <img src=x onerror=alert(1)> y");
        assert!(!html.contains("<img"));
        assert!(html.contains("&lt;img src=x onerror=alert(1)&gt;"));
    }

    #[test]
    fn literal_html_blocks_keep_indentation() {
        let html = render_markdown("<div>\n    indented\n</div>");
        assert_eq!(
            html,
            "<p>&lt;div&gt;<br>\u{a0}\u{a0}\u{a0}\u{a0}indented<br>&lt;/div&gt;</p>"
        );
    }

    #[test]
    fn table_cells_restore_lists_and_breaks() {
        let html = render_markdown("| a | b |\n|---|---|\n| <li>x</li><li>y</li> | 1<br>2 |");
        assert!(html.contains("<td><ul><li>x</li><li>y</li></ul></td>"));
        assert!(html.contains("<td>1<br>2</td>"));

        let stray = render_markdown("| a |\n|---|\n| see <li>x</li> |");
        assert!(!stray.contains("<ul>"));
        assert!(stray.contains("see &lt;li&gt;x&lt;/li&gt;"));
    }

    #[test]
    fn rendering_output_again_introduces_no_markup() {
        let hostile = "<iframe src=x></iframe>\n\n[x](javascript:alert(1)) <b onclick=y>z</b>";
        let once = render_markdown(hostile);
        let twice = render_markdown(&once);
        for forbidden in ["<iframe", "<script", "<b ", "href=\"javascript"] {
            assert!(!once.contains(forbidden), "{forbidden} in {once}");
            assert!(!twice.contains(forbidden), "{forbidden} in {twice}");
        }
    }

    #[test]
    fn task_lists_render_disabled_checkboxes() {
        let html = render_markdown("- [x] done\n- [ ] todo");
        assert!(html.contains("<input type=\"checkbox\" disabled=\"\" checked=\"\">"));
        assert!(html.contains("class=\"task-list-item\""));
    }

    #[test]
    fn custom_collaborators_are_used() {
        struct Plain;
        impl MathRenderer for Plain {
            fn render(&self, tex: &str, _display: bool) -> HtmlNode {
                Element::new("span").class("tex").text(tex).into()
            }
        }
        struct NoHighlight;
        impl Highlighter for NoHighlight {
            fn highlight(&self, _language: &str, _code: &str) -> Option<Vec<HtmlNode>> {
                None
            }
        }

        let renderer = counted()
            .with_math_renderer(Plain)
            .with_highlighter(NoHighlight);
        let html = renderer.render("$a$\n\n```rust\nlet x;\n```");
        assert!(html.contains("<span class=\"tex\">a</span>"));
        assert!(!html.contains("hljs"));
    }
}
