use crate::hast::{Element, HtmlNode};

const MAX_GROUP_DEPTH: usize = 48;

pub trait MathRenderer: Send + Sync {
    fn render(&self, tex: &str, display: bool) -> HtmlNode;
}

/// KaTeX-shaped MathML (`span.katex > math > semantics`) for the common TeX
/// subset. Unknown commands degrade to identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MathMlRenderer;

impl MathRenderer for MathMlRenderer {
    fn render(&self, tex: &str, display: bool) -> HtmlNode {
        let mut parser = TexParser::new(tex);
        let row = parser.parse_row(false);

        let semantics = Element::new("semantics")
            .child(with_children(Element::new("mrow"), row))
            .child(
                Element::new("annotation")
                    .attr("encoding", "application/x-tex")
                    .text(tex),
            );
        let mut math = Element::new("math")
            .attr("xmlns", "http://www.w3.org/1998/Math/MathML")
            .child(semantics);
        if display {
            math.set_attr("display", "block");
        }

        let katex = Element::new("span").class("katex").child(math);
        if display {
            Element::new("span").class("katex-display").child(katex).into()
        } else {
            katex.into()
        }
    }
}

pub fn render_math(nodes: &mut [HtmlNode], renderer: &dyn MathRenderer) {
    for node in nodes.iter_mut() {
        let HtmlNode::Element(element) = node else {
            continue;
        };
        if let Some(tex) = display_math_source(element) {
            *node = renderer.render(&tex, true);
        } else if element.tag == "code" && element.has_class("math-inline") {
            let tex = element.text_content();
            *node = renderer.render(&tex, false);
        } else {
            render_math(&mut element.children, renderer);
        }
    }
}

fn display_math_source(element: &Element) -> Option<String> {
    if element.tag != "pre" {
        return None;
    }
    element.children.iter().find_map(|child| match child {
        HtmlNode::Element(code) if code.tag == "code" && code.has_class("math-display") => {
            Some(code.text_content())
        }
        _ => None,
    })
}

fn with_children(mut element: Element, children: Vec<HtmlNode>) -> Element {
    element.children = children;
    element
}

fn leaf(tag: &str, text: &str) -> HtmlNode {
    Element::new(tag).text(text).into()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Command(&'a str),
    Symbol(char),
    Number(&'a str),
    Open,
    Close,
    Superscript,
    Subscript,
}

struct TexParser<'a> {
    source: &'a str,
    tokens: Vec<(Token<'a>, usize, usize)>,
    pos: usize,
    depth: usize,
}

impl<'a> TexParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: tokenize(source),
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).map(|(token, _, _)| *token)
    }

    fn next(&mut self) -> Option<Token<'a>> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn parse_row(&mut self, nested: bool) -> Vec<HtmlNode> {
        let mut row = Vec::new();
        while let Some(token) = self.peek() {
            if token == Token::Close {
                self.pos += 1;
                if nested {
                    break;
                }
                continue;
            }
            if let Some(atom) = self.parse_atom() {
                row.push(self.parse_scripts(atom));
            }
        }
        row
    }

    fn parse_atom(&mut self) -> Option<HtmlNode> {
        if self.depth >= MAX_GROUP_DEPTH {
            return self.rest_as_text();
        }
        self.depth += 1;
        let node = self.parse_atom_inner();
        self.depth -= 1;
        node
    }

    /// Everything from the current token on, as one text run.
    fn rest_as_text(&mut self) -> Option<HtmlNode> {
        let &(_, start, _) = self.tokens.get(self.pos)?;
        self.pos = self.tokens.len();
        Some(leaf("mtext", &self.source[start..]))
    }

    fn parse_atom_inner(&mut self) -> Option<HtmlNode> {
        let node = match self.next()? {
            Token::Open => with_children(Element::new("mrow"), self.parse_row(true)).into(),
            Token::Close => return None,
            Token::Superscript => leaf("mo", "^"),
            Token::Subscript => leaf("mo", "_"),
            Token::Number(digits) => leaf("mn", digits),
            Token::Symbol(ch) if ch.is_alphabetic() => leaf("mi", ch.encode_utf8(&mut [0; 4])),
            Token::Symbol(ch) => leaf("mo", ch.encode_utf8(&mut [0; 4])),
            Token::Command(name) => self.command(name),
        };
        Some(node)
    }

    fn required_atom(&mut self) -> HtmlNode {
        self.parse_atom()
            .unwrap_or_else(|| Element::new("mrow").into())
    }

    fn parse_scripts(&mut self, base: HtmlNode) -> HtmlNode {
        let mut sub = None;
        let mut sup = None;
        loop {
            match self.peek() {
                Some(Token::Subscript) if sub.is_none() => {
                    self.pos += 1;
                    sub = Some(self.required_atom());
                }
                Some(Token::Superscript) if sup.is_none() => {
                    self.pos += 1;
                    sup = Some(self.required_atom());
                }
                _ => break,
            }
        }
        match (sub, sup) {
            (None, None) => base,
            (Some(sub), None) => Element::new("msub").child(base).child(sub).into(),
            (None, Some(sup)) => Element::new("msup").child(base).child(sup).into(),
            (Some(sub), Some(sup)) => Element::new("msubsup")
                .child(base)
                .child(sub)
                .child(sup)
                .into(),
        }
    }

    fn command(&mut self, name: &str) -> HtmlNode {
        match name {
            "frac" | "dfrac" | "tfrac" => {
                let numerator = self.required_atom();
                let denominator = self.required_atom();
                Element::new("mfrac")
                    .child(numerator)
                    .child(denominator)
                    .into()
            }
            "sqrt" => Element::new("msqrt").child(self.required_atom()).into(),
            "text" | "textrm" | "mathrm" | "operatorname" | "ce" | "pu" => {
                let text = self.raw_group();
                leaf("mtext", &text)
            }
            "left" | "right" | "big" | "Big" | "bigl" | "bigr" => self.required_atom(),
            "," | ";" | ":" | "!" | " " | "quad" | "qquad" => leaf("mtext", " "),
            "\\" => Element::new("mspace").into(),
            _ => symbol(name).unwrap_or_else(|| {
                Element::new("mi")
                    .attr("mathvariant", "normal")
                    .text(name)
                    .into()
            }),
        }
    }

    fn raw_group(&mut self) -> String {
        let Some(&(token, start, end)) = self.tokens.get(self.pos) else {
            return String::new();
        };
        if token != Token::Open {
            self.pos += 1;
            return self.source[start..end].to_string();
        }

        let mut depth = 0usize;
        for index in self.pos..self.tokens.len() {
            match self.tokens[index].0 {
                Token::Open => depth += 1,
                Token::Close => {
                    depth -= 1;
                    if depth == 0 {
                        let close_start = self.tokens[index].1;
                        self.pos = index + 1;
                        return self.source[end..close_start].to_string();
                    }
                }
                _ => {}
            }
        }
        self.pos = self.tokens.len();
        self.source[end..].to_string()
    }
}

fn tokenize(source: &str) -> Vec<(Token<'_>, usize, usize)> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((start, ch)) = chars.next() {
        let token = match ch {
            '\\' => match chars.peek().copied() {
                Some((name_start, next)) if next.is_ascii_alphabetic() => {
                    let mut end = name_start;
                    while let Some(&(index, c)) = chars.peek() {
                        if !c.is_ascii_alphabetic() {
                            break;
                        }
                        end = index + c.len_utf8();
                        chars.next();
                    }
                    tokens.push((Token::Command(&source[name_start..end]), start, end));
                    continue;
                }
                Some((name_start, next)) => {
                    chars.next();
                    let end = name_start + next.len_utf8();
                    tokens.push((Token::Command(&source[name_start..end]), start, end));
                    continue;
                }
                None => Token::Symbol('\\'),
            },
            '{' => Token::Open,
            '}' => Token::Close,
            '^' => Token::Superscript,
            '_' => Token::Subscript,
            c if c.is_ascii_digit() => {
                let mut end = start + 1;
                while let Some(&(index, c)) = chars.peek() {
                    if !(c.is_ascii_digit() || c == '.') {
                        break;
                    }
                    end = index + 1;
                    chars.next();
                }
                tokens.push((Token::Number(&source[start..end]), start, end));
                continue;
            }
            c if c.is_whitespace() => continue,
            c => Token::Symbol(c),
        };
        tokens.push((token, start, start + ch.len_utf8()));
    }

    tokens
}

fn symbol(name: &str) -> Option<HtmlNode> {
    let (tag, text) = match name {
        "alpha" => ("mi", "α"),
        "beta" => ("mi", "β"),
        "gamma" => ("mi", "γ"),
        "delta" => ("mi", "δ"),
        "epsilon" => ("mi", "ϵ"),
        "varepsilon" => ("mi", "ε"),
        "zeta" => ("mi", "ζ"),
        "eta" => ("mi", "η"),
        "theta" => ("mi", "θ"),
        "iota" => ("mi", "ι"),
        "kappa" => ("mi", "κ"),
        "lambda" => ("mi", "λ"),
        "mu" => ("mi", "μ"),
        "nu" => ("mi", "ν"),
        "xi" => ("mi", "ξ"),
        "pi" => ("mi", "π"),
        "rho" => ("mi", "ρ"),
        "sigma" => ("mi", "σ"),
        "tau" => ("mi", "τ"),
        "phi" => ("mi", "ϕ"),
        "varphi" => ("mi", "φ"),
        "chi" => ("mi", "χ"),
        "psi" => ("mi", "ψ"),
        "omega" => ("mi", "ω"),
        "Gamma" => ("mi", "Γ"),
        "Delta" => ("mi", "Δ"),
        "Theta" => ("mi", "Θ"),
        "Lambda" => ("mi", "Λ"),
        "Xi" => ("mi", "Ξ"),
        "Pi" => ("mi", "Π"),
        "Sigma" => ("mi", "Σ"),
        "Phi" => ("mi", "Φ"),
        "Psi" => ("mi", "Ψ"),
        "Omega" => ("mi", "Ω"),
        "infty" => ("mi", "∞"),
        "partial" => ("mi", "∂"),
        "nabla" => ("mi", "∇"),
        "times" => ("mo", "×"),
        "cdot" => ("mo", "⋅"),
        "div" => ("mo", "÷"),
        "pm" => ("mo", "±"),
        "mp" => ("mo", "∓"),
        "le" | "leq" => ("mo", "≤"),
        "ge" | "geq" => ("mo", "≥"),
        "ne" | "neq" => ("mo", "≠"),
        "approx" => ("mo", "≈"),
        "equiv" => ("mo", "≡"),
        "sim" => ("mo", "∼"),
        "propto" => ("mo", "∝"),
        "to" | "rightarrow" => ("mo", "→"),
        "leftarrow" => ("mo", "←"),
        "Rightarrow" | "implies" => ("mo", "⇒"),
        "Leftrightarrow" | "iff" => ("mo", "⇔"),
        "in" => ("mo", "∈"),
        "notin" => ("mo", "∉"),
        "subset" => ("mo", "⊂"),
        "subseteq" => ("mo", "⊆"),
        "cup" => ("mo", "∪"),
        "cap" => ("mo", "∩"),
        "forall" => ("mo", "∀"),
        "exists" => ("mo", "∃"),
        "sum" => ("mo", "∑"),
        "prod" => ("mo", "∏"),
        "int" => ("mo", "∫"),
        "lim" => ("mo", "lim"),
        "log" => ("mi", "log"),
        "ln" => ("mi", "ln"),
        "sin" => ("mi", "sin"),
        "cos" => ("mi", "cos"),
        "tan" => ("mi", "tan"),
        "cdots" => ("mo", "⋯"),
        "ldots" | "dots" => ("mo", "…"),
        "{" => ("mo", "{"),
        "}" => ("mo", "}"),
        "|" => ("mo", "‖"),
        "%" => ("mo", "%"),
        "$" => ("mo", "$"),
        "&" => ("mo", "&"),
        "langle" => ("mo", "⟨"),
        "rangle" => ("mo", "⟩"),
        _ => return None,
    };
    Some(leaf(tag, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hast::to_html;

    fn render(tex: &str, display: bool) -> String {
        to_html(&[MathMlRenderer.render(tex, display)])
    }

    #[test]
    fn renders_scripts_and_keeps_annotation() {
        let html = render("x^2", false);
        assert!(html.starts_with("<span class=\"katex\"><math"));
        assert!(html.contains("<msup><mi>x</mi><mn>2</mn></msup>"));
        assert!(html.contains("<annotation encoding=\"application/x-tex\">x^2</annotation>"));
    }

    #[test]
    fn renders_fractions_greek_and_text() {
        let html = render(r"\frac{\alpha}{2} \text{ apples}", true);
        assert!(html.starts_with("<span class=\"katex-display\">"));
        assert!(html.contains("<mfrac><mrow><mi>α</mi></mrow><mrow><mn>2</mn></mrow></mfrac>"));
        assert!(html.contains("<mtext> apples</mtext>"));
        assert!(html.contains("display=\"block\""));
    }

    #[test]
    fn combines_sub_and_superscripts() {
        let html = render("a_i^{n}", false);
        assert!(html.contains("<msubsup><mi>a</mi><mi>i</mi><mrow><mi>n</mi></mrow></msubsup>"));
    }

    #[test]
    fn replaces_placeholders_in_tree() {
        let mut tree = vec![
            Element::new("p")
                .child(
                    Element::new("code")
                        .class("language-math")
                        .class("math-inline")
                        .text("y"),
                )
                .into(),
            Element::new("pre")
                .child(
                    Element::new("code")
                        .class("language-math")
                        .class("math-display")
                        .text("z"),
                )
                .into(),
        ];
        render_math(&mut tree, &MathMlRenderer);
        let html = to_html(&tree);
        assert!(!html.contains("<code"));
        assert!(!html.contains("<pre"));
        assert_eq!(html.matches("class=\"katex\"").count(), 2);
    }

    #[test]
    fn tolerates_unbalanced_input() {
        let html = render(r"\frac{a}{", false);
        assert!(html.contains("<mfrac>"));
        let html = render("}}x", false);
        assert!(html.contains("<mi>x</mi>"));
    }

    #[test]
    fn deep_groups_fall_back_to_text() {
        let tex = format!("{}x{}", "{".repeat(10_000), "}".repeat(10_000));
        let html = render(&tex, false);
        assert!(html.matches("<mrow>").count() <= MAX_GROUP_DEPTH + 1);
        assert!(html.contains("<mtext>{"));

        let roots = render(&format!("{}y", r"\sqrt".repeat(10_000)), true);
        assert!(roots.matches("<msqrt>").count() < MAX_GROUP_DEPTH);
        assert!(roots.contains("y"));
    }
}
