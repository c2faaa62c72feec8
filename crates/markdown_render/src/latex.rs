use std::sync::LazyLock;

use regex::Regex;

static MHCHEM_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\s)\$\\\\(ce|pu)\{").expect("valid mhchem pattern"));

/// Rewrites `\[..\]` and `\(..\)` into dollar delimiters outside code.
pub fn normalize_latex(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prose = String::new();
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];

        if rest.starts_with("```") {
            let end = rest[3..].find("```").map_or(rest.len(), |i| i + 6);
            flush_prose(&mut out, &mut prose);
            out.push_str(&rest[..end]);
            pos += end;
            continue;
        }

        if rest.starts_with('`') {
            if let Some(end) = inline_code_end(rest) {
                flush_prose(&mut out, &mut prose);
                out.push_str(&rest[..end]);
                pos += end;
                continue;
            }
        }

        if rest.starts_with("$$") {
            if let Some(close) = rest[2..].find("$$") {
                let block = &rest[..close + 4];
                if block[2..close + 2].contains("\\\\") {
                    prose.push_str(block);
                    pos += block.len();
                    continue;
                }
            }
            prose.push_str("$$");
            pos += 2;
            continue;
        }

        let escaped = pos > 0 && bytes[pos - 1] == b'\\';
        if !escaped && rest.starts_with("\\[") {
            if let Some(close) = display_close(&rest[2..]) {
                push_math(&mut prose, &rest[..close + 4], "$$");
                pos += close + 4;
                continue;
            }
        }
        if !escaped && rest.starts_with("\\(") {
            if let Some(close) = inline_close(&rest[2..]) {
                push_math(&mut prose, &rest[..close + 4], "$");
                pos += close + 4;
                continue;
            }
        }

        match rest.chars().next() {
            Some(ch) => {
                prose.push(ch);
                pos += ch.len_utf8();
            }
            None => break,
        }
    }

    flush_prose(&mut out, &mut prose);
    out
}

fn flush_prose(out: &mut String, prose: &mut String) {
    if prose.is_empty() {
        return;
    }
    out.push_str(&MHCHEM_PATTERN.replace_all(prose, "${1}$$\\${2}{"));
    prose.clear();
}

fn inline_code_end(rest: &str) -> Option<usize> {
    let close = rest[1..].find(['`', '\n'])?;
    (rest.as_bytes()[1 + close] == b'`').then_some(close + 2)
}

fn display_close(after_open: &str) -> Option<usize> {
    let bytes = after_open.as_bytes();
    after_open
        .match_indices("\\]")
        .map(|(index, _)| index)
        .find(|&index| index >= 1 && bytes[index - 1] != b'\\')
}

fn inline_close(after_open: &str) -> Option<usize> {
    let line_end = after_open.find('\n').unwrap_or(after_open.len());
    after_open[..line_end].find("\\)")
}

/// `delimited` is the whole `\(..\)` or `\[..\]` match. Empty ones stay as written.
fn push_math(prose: &mut String, delimited: &str, fence: &str) {
    let trimmed = delimited[2..delimited.len() - 2].trim();
    if trimmed.is_empty() {
        prose.push_str(delimited);
        return;
    }
    prose.push_str(fence);
    prose.push_str(trimmed);
    prose.push_str(fence);
}
