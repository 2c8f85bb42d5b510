//! Human-editable markup formatting
//!
//! Migrated page content is stored as markup that people edit by hand later,
//! so it is laid out with one block-level tag per line, at most one blank line
//! in a row, and two-space indentation by tag depth. Inline and void tags never
//! change the depth. `reformat` is idempotent: formatting formatted markup
//! returns it unchanged.

/// Tags that get their own line
pub const BLOCK_TAGS: &[&str] = &[
    "div", "h1", "h2", "h3", "h4", "h5", "h6", "p", "ul", "ol", "li", "table", "thead", "tbody",
    "tr", "td", "th", "section", "article", "header", "footer", "main", "nav", "aside", "form",
    "button",
];

/// Tags that stay on the line they appear on and never indent
pub const INLINE_TAGS: &[&str] = &[
    "span", "strong", "em", "b", "i", "u", "a", "code", "br", "wbr", "img", "svg", "path",
    "circle", "rect", "line", "polyline",
];

const SELF_CLOSING_TAGS: &[&str] = &["hr", "input", "meta", "link", "source", "br", "img", "wbr"];

const INDENT: &str = "  ";

/// Reformat markup for hand editing
pub fn reformat(markup: &str) -> String {
    let broken = break_block_tags(markup);
    let lines = collapse_blank_lines(&broken);
    indent_lines(&lines)
}

/// Name of the tag whose `<` sits at byte `at`, with its closing flag
fn tag_at(markup: &str, at: usize) -> Option<(bool, &str)> {
    let rest = &markup[at + 1..];
    let (closing, rest) = match rest.strip_prefix('/') {
        Some(r) => (true, r),
        None => (false, rest),
    };
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some((closing, &rest[..end]))
}

fn is_block(name: &str) -> bool {
    BLOCK_TAGS.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Put block-level tags on their own lines without touching anything already there
fn break_block_tags(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len() + markup.len() / 8);
    let mut i = 0;
    while i < markup.len() {
        let Some(offset) = markup[i..].find('<') else {
            out.push_str(&markup[i..]);
            break;
        };
        let at = i + offset;
        out.push_str(&markup[i..at]);

        let Some((closing, _)) = tag_at(markup, at).filter(|(_, n)| is_block(n)) else {
            out.push('<');
            i = at + 1;
            continue;
        };
        let Some(close_offset) = markup[at..].find('>') else {
            out.push_str(&markup[at..]);
            break;
        };
        let end = at + close_offset + 1;

        if !at_line_start(&out) {
            out.push('\n');
        }
        out.push_str(&markup[at..end]);

        if closing && !next_is_line_end(&markup[end..]) {
            out.push('\n');
        }
        i = end;
    }
    out
}

fn at_line_start(out: &str) -> bool {
    let tail = out.trim_end_matches([' ', '\t']);
    tail.is_empty() || tail.ends_with('\n')
}

fn next_is_line_end(rest: &str) -> bool {
    let trimmed = rest.trim_start_matches([' ', '\t']);
    trimmed.is_empty() || trimmed.starts_with('\n') || trimmed.starts_with("\r\n")
}

/// Trim every line and keep at most one blank line in a row
fn collapse_blank_lines(markup: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut previous_blank = true;
    for raw in markup.lines() {
        let line = raw.trim();
        if line.is_empty() {
            if !previous_blank {
                lines.push(String::new());
            }
            previous_blank = true;
        } else {
            lines.push(line.to_string());
            previous_blank = false;
        }
    }
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines
}

fn opens_nesting(line: &str) -> bool {
    if !line.starts_with('<') || line.starts_with("</") || line.starts_with("<!") || line.ends_with("/>") {
        return false;
    }
    let Some((_, name)) = tag_at(line, 0) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    if INLINE_TAGS.contains(&name.as_str()) || SELF_CLOSING_TAGS.contains(&name.as_str()) {
        return false;
    }
    !line.contains(&format!("</{}", name))
}

fn indent_lines(lines: &[String]) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    for (n, line) in lines.iter().enumerate() {
        if n > 0 {
            out.push('\n');
        }
        if line.is_empty() {
            continue;
        }
        if line.starts_with("</") {
            depth = depth.saturating_sub(1);
        }
        for _ in 0..depth {
            out.push_str(INDENT);
        }
        out.push_str(line);
        if opens_nesting(line) {
            depth += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_tags_get_their_own_lines() {
        let out = reformat("<div><p>Hello <strong>world</strong></p><p>Second</p></div>");
        assert_eq!(
            out,
            "<div>\n  <p>Hello <strong>world</strong>\n  </p>\n  <p>Second\n  </p>\n</div>"
        );
    }

    #[test]
    fn blank_lines_collapse_to_one() {
        let out = reformat("<p>a</p>\n\n\n\n<p>b</p>\n\n");
        assert_eq!(out, "<p>a\n</p>\n\n<p>b\n</p>");
    }

    #[test]
    fn inline_and_void_tags_do_not_indent() {
        let out = reformat("<div>\n<img src=\"a.png\" style=\"width: 10px\">\n<span>x</span>\n<hr>\n<p>y</p>\n</div>");
        assert_eq!(
            out,
            "<div>\n  <img src=\"a.png\" style=\"width: 10px\">\n  <span>x</span>\n  <hr>\n  <p>y\n  </p>\n</div>"
        );
    }

    #[test]
    fn reformat_is_idempotent() {
        let samples = [
            "<div><h2>T</h2><ul><li>a</li><li>b <em>c</em></li></ul><table><tr><td>1</td></tr></table></div>",
            "text before <div>inside</div> text after",
            "<section>\n\n\n<p>x</p>   <p>y</p>\n</section>",
            "<div class=\"a\"><svg width=\"300\"><path d=\"M0 0\"/></svg></div>",
            "",
        ];
        for sample in samples {
            let once = reformat(sample);
            assert_eq!(reformat(&once), once, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn non_block_angle_brackets_pass_through() {
        assert_eq!(reformat("a < b and <em>c</em>"), "a < b and <em>c</em>");
    }
}
