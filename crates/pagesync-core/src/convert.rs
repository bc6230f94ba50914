//! Lossless markdown ↔ rich storage-format conversion, macro-aware.
//!
//! The remote service stores pages in an XHTML-based storage format where
//! structured macros look like
//! `<ac:structured-macro ac:name="info">…</ac:structured-macro>`. Locally
//! the same macros are written as fenced blocks:
//!
//! ```markdown
//! :::info Optional title
//! Body rendered as markdown.
//! :::
//! ```
//!
//! Recognized macro blocks are lifted out with placeholder tokens before
//! the generic markdown renderer runs, because the renderer would escape
//! or mangle the enclosed markup. Unrecognized macro names pass through
//! as plain text: the converter is fail-open and never drops content.

use regex::Regex;
use std::sync::OnceLock;

/// Macro names the converter understands. Anything else is left alone.
const PANEL_MACROS: &[&str] = &["info", "note", "warning", "tip"];

fn is_recognized_macro(name: &str) -> bool {
    PANEL_MACROS.contains(&name) || name == "expand" || name == "toc"
}

// ---------------------------------------------------------------------------
// markdown → storage
// ---------------------------------------------------------------------------

struct ExtractedBlock {
    token: String,
    storage: String,
}

/// Convert markdown to the remote rich storage format.
pub fn to_storage(markdown_text: &str) -> String {
    let mut blocks: Vec<ExtractedBlock> = Vec::new();

    // Code fences first so `:::` inside a code block is never treated as
    // a macro delimiter.
    let stripped = extract_code_fences(markdown_text, &mut blocks);
    let stripped = extract_macro_blocks(&stripped, &mut blocks);

    let mut html = render_markdown(&stripped);

    // Substitute placeholders back. The renderer usually wraps a bare
    // token in a paragraph element; strip that wrapper when present.
    for block in &blocks {
        let wrapped = format!("<p>{}</p>", block.token);
        if html.contains(&wrapped) {
            html = html.replace(&wrapped, &block.storage);
        } else {
            html = html.replace(&block.token, &block.storage);
        }
    }
    html
}

/// Render markdown to HTML with GFM extensions (tables, task lists).
fn render_markdown(md: &str) -> String {
    markdown::to_html_with_options(md, &markdown::Options::gfm())
        .unwrap_or_else(|_| markdown::to_html(md))
}

fn next_token(blocks: &[ExtractedBlock]) -> String {
    format!("pagesyncblocktoken{}end", blocks.len())
}

/// Pull fenced code blocks out into code-macro storage form.
fn extract_code_fences(md: &str, blocks: &mut Vec<ExtractedBlock>) -> String {
    let mut out = String::with_capacity(md.len());
    let mut lines = md.lines().peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            let lang = rest.trim();
            let mut body = String::new();
            let mut closed = false;
            for inner in lines.by_ref() {
                if inner.trim_start().starts_with("```") {
                    closed = true;
                    break;
                }
                body.push_str(inner);
                body.push('\n');
            }
            if !closed {
                // Unterminated fence: keep the raw text, fail-open
                out.push_str(line);
                out.push('\n');
                out.push_str(&body);
                continue;
            }
            let token = next_token(blocks);
            blocks.push(ExtractedBlock {
                token: token.clone(),
                storage: code_macro_storage(lang, &body),
            });
            out.push_str(&token);
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn code_macro_storage(lang: &str, body: &str) -> String {
    let mut s = String::from(r#"<ac:structured-macro ac:name="code">"#);
    if !lang.is_empty() {
        s.push_str(&format!(
            r#"<ac:parameter ac:name="language">{}</ac:parameter>"#,
            escape_html(lang)
        ));
    }
    // CDATA keeps the code verbatim; an embedded `]]>` must be split
    let safe = body.trim_end_matches('\n').replace("]]>", "]]]]><![CDATA[>");
    s.push_str(&format!(
        "<ac:plain-text-body><![CDATA[{}]]></ac:plain-text-body></ac:structured-macro>",
        safe
    ));
    s
}

/// Pull recognized `:::name` fenced macro blocks out, recursively
/// converting their bodies. Nesting-aware: only recognized openers
/// increase depth, a bare `:::` closes the innermost open block.
fn extract_macro_blocks(md: &str, blocks: &mut Vec<ExtractedBlock>) -> String {
    let mut out = String::with_capacity(md.len());
    let lines: Vec<&str> = md.lines().collect();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        if let Some((name, title)) = parse_macro_opener(line) {
            if is_recognized_macro(&name) {
                // Find the matching closer, tracking nested recognized macros
                let mut depth = 1usize;
                let mut j = i + 1;
                while j < lines.len() {
                    if let Some((inner, _)) = parse_macro_opener(lines[j]) {
                        if is_recognized_macro(&inner) {
                            depth += 1;
                        }
                    } else if lines[j].trim() == ":::" {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    j += 1;
                }
                if depth == 0 {
                    let body = lines[i + 1..j].join("\n");
                    let token = next_token(blocks);
                    blocks.push(ExtractedBlock {
                        token: token.clone(),
                        storage: macro_storage(&name, title.as_deref(), &body),
                    });
                    out.push_str(&token);
                    out.push('\n');
                    i = j + 1;
                    continue;
                }
                // No closer found: leave the text untouched
            }
        }
        out.push_str(line);
        out.push('\n');
        i += 1;
    }
    out
}

/// `:::name Optional title` → (name, title). A bare `:::` is a closer,
/// not an opener.
fn parse_macro_opener(line: &str) -> Option<(String, Option<String>)> {
    let rest = line.trim().strip_prefix(":::")?;
    if rest.is_empty() || rest.starts_with(':') {
        return None;
    }
    let mut parts = rest.splitn(2, ' ');
    let name = parts.next()?.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    let title = parts
        .next()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);
    Some((name.to_string(), title))
}

/// Assemble the native structured form for a recognized macro.
fn macro_storage(name: &str, title: Option<&str>, body: &str) -> String {
    if name == "toc" {
        return r#"<ac:structured-macro ac:name="toc"/>"#.to_string();
    }
    let mut s = format!(r#"<ac:structured-macro ac:name="{}">"#, name);
    if let Some(title) = title {
        s.push_str(&format!(
            r#"<ac:parameter ac:name="title">{}</ac:parameter>"#,
            escape_html(title)
        ));
    }
    // Recursively render the body so nested markdown (and macros) survive
    s.push_str("<ac:rich-text-body>");
    s.push_str(&to_storage(body));
    s.push_str("</ac:rich-text-body></ac:structured-macro>");
    s
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// storage → markdown
// ---------------------------------------------------------------------------

fn code_macro_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?s)<ac:structured-macro[^>]*ac:name="code"[^>]*>(?:<ac:parameter ac:name="language">([^<]*)</ac:parameter>)?<ac:plain-text-body><!\[CDATA\[(.*?)\]\]></ac:plain-text-body></ac:structured-macro>"#,
        )
        .expect("static regex")
    })
}

fn rich_macro_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"<ac:structured-macro[^>]*ac:name="(info|note|warning|tip|expand)"[^>]*>\s*(?:<ac:parameter ac:name="title">([^<]*)</ac:parameter>)?\s*<ac:rich-text-body>"#,
        )
        .expect("static regex")
    })
}

fn toc_macro_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<ac:structured-macro[^>]*ac:name="toc"[^>]*(?:/>|></ac:structured-macro>)"#)
            .expect("static regex")
    })
}

/// Convert the remote rich storage format back to markdown.
///
/// A preprocessing pass rewrites each recognized macro element into a
/// neutral intermediate container (`<macroblock>`) so the generic
/// HTML-to-text walker can treat it like any other tag; dedicated rules
/// then map the container back to fenced macro syntax and code macros
/// back to language-tagged fences.
pub fn to_markdown(storage: &str) -> String {
    // Code macros become placeholder tokens so their verbatim bodies
    // survive the walker untouched.
    let mut fences: Vec<(String, String)> = Vec::new();
    let pre = code_macro_re().replace_all(storage, |caps: &regex::Captures<'_>| {
        let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let token = format!("pagesynccodetoken{}end", fences.len());
        let fence = format!("```{}\n{}\n```", lang, body.replace("]]]]><![CDATA[>", "]]>"));
        fences.push((token.clone(), fence));
        format!("<p>{}</p>", token)
    });

    // Recognized macros → neutral containers; opening and closing tags are
    // rewritten independently so nesting survives.
    let pre = rich_macro_open_re().replace_all(&pre, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match caps.get(2) {
            Some(title) => format!(r#"<macroblock name="{}" title="{}">"#, name, title.as_str()),
            None => format!(r#"<macroblock name="{}">"#, name),
        }
    });
    let pre = pre.replace("</ac:rich-text-body></ac:structured-macro>", "</macroblock>");
    let pre = toc_macro_re().replace_all(&pre, r#"<macroblock name="toc"></macroblock>"#);

    let mut md = html_to_markdown(&pre);

    for (token, fence) in &fences {
        md = md.replace(token, fence);
    }
    md
}

/// Minimal HTML-to-markdown walker for the storage format's vocabulary:
/// headings, paragraphs, emphasis, inline code, lists (including task
/// checkboxes), links, blockquotes, rules, and the neutral macro
/// containers produced by preprocessing. Unknown tags are dropped but
/// their text content is kept.
fn html_to_markdown(html: &str) -> String {
    let mut out = String::new();
    let mut chars = html.char_indices().peekable();
    let bytes = html;

    // (tag, ordered-index) stack for list context
    let mut list_stack: Vec<(bool, usize)> = Vec::new();
    let mut quote_depth = 0usize;

    while let Some(&(i, c)) = chars.peek() {
        if c != '<' {
            // Text run until next tag
            let start = i;
            let mut end = bytes.len();
            while let Some(&(j, cj)) = chars.peek() {
                if cj == '<' {
                    end = j;
                    break;
                }
                chars.next();
            }
            let text = decode_entities(&bytes[start..end]);
            let text = text.replace('\n', " ");
            if !text.trim().is_empty() || out.ends_with(|ch: char| ch != '\n') {
                out.push_str(&text);
            }
            continue;
        }

        // Parse one tag
        let start = i;
        let mut end = None;
        while let Some((j, cj)) = chars.next() {
            if cj == '>' {
                end = Some(j);
                break;
            }
        }
        let Some(end) = end else {
            // Truncated tag: keep the raw text rather than dropping it
            out.push_str(&bytes[start..]);
            break;
        };
        let tag_src = &bytes[start + 1..end];
        let closing = tag_src.starts_with('/');
        let tag_body = tag_src.trim_start_matches('/').trim_end_matches('/');
        let name = tag_body
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        match (name.as_str(), closing) {
            ("h1", false) => push_block(&mut out, "# "),
            ("h2", false) => push_block(&mut out, "## "),
            ("h3", false) => push_block(&mut out, "### "),
            ("h4", false) => push_block(&mut out, "#### "),
            ("h5", false) => push_block(&mut out, "##### "),
            ("h6", false) => push_block(&mut out, "###### "),
            ("h1" | "h2" | "h3" | "h4" | "h5" | "h6", true) => out.push('\n'),
            ("p", false) => {
                if quote_depth > 0 {
                    push_block(&mut out, &"> ".repeat(quote_depth));
                } else if list_stack.is_empty() {
                    push_block(&mut out, "");
                }
            }
            ("p", true) => {
                if list_stack.is_empty() {
                    out.push('\n');
                }
            }
            ("br", false) => out.push('\n'),
            ("hr", false) => push_block(&mut out, "---\n"),
            ("strong" | "b", _) => out.push_str("**"),
            ("em" | "i", _) => out.push('*'),
            ("code", _) => out.push('`'),
            ("ul", false) => list_stack.push((false, 0)),
            ("ol", false) => list_stack.push((true, 0)),
            ("ul" | "ol", true) => {
                list_stack.pop();
                if list_stack.is_empty() {
                    out.push('\n');
                }
            }
            ("li", false) => {
                let depth = list_stack.len().saturating_sub(1);
                let indent = "  ".repeat(depth);
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                if let Some((ordered, index)) = list_stack.last_mut() {
                    if *ordered {
                        *index += 1;
                        out.push_str(&format!("{}{}. ", indent, index));
                    } else {
                        out.push_str(&format!("{}- ", indent));
                    }
                } else {
                    out.push_str("- ");
                }
            }
            ("li", true) => {}
            ("input", false) => {
                // Task list checkbox from GFM rendering
                if tag_body.contains("checkbox") {
                    if tag_body.contains("checked") {
                        out.push_str("[x] ");
                    } else {
                        out.push_str("[ ] ");
                    }
                }
            }
            ("a", false) => {
                out.push('[');
                if let Some(href) = attr_value(tag_body, "href") {
                    // Stashed inline between sentinels; rearranged at </a>
                    out.push_str(LINK_SENTINEL);
                    out.push_str(&href);
                    out.push_str(LINK_SENTINEL);
                }
            }
            ("a", true) => {
                // Rearrange `[SENTINEL href SENTINEL text` → `[text](href)`
                if let Some(first) = out.rfind(LINK_SENTINEL) {
                    // first is the LAST sentinel; find its opener
                    let head = &out[..first];
                    if let Some(open) = head.rfind(LINK_SENTINEL) {
                        let href = out[open + LINK_SENTINEL.len()..first].to_string();
                        let text = out[first + LINK_SENTINEL.len()..].to_string();
                        out.truncate(open);
                        out.push_str(&text);
                        out.push_str("](");
                        out.push_str(&href);
                        out.push(')');
                    }
                } else {
                    out.push(']');
                }
            }
            ("blockquote", false) => quote_depth += 1,
            ("blockquote", true) => {
                quote_depth = quote_depth.saturating_sub(1);
                out.push('\n');
            }
            ("macroblock", false) => {
                let name = attr_value(tag_body, "name").unwrap_or_default();
                let title = attr_value(tag_body, "title");
                push_block(&mut out, "");
                out.push_str(":::");
                out.push_str(&name);
                if let Some(title) = title {
                    out.push(' ');
                    out.push_str(&title);
                }
                out.push('\n');
            }
            ("macroblock", true) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str(":::\n");
            }
            // Unknown or structural tags: drop the tag, keep the content
            _ => {}
        }
    }

    crate::normalize::normalize(&out)
}

const LINK_SENTINEL: &str = "\u{1}";

/// Start a block element on a fresh line with a blank line before it.
fn push_block(out: &mut String, prefix: &str) {
    while out.ends_with(' ') {
        out.pop();
    }
    if !out.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.ends_with("\n\n") {
            out.push('\n');
        }
    }
    out.push_str(prefix);
}

fn attr_value(tag_body: &str, attr: &str) -> Option<String> {
    let needle = format!("{}=\"", attr);
    let start = tag_body.find(&needle)? + needle.len();
    let rest = &tag_body[start..];
    let end = rest.find('"')?;
    Some(decode_entities(&rest[..end]))
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[test]
    fn test_plain_markdown_to_storage() {
        let html = to_storage("# Title\n\nSome **bold** text.\n");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<strong>bold</strong>"));
    }

    #[test]
    fn test_panel_macro_to_storage() {
        let md = ":::info Heads up\nBe **careful**.\n:::\n";
        let html = to_storage(md);
        assert!(html.contains(r#"<ac:structured-macro ac:name="info">"#));
        assert!(html.contains(r#"<ac:parameter ac:name="title">Heads up</ac:parameter>"#));
        assert!(html.contains("<ac:rich-text-body>"));
        assert!(html.contains("<strong>careful</strong>"));
    }

    #[test]
    fn test_unrecognized_macro_passes_through() {
        let md = ":::customthing\nbody stays\n:::\n";
        let html = to_storage(md);
        assert!(!html.contains("ac:structured-macro"));
        assert!(html.contains("customthing"));
        assert!(html.contains("body stays"));
    }

    #[test]
    fn test_code_fence_to_storage() {
        let md = "```rust\nfn main() {}\n```\n";
        let html = to_storage(md);
        assert!(html.contains(r#"ac:name="code""#));
        assert!(html.contains(r#"<ac:parameter ac:name="language">rust</ac:parameter>"#));
        assert!(html.contains("<![CDATA[fn main() {}]]>"));
    }

    #[test]
    fn test_macro_delimiters_inside_code_fence_ignored() {
        let md = "```\n:::info\nnot a macro\n:::\n```\n";
        let html = to_storage(md);
        assert!(!html.contains(r#"ac:name="info""#));
        assert!(html.contains(":::info"));
    }

    #[test]
    fn test_toc_macro() {
        let html = to_storage(":::toc\n:::\n");
        assert!(html.contains(r#"<ac:structured-macro ac:name="toc"/>"#));
        let md = to_markdown(&html);
        assert!(md.contains(":::toc"));
    }

    #[test]
    fn test_storage_headings_to_markdown() {
        let md = to_markdown("<h2>Section</h2><p>Body text.</p>");
        assert!(md.contains("## Section"));
        assert!(md.contains("Body text."));
    }

    #[test]
    fn test_storage_panel_to_markdown() {
        let storage = concat!(
            r#"<ac:structured-macro ac:name="warning">"#,
            r#"<ac:parameter ac:name="title">Danger</ac:parameter>"#,
            "<ac:rich-text-body><p>Watch out.</p></ac:rich-text-body></ac:structured-macro>"
        );
        let md = to_markdown(storage);
        assert!(md.contains(":::warning Danger"));
        assert!(md.contains("Watch out."));
        assert!(md.contains("\n:::\n"));
    }

    #[test]
    fn test_storage_code_macro_to_markdown() {
        let storage = concat!(
            r#"<ac:structured-macro ac:name="code">"#,
            r#"<ac:parameter ac:name="language">python</ac:parameter>"#,
            "<ac:plain-text-body><![CDATA[print(\"hi <b>\")]]></ac:plain-text-body>",
            "</ac:structured-macro>"
        );
        let md = to_markdown(storage);
        assert!(md.contains("```python"));
        assert!(md.contains("print(\"hi <b>\")"));
    }

    #[test]
    fn test_task_list_round_trip() {
        let md = "- [x] done\n- [ ] open\n";
        let storage = to_storage(md);
        let back = to_markdown(&storage);
        assert!(back.contains("[x] done"));
        assert!(back.contains("[ ] open"));
    }

    #[test]
    fn test_link_round_trip() {
        let back = to_markdown(r#"<p>See <a href="https://example.com">the docs</a>.</p>"#);
        assert!(back.contains("[the docs](https://example.com)"));
    }

    #[test]
    fn test_semantic_round_trip() {
        let md = concat!(
            "# Guide\n",
            "\n",
            "## Setup\n",
            "\n",
            "- [x] install\n",
            "- [ ] configure\n",
            "\n",
            "```sh\necho hello\n```\n",
            "\n",
            ":::note Remember\nRead the **manual** first.\n:::\n",
        );
        let back = to_markdown(&to_storage(&normalize(md)));

        assert!(back.contains("# Guide"));
        assert!(back.contains("## Setup"));
        assert!(back.contains("[x] install"));
        assert!(back.contains("[ ] configure"));
        assert!(back.contains("```sh"));
        assert!(back.contains("echo hello"));
        assert!(back.contains(":::note Remember"));
        assert!(back.contains("manual"));
        assert!(back.contains("\n:::\n"));
    }

    #[test]
    fn test_nested_macro_round_trip() {
        let md = ":::expand Details\n:::info\nInner panel.\n:::\n:::\n";
        let storage = to_storage(md);
        assert!(storage.contains(r#"ac:name="expand""#));
        assert!(storage.contains(r#"ac:name="info""#));

        let back = to_markdown(&storage);
        assert!(back.contains(":::expand Details"));
        assert!(back.contains(":::info"));
        assert!(back.contains("Inner panel."));
    }
}
