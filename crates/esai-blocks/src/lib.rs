//! Extraction of fenced code blocks from free-form assistant replies.
//!
//! [`extract`] is pure and total: malformed or unterminated fences simply
//! contribute no block.

mod info;

use log::debug;
use std::fmt;

pub use info::FenceInfo;

const MAX_FENCE_INDENT: usize = 3;
const MIN_FENCE_LEN: usize = 3;

pub const SCRIPT_LANGUAGES: &[&str] = &["python", "py", "python3"];
pub const SCRIPT_EXTENSIONS: &[&str] = &["py"];
pub const MARKUP_LANGUAGES: &[&str] = &["html", "htm"];
pub const MARKUP_EXTENSIONS: &[&str] = &["html", "htm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Script,
    Markup,
    Other,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Script => "script",
            Self::Markup => "markup",
            Self::Other => "other",
        };
        f.pad(name)
    }
}

/// One fenced region of a message. Blocks are immutable once extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    language: String,
    filename: Option<String>,
    source: String,
    order: usize,
}

impl CodeBlock {
    pub fn new(
        language: impl Into<String>,
        filename: Option<String>,
        source: impl Into<String>,
        order: usize,
    ) -> Self {
        Self {
            language: language.into().to_ascii_lowercase(),
            filename,
            source: source.into(),
            order,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn is_executable(&self) -> bool {
        SCRIPT_LANGUAGES.contains(&self.language.as_str())
            || self
                .filename
                .as_deref()
                .is_some_and(|name| has_extension(name, SCRIPT_EXTENSIONS))
    }

    pub fn is_markup(&self) -> bool {
        MARKUP_LANGUAGES.contains(&self.language.as_str())
            || self
                .filename
                .as_deref()
                .is_some_and(|name| has_extension(name, MARKUP_EXTENSIONS))
    }

    pub fn kind(&self) -> BlockKind {
        if self.is_executable() {
            BlockKind::Script
        } else if self.is_markup() {
            BlockKind::Markup
        } else {
            BlockKind::Other
        }
    }

    /// Name used in transcript headers and preview markers.
    pub fn label(&self) -> String {
        if let Some(name) = &self.filename {
            return name.clone();
        }
        match self.kind() {
            BlockKind::Script => format!("script block #{}", self.order),
            BlockKind::Markup => format!("markup block #{}", self.order),
            BlockKind::Other => format!("block #{}", self.order),
        }
    }

    pub fn line_count(&self) -> usize {
        self.source.lines().count()
    }
}

pub(crate) fn has_extension(name: &str, extensions: &[&str]) -> bool {
    name.rsplit_once('.').is_some_and(|(stem, ext)| {
        !stem.is_empty()
            && extensions
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

struct OpenFence<'a> {
    marker: char,
    len: usize,
    indent: usize,
    info: &'a str,
    body: Vec<&'a str>,
}

pub fn extract(message: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<OpenFence<'_>> = None;

    for line in message.lines() {
        let Some(fence) = open.as_mut() else {
            open = parse_opening(line);
            continue;
        };

        if is_closing(line, fence.marker, fence.len) {
            if let Some(done) = open.take() {
                blocks.push(finish_block(done, blocks.len()));
            }
            continue;
        }

        fence.body.push(strip_indent(line, fence.indent));
    }

    if let Some(unterminated) = open {
        debug!(
            "skipping unterminated fence (info '{}', {} body lines)",
            unterminated.info,
            unterminated.body.len()
        );
    }

    blocks
}

fn finish_block(fence: OpenFence<'_>, order: usize) -> CodeBlock {
    let info = FenceInfo::parse(fence.info);
    let joined = fence.body.join("\n");
    let source = joined.strip_suffix('\n').unwrap_or(&joined).to_string();
    CodeBlock {
        language: info.language,
        filename: info.filename,
        source,
        order,
    }
}

fn leading_spaces(line: &str) -> usize {
    line.chars().take_while(|ch| *ch == ' ').count()
}

fn marker_run(rest: &str) -> Option<(char, usize)> {
    let marker = rest.chars().next()?;
    if marker != '`' && marker != '~' {
        return None;
    }
    let len = rest.chars().take_while(|ch| *ch == marker).count();
    (len >= MIN_FENCE_LEN).then_some((marker, len))
}

fn parse_opening(line: &str) -> Option<OpenFence<'_>> {
    let indent = leading_spaces(line);
    if indent > MAX_FENCE_INDENT {
        return None;
    }
    let rest = &line[indent..];
    let (marker, len) = marker_run(rest)?;
    let info = rest[len * marker.len_utf8()..].trim();
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some(OpenFence {
        marker,
        len,
        indent,
        info,
        body: Vec::new(),
    })
}

fn is_closing(line: &str, marker: char, min_len: usize) -> bool {
    let indent = leading_spaces(line);
    if indent > MAX_FENCE_INDENT {
        return false;
    }
    let rest = &line[indent..];
    match marker_run(rest) {
        Some((found, len)) if found == marker && len >= min_len => {
            rest[len * marker.len_utf8()..].trim().is_empty()
        }
        _ => false,
    }
}

fn strip_indent(line: &str, indent: usize) -> &str {
    let strip = leading_spaces(line).min(indent);
    &line[strip..]
}

#[cfg(test)]
mod tests {
    use super::{BlockKind, CodeBlock, extract};

    #[test]
    fn no_fences_yields_nothing() {
        assert!(extract("").is_empty());
        assert!(extract("just prose, with `inline` code and no fences").is_empty());
    }

    #[test]
    fn explicit_filename_scenario() {
        let blocks = extract("```python:main.py\nprint(\"hello\")\n```");
        insta::assert_debug_snapshot!(blocks, @r#"
        [
            CodeBlock {
                language: "python",
                filename: Some(
                    "main.py",
                ),
                source: "print(\"hello\")",
                order: 0,
            },
        ]
        "#);
    }

    #[test]
    fn order_follows_document_position() {
        let message = "intro\n```python\na = 1\n```\nmiddle\n```html\n<p>x</p>\n```\n```\nplain\n```\n";
        let blocks = extract(message);
        let orders: Vec<usize> = blocks.iter().map(CodeBlock::order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(blocks[0].source(), "a = 1");
        assert_eq!(blocks[1].language(), "html");
        assert_eq!(blocks[2].language(), "");
    }

    #[test]
    fn unterminated_fence_is_dropped() {
        let blocks = extract("```python\nprint(1)\n```\n```python\nprint(2)\n");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source(), "print(1)");
    }

    #[test]
    fn one_trailing_newline_is_trimmed() {
        let blocks = extract("```python\nprint(1)\n\n```");
        assert_eq!(blocks[0].source(), "print(1)");
    }

    #[test]
    fn tilde_fence_may_contain_backticks() {
        let message = "~~~markdown\n```python\nx\n```\n~~~";
        let blocks = extract(message);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source(), "```python\nx\n```");
        assert_eq!(blocks[0].kind(), BlockKind::Other);
    }

    #[test]
    fn shorter_fence_does_not_close_longer_one() {
        let message = "````python\nprint('```')\n```\n````";
        let blocks = extract(message);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].source(), "print('```')\n```");
    }

    #[test]
    fn opening_indent_is_removed_from_body() {
        let message = "  ```python\n  if x:\n      y()\n  ```";
        let blocks = extract(message);
        assert_eq!(blocks[0].source(), "if x:\n    y()");
    }

    #[test]
    fn classification_by_language_and_extension() {
        let message = "```py\n1\n```\n```:app.py\n2\n```\n```text:index.html\n3\n```\n```rust:main.rs\n4\n```";
        let kinds: Vec<BlockKind> = extract(message).iter().map(CodeBlock::kind).collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::Script,
                BlockKind::Script,
                BlockKind::Markup,
                BlockKind::Other
            ]
        );
    }

    #[test]
    fn labels_fall_back_to_generic_names() {
        let blocks = extract("```python\n1\n```\n```html:page.html\n<p/>\n```\n```html\n<p/>\n```");
        assert_eq!(blocks[0].label(), "script block #0");
        assert_eq!(blocks[1].label(), "page.html");
        assert_eq!(blocks[2].label(), "markup block #2");
    }
}
