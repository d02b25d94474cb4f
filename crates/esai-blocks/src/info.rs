use crate::{MARKUP_EXTENSIONS, SCRIPT_EXTENSIONS, has_extension};

const FILENAME_ATTRIBUTES: &[&str] = &["file=", "filename=", "title="];

/// Parsed fence info string: `language[:filename] [attributes...]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FenceInfo {
    pub language: String,
    pub filename: Option<String>,
}

impl FenceInfo {
    pub fn parse(info: &str) -> Self {
        let mut tokens = info.split_whitespace();
        let Some(head) = tokens.next() else {
            return Self::default();
        };

        // `python:main.py`; the filename side is never rewritten.
        if let Some((language, filename)) = head.split_once(':') {
            return Self {
                language: language.to_ascii_lowercase(),
                filename: non_empty(filename),
            };
        }

        let filename = tokens.find_map(attribute_filename);
        if filename.is_none() && is_inferable_filename(head) {
            return Self {
                language: String::new(),
                filename: Some(head.to_string()),
            };
        }

        Self {
            language: head.to_ascii_lowercase(),
            filename,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn strip_quotes(value: &str) -> &str {
    value.trim_matches(|ch| ch == '"' || ch == '\'')
}

fn attribute_filename(token: &str) -> Option<String> {
    for prefix in FILENAME_ATTRIBUTES {
        if let Some(value) = token.strip_prefix(prefix) {
            return non_empty(strip_quotes(value));
        }
    }
    // Bare tokens only count with a known extension; `python 3.11` has none.
    let bare = strip_quotes(token);
    if token.starts_with('{') || !is_inferable_filename(bare) {
        return None;
    }
    non_empty(bare)
}

fn is_inferable_filename(head: &str) -> bool {
    has_extension(head, SCRIPT_EXTENSIONS) || has_extension(head, MARKUP_EXTENSIONS)
}

#[cfg(test)]
mod tests {
    use super::FenceInfo;

    fn parse(info: &str) -> (String, Option<String>) {
        let parsed = FenceInfo::parse(info);
        (parsed.language, parsed.filename)
    }

    #[test]
    fn empty_info() {
        assert_eq!(parse(""), (String::new(), None));
        assert_eq!(parse("   "), (String::new(), None));
    }

    #[test]
    fn language_only_is_lowercased() {
        assert_eq!(parse("Python"), ("python".to_string(), None));
    }

    #[test]
    fn colon_splits_language_and_filename() {
        assert_eq!(
            parse("python:src/Main.py"),
            ("python".to_string(), Some("src/Main.py".to_string()))
        );
        assert_eq!(parse("python:"), ("python".to_string(), None));
        assert_eq!(parse(":index.html"), (String::new(), Some("index.html".to_string())));
    }

    #[test]
    fn colon_filename_is_kept_verbatim_even_with_unknown_extension() {
        assert_eq!(
            parse("html:layout.jinja"),
            ("html".to_string(), Some("layout.jinja".to_string()))
        );
    }

    #[test]
    fn separate_filename_token_and_attributes() {
        assert_eq!(
            parse("python main.py"),
            ("python".to_string(), Some("main.py".to_string()))
        );
        assert_eq!(
            parse("html title=\"page.html\""),
            ("html".to_string(), Some("page.html".to_string()))
        );
        assert_eq!(
            parse("python {linenos=true} file=app.py"),
            ("python".to_string(), Some("app.py".to_string()))
        );
    }

    #[test]
    fn version_like_tokens_are_not_filenames() {
        assert_eq!(parse("python 3.11"), ("python".to_string(), None));
        assert_eq!(parse("html v1.2 linenos"), ("html".to_string(), None));
        assert_eq!(
            parse("python 3.11 app.py"),
            ("python".to_string(), Some("app.py".to_string()))
        );
        assert_eq!(
            parse("text file=notes.txt"),
            ("text".to_string(), Some("notes.txt".to_string()))
        );
    }

    #[test]
    fn bare_filename_head_infers_nothing_but_filename() {
        assert_eq!(parse("main.py"), (String::new(), Some("main.py".to_string())));
        assert_eq!(parse("notes.txt"), ("notes.txt".to_string(), None));
    }
}
