//! Machine-managed metadata block handling.
//!
//! Every synced file carries a YAML frontmatter block with at least the
//! remote `id` and the page `title`. A folder is a directory holding a
//! metadata-only marker file (`_folder.md`) with no body.

use serde::{Deserialize, Serialize};

/// Name of the metadata-only marker file inside a container directory.
pub const FOLDER_MARKER: &str = "_folder.md";

/// The machine-managed metadata block at the top of a synced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Remote identifier. Absent until the first successful push.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    /// Remote version at last sync, used for compare-and-swap writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// A file split into its metadata block and markdown body.
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub meta: Option<DocumentMeta>,
    pub body: String,
}

/// Parse a synced file into metadata block and body.
///
/// The block must be delimited by `---` at the start of the file.
/// Missing or unparseable blocks yield `meta: None` and the full text as
/// body, so a hand-created file is picked up as a new local document.
pub fn parse(content: &str) -> ParsedFile {
    if !content.starts_with("---") {
        return ParsedFile {
            meta: None,
            body: content.to_string(),
        };
    }

    let rest = &content[3..];
    match rest.find("\n---") {
        Some(pos) => {
            let yaml = rest[..pos].trim();
            let body = rest[pos + 4..].trim_start_matches('\n').to_string();
            let meta = serde_yaml::from_str::<DocumentMeta>(yaml).ok();
            match meta {
                Some(meta) => ParsedFile {
                    meta: Some(meta),
                    body,
                },
                // Frontmatter exists but is not ours: keep it as body text
                None => ParsedFile {
                    meta: None,
                    body: content.to_string(),
                },
            }
        }
        None => ParsedFile {
            meta: None,
            body: content.to_string(),
        },
    }
}

/// Serialize metadata block and body back to file content.
pub fn serialize(meta: &DocumentMeta, body: &str) -> String {
    let yaml = serde_yaml::to_string(meta).unwrap_or_default();
    format!("---\n{}---\n\n{}", yaml, body)
}

/// Content of a folder marker file: metadata only, no body.
pub fn folder_marker(meta: &DocumentMeta) -> String {
    let yaml = serde_yaml::to_string(meta).unwrap_or_default();
    format!("---\n{}---\n", yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_meta() {
        let content = "---\nid: '12345'\ntitle: My Page\nversion: 7\n---\n\n# Body\n";
        let parsed = parse(content);
        let meta = parsed.meta.unwrap();
        assert_eq!(meta.id.as_deref(), Some("12345"));
        assert_eq!(meta.title, "My Page");
        assert_eq!(meta.version, Some(7));
        assert!(parsed.body.starts_with("# Body"));
    }

    #[test]
    fn test_parse_without_meta() {
        let content = "# Just content\n";
        let parsed = parse(content);
        assert!(parsed.meta.is_none());
        assert_eq!(parsed.body, content);
    }

    #[test]
    fn test_parse_untracked_new_file() {
        // Title only, no id yet: a freshly created local document
        let content = "---\ntitle: Draft\n---\n\ntext\n";
        let parsed = parse(content);
        let meta = parsed.meta.unwrap();
        assert!(meta.id.is_none());
        assert_eq!(meta.title, "Draft");
    }

    #[test]
    fn test_roundtrip() {
        let meta = DocumentMeta {
            id: Some("99".into()),
            title: "Round Trip".into(),
            version: Some(3),
        };
        let content = serialize(&meta, "# Hello\n");
        let parsed = parse(&content);
        assert_eq!(parsed.meta.unwrap(), meta);
        assert_eq!(parsed.body, "# Hello\n");
    }

    #[test]
    fn test_folder_marker_has_no_body() {
        let meta = DocumentMeta {
            id: Some("7".into()),
            title: "Folder".into(),
            version: None,
        };
        let marker = folder_marker(&meta);
        assert!(marker.ends_with("---\n"));
        let parsed = parse(&marker);
        assert!(parsed.body.is_empty());
    }
}
