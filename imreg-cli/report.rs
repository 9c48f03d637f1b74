//! Checks for the static HTML project report.

use imreg_core::RegResult;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Section ids every report must contain
pub const REQUIRED_SECTIONS: [&str; 8] = [
    "introduccion",
    "marco-teorico",
    "metodologia",
    "experimentos",
    "analisis",
    "conclusiones",
    "referencias",
    "contribucion",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ReportIssue {
    EmptyImageSource,
    MissingImage(String),
    MissingSections(Vec<String>),
    MissingMermaid,
}

impl fmt::Display for ReportIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportIssue::EmptyImageSource => write!(f, "image with empty src"),
            ReportIssue::MissingImage(src) => write!(f, "image not found: {}", src),
            ReportIssue::MissingSections(ids) => write!(f, "missing sections: {}", ids.join(", ")),
            ReportIssue::MissingMermaid => write!(f, "no mermaid block found (pipeline diagram)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportValidation {
    pub issues: Vec<ReportIssue>,
    /// Ids of every `<section>` in document order
    pub sections: Vec<String>,
    pub image_count: usize,
}

impl ReportValidation {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Start tag with lowercased name and attribute keys
#[derive(Debug, Clone, PartialEq)]
struct StartTag {
    name: String,
    attrs: HashMap<String, String>,
}

/// Parse `name attr="v" attr='v' attr=v flag` from the inside of a start tag
fn parse_tag(body: &str) -> Option<StartTag> {
    let body = body.trim_end_matches('/');
    let mut chars = body.char_indices().peekable();
    let name_end = body
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(body.len());
    let name = body[..name_end].to_ascii_lowercase();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    while chars.peek().is_some_and(|&(i, _)| i < name_end) {
        chars.next();
    }

    let mut attrs = HashMap::new();
    loop {
        while chars.peek().is_some_and(|&(_, c)| c.is_whitespace() || c == '/') {
            chars.next();
        }
        let Some(&(start, _)) = chars.peek() else { break };
        let mut end = body.len();
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || c == '=' {
                end = i;
                break;
            }
            chars.next();
        }
        let key = body[start..end].to_ascii_lowercase();
        while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        if chars.peek().is_some_and(|&(_, c)| c == '=') {
            chars.next();
            while chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
                chars.next();
            }
            match chars.peek().map(|&(_, c)| c) {
                Some(q @ ('"' | '\'')) => {
                    chars.next();
                    for (_, c) in chars.by_ref() {
                        if c == q {
                            break;
                        }
                        value.push(c);
                    }
                }
                _ => {
                    while let Some(&(_, c)) = chars.peek() {
                        if c.is_whitespace() {
                            break;
                        }
                        value.push(c);
                        chars.next();
                    }
                }
            }
        }
        if !key.is_empty() {
            attrs.entry(key).or_insert(value);
        }
    }
    Some(StartTag { name, attrs })
}

/// Elements whose content is raw text, never markup
const RAW_TEXT_ELEMENTS: [&str; 2] = ["script", "style"];

/// Start tags in document order, skipping comments, declarations, end tags and the
/// content of raw-text elements
fn start_tags(html: &str) -> Vec<StartTag> {
    let mut tags = Vec::new();
    let mut rest = html;
    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        if let Some(after) = rest.strip_prefix("!--") {
            rest = after.find("-->").map_or("", |end| &after[end + 3..]);
            continue;
        }
        let Some(close) = find_tag_end(rest) else { break };
        let body = &rest[..close];
        rest = &rest[close + 1..];
        if body.starts_with('/') || body.starts_with('!') || body.starts_with('?') {
            continue;
        }
        if let Some(tag) = parse_tag(body) {
            if RAW_TEXT_ELEMENTS.contains(&tag.name.as_str()) && !body.ends_with('/') {
                let raw = rest;
                let close = format!("</{}", tag.name);
                rest = raw.to_ascii_lowercase().find(&close).map_or("", |end| &raw[end..]);
            }
            tags.push(tag);
        }
    }
    tags
}

/// Position of the `>` closing a tag, ignoring any inside quoted attribute values
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, '>') => return Some(i),
            _ => {}
        }
    }
    None
}

fn is_remote(src: &str) -> bool {
    src.starts_with("http://") || src.starts_with("https://")
}

/// Validate report markup; local image sources are resolved against `base_dir`
pub fn validate_report_html(html: &str, base_dir: &Path) -> ReportValidation {
    let mut issues = Vec::new();
    let mut sections = Vec::new();
    let mut image_count = 0;

    for tag in start_tags(html) {
        match tag.name.as_str() {
            "img" => {
                image_count += 1;
                let src = tag.attrs.get("src").map_or("", |s| s.trim());
                if src.is_empty() {
                    issues.push(ReportIssue::EmptyImageSource);
                } else if !is_remote(src) && !base_dir.join(src).exists() {
                    issues.push(ReportIssue::MissingImage(src.to_string()));
                }
            }
            "section" => {
                if let Some(id) = tag.attrs.get("id") {
                    sections.push(id.clone());
                }
            }
            _ => {}
        }
    }

    let missing: Vec<String> = REQUIRED_SECTIONS
        .iter()
        .filter(|id| !sections.iter().any(|s| s == *id))
        .map(|id| id.to_string())
        .collect();
    if !missing.is_empty() {
        issues.push(ReportIssue::MissingSections(missing));
    }
    if !html.contains("mermaid") {
        issues.push(ReportIssue::MissingMermaid);
    }

    ReportValidation {
        issues,
        sections,
        image_count,
    }
}

/// Read and validate a report file; images resolve relative to its directory
pub fn validate_report<P: AsRef<Path>>(path: P) -> RegResult<ReportValidation> {
    let path = path.as_ref();
    let html = std::fs::read_to_string(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(validate_report_html(&html, base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("imreg-report-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn full_report(img_src: &str) -> String {
        let mut html = String::from("<!DOCTYPE html><html><body>\n");
        for id in REQUIRED_SECTIONS {
            html.push_str(&format!("<section id=\"{}\"><h2>{}</h2></section>\n", id, id));
        }
        html.push_str(&format!("<img src=\"{}\" alt=\"fig\">\n", img_src));
        html.push_str("<pre class=\"mermaid\">graph LR; A-->B</pre>\n</body></html>");
        html
    }

    #[test]
    fn test_parse_tag_attributes() {
        let tag = parse_tag("IMG src='a b.png' alt=x data-flag").unwrap();
        assert_eq!(tag.name, "img");
        assert_eq!(tag.attrs["src"], "a b.png");
        assert_eq!(tag.attrs["alt"], "x");
        assert_eq!(tag.attrs["data-flag"], "");
        assert!(parse_tag("").is_none());
    }

    #[test]
    fn test_start_tags_skip_comments_and_quotes() {
        let tags = start_tags("<!-- <img src=\"hidden.png\"> --><p title=\"a>b\"><img src=x.png/></p>");
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["p", "img"]);
        assert_eq!(tags[0].attrs["title"], "a>b");
        assert_eq!(tags[1].attrs["src"], "x.png");
    }

    #[test]
    fn test_script_and_style_content_is_raw_text() {
        let html = "<script type=\"module\">const s = '<img src=\"ghost.png\">'; if (a<b) {}</SCRIPT>\
                    <style>p::before { content: '<section id=x>'; }</style>\
                    <img src=\"real.png\">";
        let names: Vec<String> = start_tags(html).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["script", "style", "img"]);

        let result = validate_report_html(html, Path::new("/nonexistent"));
        assert_eq!(result.image_count, 1);
        assert!(result.sections.is_empty());
        assert!(!result.issues.contains(&ReportIssue::MissingImage("ghost.png".into())));
        assert!(result.issues.contains(&ReportIssue::MissingImage("real.png".into())));
    }

    #[test]
    fn test_unclosed_script_swallows_the_rest() {
        let tags = start_tags("<p><script>var x = '<img src=a.png>';");
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["p", "script"]);
    }

    #[test]
    fn test_valid_report() {
        let dir = scratch_dir("valid");
        std::fs::write(dir.join("fig.png"), b"png").unwrap();
        std::fs::write(dir.join("index.html"), full_report("fig.png")).unwrap();
        let result = validate_report(dir.join("index.html")).unwrap();
        assert!(result.is_ok(), "{:?}", result.issues);
        assert_eq!(result.image_count, 1);
        assert_eq!(result.sections.len(), REQUIRED_SECTIONS.len());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_remote_images_are_not_checked() {
        let result = validate_report_html(&full_report("https://example.org/a.png"), Path::new("/nonexistent"));
        assert!(result.is_ok());
    }

    #[test]
    fn test_reports_every_problem() {
        let html = "<section id=\"introduccion\"></section><img src=\"  \"><img src=\"missing.png\">";
        let result = validate_report_html(html, Path::new("/nonexistent"));
        assert!(!result.is_ok());
        assert!(result.issues.contains(&ReportIssue::EmptyImageSource));
        assert!(result.issues.contains(&ReportIssue::MissingImage("missing.png".into())));
        assert!(result.issues.contains(&ReportIssue::MissingMermaid));
        let missing = result.issues.iter().find_map(|i| match i {
            ReportIssue::MissingSections(ids) => Some(ids.clone()),
            _ => None,
        });
        assert_eq!(missing.unwrap().len(), REQUIRED_SECTIONS.len() - 1);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            validate_report("/nonexistent/report.html"),
            Err(imreg_core::RegError::Io(_))
        ));
    }
}
