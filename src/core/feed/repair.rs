//! Best-effort fixes for feed documents that are almost, but not quite, XML.
//!
//! The heuristics here were tuned against payloads seen from real feeds:
//! viewer pages wrapping the XML, stray HTML entities, undeclared namespace
//! prefixes, `<tag/>text` pairs and tags that are never closed. They are not a
//! general-purpose XML fixer; anything they cannot mend is left for the parser
//! to reject.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::entities::{decode_entities, normalize_entities};

pub const DEFAULT_NAMESPACES: [(&str, &str); 4] = [
    ("atom", "http://www.w3.org/2005/Atom"),
    ("dc", "http://purl.org/dc/elements/1.1/"),
    ("content", "http://purl.org/rss/1.0/modules/content/"),
    ("media", "http://search.yahoo.com/mrss/"),
];

static USED_ELEMENT_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?([A-Za-z_][\w.-]*):[A-Za-z_]").expect("static regex"));
static USED_ATTRIBUTE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s([A-Za-z_][\w.-]*):[A-Za-z_][\w.-]*\s*=\s*["']"#).expect("static regex")
});
static DECLARED_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"xmlns:([A-Za-z_][\w.-]*)\s*=").expect("static regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));

/// Pulls the feed document out of an HTML viewer page, if it is wrapped in one.
pub fn extract_embedded_feed(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim_start();
    if ["<?xml", "<rss", "<feed", "<rdf:RDF"]
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return Cow::Borrowed(trimmed);
    }

    for root in ["rss", "feed"] {
        if let Some(inner) = slice_between(text, &format!("<{root}"), &format!("</{root}>")) {
            return Cow::Borrowed(inner);
        }
    }

    // Viewers that escape the document: strip their own markup, then unescape.
    for root in ["rss", "feed"] {
        if let Some(inner) = slice_between(text, &format!("&lt;{root}"), &format!("&lt;/{root}&gt;")) {
            let without_viewer_tags = TAG.replace_all(inner, "");
            return Cow::Owned(decode_entities(&without_viewer_tags));
        }
    }

    Cow::Borrowed(text)
}

fn slice_between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let mut search_from = 0;
    let start = loop {
        let index = search_from + text[search_from..].find(open)?;
        let next = text[index + open.len()..].chars().next();
        if matches!(next, Some(ch) if ch.is_whitespace() || ch == '>') {
            break index;
        }
        search_from = index + open.len();
    };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..end + close.len()])
}

/// Pre-parse cleanup applied to every document: BOM and illegal control
/// characters are dropped and ampersands are made XML-safe. CDATA sections and
/// comments are copied verbatim.
pub fn sanitize(text: &str) -> String {
    let text = text.trim_start_matches('\u{FEFF}').trim_start();
    let cleaned: String = text
        .chars()
        .filter(|ch| !ch.is_control() || matches!(ch, '\t' | '\n' | '\r'))
        .collect();

    let mut out = String::with_capacity(cleaned.len());
    let mut rest = cleaned.as_str();
    loop {
        let cdata = rest.find("<![CDATA[");
        let comment = rest.find("<!--");
        let (start, terminator) = match (cdata, comment) {
            (Some(c), Some(m)) if m < c => (m, "-->"),
            (Some(c), _) => (c, "]]>"),
            (None, Some(m)) => (m, "-->"),
            (None, None) => {
                out.push_str(&normalize_entities(rest));
                break;
            }
        };
        out.push_str(&normalize_entities(&rest[..start]));
        match rest[start..].find(terminator) {
            Some(end) => {
                let stop = start + end + terminator.len();
                out.push_str(&rest[start..stop]);
                rest = &rest[stop..];
            }
            None => {
                out.push_str(&rest[start..]);
                break;
            }
        }
    }
    out
}

/// Declares every namespace prefix the document uses but never declares.
/// Well-known prefixes get their canonical URI; anything else gets a
/// placeholder so the document can still be read.
pub fn declare_missing_namespaces(text: &str) -> Cow<'_, str> {
    let declared: BTreeSet<&str> = DECLARED_PREFIX
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    let used: BTreeSet<&str> = USED_ELEMENT_PREFIX
        .captures_iter(text)
        .chain(USED_ATTRIBUTE_PREFIX.captures_iter(text))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .filter(|prefix| !matches!(*prefix, "xml" | "xmlns"))
        .collect();

    let missing: Vec<&str> = used.difference(&declared).copied().collect();
    if missing.is_empty() {
        return Cow::Borrowed(text);
    }
    let Some(insert_at) = root_name_end(text) else {
        return Cow::Borrowed(text);
    };

    let mut declarations = String::new();
    for prefix in missing {
        let uri = DEFAULT_NAMESPACES
            .iter()
            .find(|(known, _)| *known == prefix)
            .map(|(_, uri)| (*uri).to_string())
            .unwrap_or_else(|| format!("urn:undeclared:{prefix}"));
        declarations.push_str(&format!(" xmlns:{prefix}=\"{uri}\""));
    }

    let mut out = String::with_capacity(text.len() + declarations.len());
    out.push_str(&text[..insert_at]);
    out.push_str(&declarations);
    out.push_str(&text[insert_at..]);
    Cow::Owned(out)
}

/// Byte offset just past the root element's name.
fn root_name_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut index = 0;
    while let Some(offset) = text[index..].find('<') {
        let start = index + offset;
        let rest = &text[start..];
        // Prolog constructs may contain `<` themselves, so skip each one whole.
        let terminator = if rest.starts_with("<!--") {
            Some("-->")
        } else if rest.starts_with("<?") {
            Some("?>")
        } else if rest.starts_with("<!") {
            Some(">")
        } else {
            None
        };
        if let Some(terminator) = terminator {
            index = start + rest.find(terminator)? + terminator.len();
            continue;
        }
        match bytes.get(start + 1) {
            Some(&next) if is_name_start(next) => {
                return Some(name_end(bytes, start + 1));
            }
            _ => index = start + 1,
        }
    }
    None
}

struct Frame {
    name: String,
    has_text: bool,
    /// Where a child tag first followed this element's own text.
    close_at: Option<usize>,
}

struct Edit {
    pos: usize,
    remove: usize,
    insert: String,
}

impl Edit {
    fn insert(pos: usize, insert: String) -> Self {
        Self {
            pos,
            remove: 0,
            insert,
        }
    }

    fn replace(pos: usize, remove: usize, insert: &str) -> Self {
        Self {
            pos,
            remove,
            insert: insert.to_string(),
        }
    }
}

struct OpenTag {
    name: String,
    end: usize,
    slash: Option<usize>,
}

/// Second-chance repair, run only after a strict parse has failed:
/// - `<tag/>text` becomes `<tag>text</tag>`;
/// - an element still open when its parent closes is closed before the first
///   child tag that followed its own text (or right before the parent's close);
/// - closing tags with no open counterpart are dropped;
/// - a `<` that cannot start markup is escaped.
pub fn repair_markup(input: &str) -> String {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut edits: Vec<Edit> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut index = 0;

    while index < len {
        if bytes[index] != b'<' {
            let end = find_from(input, index, "<").unwrap_or(len);
            if !input[index..end].trim().is_empty() {
                if let Some(top) = stack.last_mut() {
                    top.has_text = true;
                }
            }
            index = end;
            continue;
        }

        let rest = &input[index..];
        if rest.starts_with("<!--") {
            index = skip_past(input, index, "-->", &mut edits);
        } else if rest.starts_with("<![CDATA[") {
            if let Some(top) = stack.last_mut() {
                top.has_text = true;
            }
            index = skip_past(input, index, "]]>", &mut edits);
        } else if rest.starts_with("<?") {
            index = find_from(input, index, "?>").map_or(len, |end| end + 2);
        } else if rest.starts_with("<!") {
            index = skip_declaration(bytes, index);
        } else if rest.starts_with("</") {
            match scan_close_tag(input, index) {
                Some((name, end)) => {
                    match stack.iter().rposition(|frame| frame.name == name) {
                        Some(position) => {
                            close_frames(&mut stack, position + 1, index, &mut edits);
                            stack.pop();
                        }
                        None => edits.push(Edit::replace(index, end - index, "")),
                    }
                    index = end;
                }
                None => {
                    edits.push(Edit::replace(index, 1, "&lt;"));
                    index += 1;
                }
            }
        } else {
            match scan_open_tag(input, index) {
                Some(tag) => {
                    if let Some(top) = stack.last_mut() {
                        if top.has_text && top.close_at.is_none() {
                            top.close_at = Some(index);
                        }
                    }
                    match tag.slash {
                        None => {
                            stack.push(Frame {
                                name: tag.name,
                                has_text: false,
                                close_at: None,
                            });
                            index = tag.end;
                        }
                        Some(slash) => {
                            let text_end = find_from(input, tag.end, "<").unwrap_or(len);
                            if input[tag.end..text_end].trim().is_empty() {
                                index = tag.end;
                            } else {
                                edits.push(Edit::replace(slash, 1, ""));
                                edits.push(Edit::insert(text_end, format!("</{}>", tag.name)));
                                index = text_end;
                            }
                        }
                    }
                }
                None => {
                    edits.push(Edit::replace(index, 1, "&lt;"));
                    index += 1;
                }
            }
        }
    }

    close_frames(&mut stack, 0, len, &mut edits);
    apply_edits(input, edits)
}

fn close_frames(stack: &mut Vec<Frame>, keep: usize, at: usize, edits: &mut Vec<Edit>) {
    while stack.len() > keep {
        let Some(frame) = stack.pop() else {
            break;
        };
        edits.push(Edit::insert(
            frame.close_at.unwrap_or(at),
            format!("</{}>", frame.name),
        ));
    }
}

fn apply_edits(input: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|edit| edit.pos);
    let mut out = String::with_capacity(input.len() + edits.len() * 8);
    let mut cursor = 0;
    for edit in edits {
        if edit.pos > cursor {
            out.push_str(&input[cursor..edit.pos]);
            cursor = edit.pos;
        }
        out.push_str(&edit.insert);
        if edit.remove > 0 && edit.pos >= cursor {
            cursor = edit.pos + edit.remove;
        }
    }
    if cursor < input.len() {
        out.push_str(&input[cursor..]);
    }
    out
}

fn find_from(input: &str, from: usize, needle: &str) -> Option<usize> {
    input[from..].find(needle).map(|offset| from + offset)
}

fn skip_past(input: &str, from: usize, terminator: &str, edits: &mut Vec<Edit>) -> usize {
    match find_from(input, from, terminator) {
        Some(end) => end + terminator.len(),
        None => {
            edits.push(Edit::insert(input.len(), terminator.to_string()));
            input.len()
        }
    }
}

fn skip_declaration(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0_i32;
    let mut index = start + 2;
    while index < bytes.len() {
        match bytes[index] {
            b'[' => depth += 1,
            b']' => depth -= 1,
            b'>' if depth <= 0 => return index + 1,
            _ => {}
        }
        index += 1;
    }
    bytes.len()
}

fn is_name_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte >= 0x80
}

fn is_name_char(byte: u8) -> bool {
    is_name_start(byte) || byte.is_ascii_digit() || matches!(byte, b'-' | b'.' | b':')
}

fn name_end(bytes: &[u8], start: usize) -> usize {
    let mut index = start;
    while index < bytes.len() && is_name_char(bytes[index]) {
        index += 1;
    }
    index
}

fn scan_close_tag(input: &str, start: usize) -> Option<(String, usize)> {
    let bytes = input.as_bytes();
    let name_start = start + 2;
    if !bytes.get(name_start).copied().is_some_and(is_name_start) {
        return None;
    }
    let name_stop = name_end(bytes, name_start);
    let mut index = name_stop;
    while index < bytes.len() && bytes[index].is_ascii_whitespace() {
        index += 1;
    }
    (bytes.get(index) == Some(&b'>'))
        .then(|| (input[name_start..name_stop].to_string(), index + 1))
}

fn scan_open_tag(input: &str, start: usize) -> Option<OpenTag> {
    let bytes = input.as_bytes();
    let name_start = start + 1;
    if !bytes.get(name_start).copied().is_some_and(is_name_start) {
        return None;
    }
    let name_stop = name_end(bytes, name_start);
    let mut index = name_stop;
    let mut last_significant: Option<usize> = None;
    while index < bytes.len() {
        match bytes[index] {
            quote @ (b'"' | b'\'') => {
                let close = bytes[index + 1..].iter().position(|byte| *byte == quote)?;
                index += close + 2;
                last_significant = None;
                continue;
            }
            b'<' => return None,
            b'>' => {
                let slash = last_significant.filter(|position| bytes[*position] == b'/');
                return Some(OpenTag {
                    name: input[name_start..name_stop].to_string(),
                    end: index + 1,
                    slash,
                });
            }
            byte if byte.is_ascii_whitespace() => {}
            _ => last_significant = Some(index),
        }
        index += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parses(text: &str) -> bool {
        roxmltree::Document::parse(text).is_ok()
    }

    #[test]
    fn self_closing_tag_followed_by_text_becomes_a_pair() {
        let input = "<item><link/>https://example.com/a\n<title>A</title></item>";
        let repaired = repair_markup(input);
        assert_eq!(
            repaired,
            "<item><link>https://example.com/a\n</link><title>A</title></item>"
        );
        assert!(parses(&repaired));
    }

    #[test]
    fn self_closing_tag_holding_text_drops_the_orphan_close() {
        let repaired = repair_markup("<item><guid/>abc-1</guid></item>");
        assert_eq!(repaired, "<item><guid>abc-1</guid></item>");
    }

    #[test]
    fn self_closing_tag_with_only_whitespace_is_untouched() {
        let input = "<item><enclosure url=\"x\" />\n  <title>A</title></item>";
        assert_eq!(repair_markup(input), input);
    }

    #[test]
    fn unclosed_leaf_is_closed_before_next_sibling() {
        let repaired = repair_markup("<item><title>Hello<link>u</link></item>");
        assert_eq!(repaired, "<item><title>Hello</title><link>u</link></item>");
        assert!(parses(&repaired));
    }

    #[test]
    fn unclosed_elements_at_end_of_input_are_closed() {
        let repaired = repair_markup("<rss><channel><item><title>T</title>");
        assert_eq!(repaired, "<rss><channel><item><title>T</title></item></channel></rss>");
    }

    #[test]
    fn stray_closing_tags_are_removed() {
        let repaired = repair_markup("<item><title>T</title></b></item>");
        assert_eq!(repaired, "<item><title>T</title></item>");
    }

    #[test]
    fn html_void_tags_inside_text_are_balanced() {
        let repaired = repair_markup("<description>a<br>b<br>c</description>");
        assert!(parses(&repaired), "{repaired}");
    }

    #[test]
    fn bare_less_than_is_escaped() {
        let repaired = repair_markup("<title>1 < 2</title>");
        assert_eq!(repaired, "<title>1 &lt; 2</title>");
    }

    #[test]
    fn cdata_and_comments_are_left_alone() {
        let input = "<d><![CDATA[<b>x</i>]]><!-- <oops --></d>";
        assert_eq!(repair_markup(input), input);
    }

    #[test]
    fn sanitize_escapes_ampersands_outside_cdata() {
        let input = "\u{FEFF}<t>Q&A &nbsp;x\u{0}</t><d><![CDATA[a & b]]></d>";
        assert_eq!(
            sanitize(input),
            "<t>Q&amp;A \u{00A0}x</t><d><![CDATA[a & b]]></d>"
        );
    }

    #[test]
    fn undeclared_prefixes_are_declared_on_the_root() {
        let input = "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><item><dc:creator>a</dc:creator><foo:bar>b</foo:bar></item></channel></rss>";
        let declared = declare_missing_namespaces(input);
        assert!(declared.contains("<rss xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:foo=\"urn:undeclared:foo\" version"));
        assert!(parses(&declared));
    }

    #[test]
    fn declarations_skip_markup_hidden_in_the_prolog() {
        let input = "<?xml version=\"1.0\"?>\n<!DOCTYPE rss>\n<!-- mirrored from <b>upstream</b> -->\n\
                     <rss version=\"2.0\"><channel><item><dc:creator>a</dc:creator></item></channel></rss>";
        let declared = declare_missing_namespaces(input);
        assert!(declared.contains("<rss xmlns:dc=\"http://purl.org/dc/elements/1.1/\" version"));
        assert!(declared.contains("<!-- mirrored from <b>upstream</b> -->"));
        assert!(parses(&declared));
    }

    #[test]
    fn declared_prefixes_are_not_redeclared() {
        let input = "<rss xmlns:dc=\"http://purl.org/dc/elements/1.1/\"><dc:creator>a</dc:creator></rss>";
        assert!(matches!(declare_missing_namespaces(input), Cow::Borrowed(_)));
    }

    #[test]
    fn embedded_feed_is_extracted_from_viewer_html() {
        let wrapped = "<html><body><pre><rss version=\"2.0\"><channel></channel></rss></pre></body></html>";
        assert_eq!(
            extract_embedded_feed(wrapped),
            "<rss version=\"2.0\"><channel></channel></rss>"
        );

        let escaped = "<html><body><div>&lt;rss version=\"2.0\"&gt;<span>&lt;channel&gt;&lt;/channel&gt;</span>&lt;/rss&gt;</div></body></html>";
        assert_eq!(
            extract_embedded_feed(escaped),
            "<rss version=\"2.0\"><channel></channel></rss>"
        );
    }

    #[test]
    fn known_malformed_fixtures_parse_after_repair() {
        for raw in [
            include_str!("../../../fixtures/feeds/rss_malformed.xml"),
            include_str!("../../../fixtures/feeds/rss_unclosed.xml"),
        ] {
            let cleaned = sanitize(raw);
            let cleaned = declare_missing_namespaces(&cleaned).into_owned();
            assert!(!parses(&cleaned), "fixture should need repair");
            let repaired = repair_markup(&cleaned);
            assert!(parses(&repaired), "repair failed:\n{repaired}");
        }
    }
}
