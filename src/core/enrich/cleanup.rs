use std::sync::LazyLock;

use regex::Regex;

use crate::core::feed::types::FeedKind;

static FIRST_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#\s+\S").expect("static regex"));
static AUTH_LINK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*\[[^\]]*\]\([^)]*/(?:sign-up|sign-in|signup|login)[^)]*\)[ \t]*$")
        .expect("static regex")
});
static SHARE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*Share[ \t]*$").expect("static regex"));
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static regex"));

static INDIE_HACKERS_TAIL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"Stay informed as an indie hacker\.",
        r"(?m)^Subscribe\s*$",
        r"©\s*Indie Hackers",
        r"(?m)^#+\s*\[Community\]",
        r"(?m)^#+\s*\[Products\]",
        r"(?m)^#+\s*\[Databases\]",
    ])
});
static TECHCRUNCH_TAIL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?m)^#+\s*Most Popular\s*$",
        r"(?m)^#+\s*Related\s*$",
        r"(?im)^Topics\s*$",
        r"©\s*\d{4}\s*TechCrunch",
    ])
});
static GENERIC_TAIL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?m)^Subscribe\s*$",
        r"(?im)^#+\s*related (?:posts|articles|stories)\s*$",
        r"©\s*\d{4}",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
}

fn tail_markers(kind: FeedKind) -> &'static [Regex] {
    match kind {
        FeedKind::IndieHackers => &INDIE_HACKERS_TAIL,
        FeedKind::TechCrunch => &TECHCRUNCH_TAIL,
        _ => &GENERIC_TAIL,
    }
}

/// Trims site chrome from a fetched page: everything before the first
/// top-level heading, everything from the earliest footer marker on, sign-in
/// link lines and lone `Share` lines.
pub fn extract_main_content(markdown: &str, kind: FeedKind) -> String {
    let start = FIRST_HEADING.find(markdown).map_or(0, |found| found.start());
    let mut text = &markdown[start..];

    let cut = tail_markers(kind)
        .iter()
        .filter_map(|marker| marker.find(text).map(|found| found.start()))
        .filter(|position| *position > 0)
        .min();
    if let Some(cut) = cut {
        text = &text[..cut];
    }

    let text = AUTH_LINK_LINE.replace_all(text, "");
    let text = SHARE_LINE.replace_all(&text, "");
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}
