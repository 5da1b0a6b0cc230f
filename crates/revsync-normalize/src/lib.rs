//! Text canonicalization and field normalization for raw review cells.
//!
//! Everything here is total: malformed input degrades to an empty string or
//! an absent value, never an error.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use revsync_core::{RawReview, ReviewColumn, ReviewId, ReviewRecord};
use scraper::{Html, Node};

pub const CRATE_NAME: &str = "revsync-normalize";

/// Inclusive code point ranges treated as emoji or pictographs.
const PICTOGRAPHIC_RANGES: &[(u32, u32)] = &[
    (0x200D, 0x200D),   // zero width joiner
    (0x20E3, 0x20E3),   // combining enclosing keycap
    (0x231A, 0x231B),   // watch, hourglass
    (0x23CF, 0x23CF),   // eject
    (0x23E9, 0x23FA),   // media controls
    (0x24C2, 0x24C2),   // circled M
    (0x2600, 0x26FF),   // miscellaneous symbols
    (0x2700, 0x27BF),   // dingbats
    (0x2B50, 0x2B55),   // stars and circles
    (0x3030, 0x3030),   // wavy dash
    (0x303D, 0x303D),   // part alternation mark
    (0xFE00, 0xFE0F),   // variation selectors
    (0x1F000, 0x1F02F), // mahjong tiles
    (0x1F0A0, 0x1F0FF), // playing cards
    (0x1F100, 0x1F1FF), // enclosed alphanumerics, regional indicators
    (0x1F200, 0x1F2FF), // enclosed ideographic supplement
    (0x1F300, 0x1F5FF), // symbols and pictographs
    (0x1F600, 0x1F64F), // emoticons
    (0x1F680, 0x1F6FF), // transport and map
    (0x1F780, 0x1F7FF), // geometric shapes extended
    (0x1F900, 0x1F9FF), // supplemental symbols and pictographs
    (0x1FA70, 0x1FAFF), // symbols and pictographs extended-A
    (0xE0020, 0xE007F), // tag sequences
];

/// Elements whose text never reaches the canonical form.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements that separate words when rendered.
const BREAKING_ELEMENTS: &[&str] = &[
    "br", "p", "div", "li", "ul", "ol", "tr", "td", "th", "h1", "h2", "h3", "h4", "h5", "h6",
    "blockquote", "section", "article",
];

static RE_LEADING_LABEL: OnceLock<Regex> = OnceLock::new();
static RE_TRAILING_CONTINUATION: OnceLock<Regex> = OnceLock::new();
static RE_TRAILING_BRACKETED: OnceLock<Regex> = OnceLock::new();
static RE_TRAILING_PARENTHETICAL: OnceLock<Regex> = OnceLock::new();
static RE_SAYS_PREAMBLE: OnceLock<Regex> = OnceLock::new();
static RE_RATING_RESTATEMENT: OnceLock<Regex> = OnceLock::new();

static RE_RATING_OUT_OF_5: OnceLock<Regex> = OnceLock::new();
static RE_RATING_SLASH_5: OnceLock<Regex> = OnceLock::new();
static RE_RATING_STARS: OnceLock<Regex> = OnceLock::new();
static RE_RATING_SLASH_10: OnceLock<Regex> = OnceLock::new();
static RE_RATING_BARE: OnceLock<Regex> = OnceLock::new();

static RE_DATE_PREFIX: OnceLock<Regex> = OnceLock::new();
static RE_DATE_ISO: OnceLock<Regex> = OnceLock::new();
static RE_DATE_MONTH_FIRST: OnceLock<Regex> = OnceLock::new();
static RE_DATE_DAY_FIRST: OnceLock<Regex> = OnceLock::new();
static RE_DATE_SLASHED: OnceLock<Regex> = OnceLock::new();

static RE_COUNT: OnceLock<Regex> = OnceLock::new();

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern is valid"))
}

/// Canonical form of a free-text review body.
///
/// Runs markup stripping, entity unescaping, pictograph removal, whitespace
/// collapsing and boilerplate stripping, repeating the sequence until the
/// output stops changing. Unescaping can reveal markup (`&lt;b&gt;`) and
/// stripping a label can expose another, so a single pass is not a fixed
/// point; the repetition is what makes `canonicalize_text` idempotent.
pub fn canonicalize_text(raw: &str) -> String {
    settle(raw, |text| strip_boilerplate(&clean_pass(text)))
}

/// Steps one through four of [`canonicalize_text`], for short labels such as
/// product and reviewer names where boilerplate rules would eat real content.
pub fn clean_label(raw: &str) -> String {
    settle(raw, clean_pass)
}

/// Apply `pass` until the output stops changing. After the first pass
/// whitespace is already collapsed, so every later change removes characters
/// and the loop terminates.
fn settle(raw: &str, pass: impl Fn(&str) -> String) -> String {
    let mut current = pass(raw);
    loop {
        let next = pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn clean_pass(text: &str) -> String {
    let text = strip_markup(text);
    let text = unescape_entities(&text);
    let text = remove_pictographs(&text);
    normalize_whitespace(&text)
}

/// Drop tags, comments and the contents of script/style blocks, keeping text.
pub fn strip_markup(text: &str) -> String {
    if !text.contains('<') && !text.contains('&') {
        return text.to_string();
    }
    let fragment = Html::parse_fragment(text);
    let mut out = String::with_capacity(text.len());
    for node in fragment.tree.root().descendants() {
        match node.value() {
            Node::Text(t) => {
                let hidden = node.ancestors().any(|a| {
                    a.value()
                        .as_element()
                        .is_some_and(|e| HIDDEN_ELEMENTS.contains(&e.name()))
                });
                if !hidden {
                    out.push_str(&t.text);
                }
            }
            Node::Element(e) if BREAKING_ELEMENTS.contains(&e.name()) => out.push(' '),
            _ => {}
        }
    }
    out
}

/// Decode markup entities (`&amp;`, `&#39;`, `&eacute;`) to literal characters.
pub fn unescape_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

pub fn is_pictographic(ch: char) -> bool {
    let cp = ch as u32;
    PICTOGRAPHIC_RANGES
        .iter()
        .any(|&(lo, hi)| (lo..=hi).contains(&cp))
}

pub fn remove_pictographs(text: &str) -> String {
    text.chars().filter(|c| !is_pictographic(*c)).collect()
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip review-platform affixes: leading labels, "<name> says:" preambles,
/// leading rating restatements, trailing continuation markers and trailing
/// bracketed or parenthetical annotations.
pub fn strip_boilerplate(text: &str) -> String {
    let rules: [(&'static OnceLock<Regex>, &str); 6] = [
        (
            &RE_LEADING_LABEL,
            r"(?i)^(?:review|rating|verified purchase)\s*:\s*",
        ),
        (
            &RE_SAYS_PREAMBLE,
            r"(?i)^[^\s:]+(?:\s+[^\s:]+){0,3}\s+says\s*:\s*",
        ),
        (
            &RE_RATING_RESTATEMENT,
            r"(?i)^\d+(?:\.\d+)?\s*(?:stars?|/\s*5|out\s+of\s+5(?:\s+stars?)?)\b\s*[-:.]?\s*",
        ),
        (
            &RE_TRAILING_CONTINUATION,
            r"(?i)\s*(?:\.\.\.|…)?\s*(?:read more|show less|see more|show more)\s*$",
        ),
        (&RE_TRAILING_BRACKETED, r"\s*\[[^\[\]]*\]\s*$"),
        (&RE_TRAILING_PARENTHETICAL, r"\s*\([^()]*\)\s*$"),
    ];

    let mut out = text.trim().to_string();
    loop {
        let before = out.len();
        for (cell, pattern) in rules {
            let re = regex(cell, pattern);
            while let Some(m) = re.find(&out) {
                if m.as_str().is_empty() {
                    break;
                }
                let range = m.range();
                out.replace_range(range, "");
                out = out.trim().to_string();
            }
        }
        if out.len() == before {
            return out;
        }
    }
}

/// Parse a free-form rating onto the 0–5 scale.
///
/// Patterns are tried in order: "N out of 5", "N/5", "N stars", "N/10",
/// bare number. A `/10` match or a value above 5 is halved, then clamped.
/// Returns `None` when nothing numeric is present; zero is a real rating.
pub fn parse_rating(raw: &str) -> Option<f64> {
    let text = normalize_whitespace(&unescape_entities(&strip_markup(raw)));
    let patterns: [(&'static OnceLock<Regex>, &str, bool); 5] = [
        (
            &RE_RATING_OUT_OF_5,
            r"(?i)(\d+(?:\.\d+)?)\s*(?:out\s+of|of)\s*5(?:\D|$)",
            false,
        ),
        (&RE_RATING_SLASH_5, r"(\d+(?:\.\d+)?)\s*/\s*5(?:\D|$)", false),
        (&RE_RATING_STARS, r"(?i)(\d+(?:\.\d+)?)\s*stars?\b", false),
        (&RE_RATING_SLASH_10, r"(\d+(?:\.\d+)?)\s*/\s*10(?:\D|$)", true),
        (&RE_RATING_BARE, r"(\d+(?:\.\d+)?)", false),
    ];

    for (cell, pattern, out_of_ten) in patterns {
        let Some(caps) = regex(cell, pattern).captures(&text) else {
            continue;
        };
        let Ok(mut value) = caps[1].parse::<f64>() else {
            continue;
        };
        if out_of_ten || value > 5.0 {
            value /= 2.0;
        }
        return Some(value.clamp(0.0, 5.0));
    }
    None
}

/// Clean a raw date cell: strip markup, collapse whitespace, drop "Reviewed",
/// "Posted", "Date:" and "On" prefixes. Unparseable dates pass through as
/// cleaned text; see [`resolve_review_date`] for calendar resolution.
pub fn clean_date(raw: &str) -> Option<String> {
    let text = normalize_whitespace(&unescape_entities(&strip_markup(raw)));
    let prefix = regex(
        &RE_DATE_PREFIX,
        r"(?i)^(?:(?:reviewed|posted|on)\b\s*:?|date\s*:)\s*",
    );
    let mut cleaned = text;
    while let Some(m) = prefix.find(&cleaned) {
        if m.as_str().is_empty() {
            break;
        }
        cleaned = cleaned[m.end()..].trim().to_string();
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Resolve cleaned date text to a calendar date, searching for an embedded
/// ISO date, "March 3, 2024", "3 March 2024" or "03/14/2024" (month first).
pub fn resolve_review_date(text: &str) -> Option<NaiveDate> {
    let iso = regex(&RE_DATE_ISO, r"(?:^|\D)(\d{4})-(\d{1,2})-(\d{1,2})(?:\D|$)");
    if let Some(c) = iso.captures(text) {
        if let Some(date) = ymd(&c[1], &c[2], &c[3]) {
            return Some(date);
        }
    }

    let month_first = regex(
        &RE_DATE_MONTH_FIRST,
        r"(?i)\b([a-z]{3,9})\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})\b",
    );
    for c in month_first.captures_iter(text) {
        if let Some(month) = month_number(&c[1]) {
            if let Some(date) = ymd(&c[3], &month.to_string(), &c[2]) {
                return Some(date);
            }
        }
    }

    let day_first = regex(
        &RE_DATE_DAY_FIRST,
        r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?\s+([a-z]{3,9})\.?,?\s+(\d{4})\b",
    );
    for c in day_first.captures_iter(text) {
        if let Some(month) = month_number(&c[2]) {
            if let Some(date) = ymd(&c[3], &month.to_string(), &c[1]) {
                return Some(date);
            }
        }
    }

    let slashed = regex(&RE_DATE_SLASHED, r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b");
    if let Some(c) = slashed.captures(text) {
        return ymd(&c[3], &c[1], &c[2]);
    }
    None
}

fn ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn month_number(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let lower = name.to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    MONTHS
        .iter()
        .position(|m| *m == prefix)
        .map(|idx| idx as u32 + 1)
}

/// First count in the text ("1,204 people found this helpful" → 1204).
/// A leading "One person" counts as one; anything else unparseable is zero.
pub fn parse_helpful_votes(raw: &str) -> u32 {
    let text = normalize_whitespace(&strip_markup(raw));
    let count = regex(&RE_COUNT, r"\d[\d,]*");
    if let Some(m) = count.find(&text) {
        return m.as_str().replace(',', "").parse().unwrap_or(0);
    }
    if text.to_ascii_lowercase().starts_with("one ") {
        return 1;
    }
    0
}

/// Map a verified-purchase flag or tag to a boolean.
pub fn parse_verified(raw: &str) -> Option<bool> {
    let text = normalize_whitespace(&strip_markup(raw)).to_ascii_lowercase();
    match text.as_str() {
        "" => None,
        "true" | "yes" | "y" | "1" | "verified" | "verified purchase" => Some(true),
        "false" | "no" | "n" | "0" | "unverified" | "not verified" => Some(false),
        other if other.contains("unverified") || other.contains("not verified") => Some(false),
        other if other.contains("verified") => Some(true),
        _ => None,
    }
}

/// Page numbers are positive; zero and non-numeric cells are absent.
pub fn parse_page_number(raw: &str) -> Option<u32> {
    let count = regex(&RE_COUNT, r"\d[\d,]*");
    count
        .find(raw)
        .and_then(|m| m.as_str().replace(',', "").parse::<u32>().ok())
        .filter(|p| *p > 0)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Build a canonical [`ReviewRecord`] from a raw dataset row.
///
/// The raw text is kept verbatim; `canonical_text` is always recomputed from
/// it. Rows that only carry a canonical column (no raw text) canonicalize
/// that instead, which is a no-op for already-canonical text.
pub fn canonicalize_review(raw: &RawReview) -> ReviewRecord {
    let raw_text = raw.get(ReviewColumn::ReviewText).map(ToString::to_string);
    let canonical_source = raw_text
        .as_deref()
        .or_else(|| raw.get(ReviewColumn::CanonicalText))
        .unwrap_or_default();

    ReviewRecord {
        product_name: raw
            .get(ReviewColumn::ProductName)
            .and_then(|v| non_empty(clean_label(v))),
        product_url: raw
            .get(ReviewColumn::ProductUrl)
            .and_then(|v| non_empty(v.trim().to_string())),
        review_title: raw
            .get(ReviewColumn::ReviewTitle)
            .and_then(|v| non_empty(clean_label(v))),
        canonical_text: canonicalize_text(canonical_source),
        raw_text,
        rating: raw.get(ReviewColumn::Rating).and_then(parse_rating),
        review_date: raw.get(ReviewColumn::ReviewDate).and_then(clean_date),
        reviewer_name: raw
            .get(ReviewColumn::ReviewerName)
            .and_then(|v| non_empty(clean_label(v))),
        review_id: raw.get(ReviewColumn::ReviewId).and_then(ReviewId::parse),
        helpful_votes: raw
            .get(ReviewColumn::HelpfulVotes)
            .map(parse_helpful_votes)
            .unwrap_or(0),
        verified_purchase: raw.get(ReviewColumn::VerifiedPurchase).and_then(parse_verified),
        page_number: raw.get(ReviewColumn::PageNumber).and_then(parse_page_number),
        scraped_at: raw
            .get(ReviewColumn::ScrapedAt)
            .and_then(|v| non_empty(v.trim().to_string())),
        extra: raw.extra.clone(),
    }
}
