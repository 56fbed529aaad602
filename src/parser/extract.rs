use std::sync::LazyLock;

use regex::Regex;

use super::nodes::{normalize, Node};

// dd.mm.yyyy (also / or -), or ISO yyyy-mm-dd.
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2}[./-]\d{1,2}[./-]\d{4}|\d{4}-\d{2}-\d{2})\b").unwrap()
});

/// A labelled field: the text node after one of `labels` is the candidate,
/// kept only if `accept` says so.
pub struct LabelRule {
    pub labels: &'static [&'static str],
    pub accept: fn(&str) -> bool,
}

pub const ADDRESS: LabelRule = LabelRule {
    labels: &["adresa", "address"],
    accept: looks_like_address,
};

pub const LEGAL_FORM: LabelRule = LabelRule {
    labels: &[
        "forma juridică",
        "forma juridica",
        "forma organizatorico-juridică",
        "forma organizatorico-juridica",
        "legal form",
    ],
    accept: |s| s.chars().count() <= 120,
};

pub const REGISTERED_ON: LabelRule = LabelRule {
    labels: &[
        "data înregistrării",
        "data inregistrarii",
        "data înregistrării de stat",
        "registration date",
    ],
    accept: looks_like_date,
};

const MIN_ADDRESS_CHARS: usize = 10;

// Lowercase. Moldovan municipality/street abbreviations and city spellings.
const LOCALITY_MARKERS: &[&str] = &[
    "mun.",
    "municipiul",
    "str.",
    "str-la",
    "strada",
    "street",
    "bd.",
    "bul.",
    "bulevardul",
    "boulevard",
    "chișinău",
    "chişinău",
    "chisinau",
    "bălți",
    "bălţi",
    "balti",
];

pub fn looks_like_address(s: &str) -> bool {
    if s.chars().count() <= MIN_ADDRESS_CHARS {
        return false;
    }
    let lower = s.to_lowercase();
    LOCALITY_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn looks_like_date(s: &str) -> bool {
    DATE_RE.is_match(s)
}

/// First `<h1>` text, else `<title>` text, normalized.
pub fn company_name(doc: &Node) -> Option<String> {
    ["h1", "title"]
        .iter()
        .find_map(|tag| doc.find_first(tag).and_then(|n| normalize(&n.text())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    SeekingLabel,
    SeekingCandidate,
}

fn is_label(rule: &LabelRule, text: &str) -> bool {
    let lower = text.strip_suffix(':').unwrap_or(text).trim_end().to_lowercase();
    rule.labels.iter().any(|l| *l == lower)
}

/// Two-state scan over normalized text nodes in document order.
///
/// A label arms the scanner; the next non-empty text is the candidate. A
/// rejected candidate disarms it until the next label. First accepted wins.
pub fn scan_labelled<'a, I>(texts: I, rule: &LabelRule) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut state = ScanState::SeekingLabel;
    for text in texts {
        if is_label(rule, text) {
            state = ScanState::SeekingCandidate;
            continue;
        }
        if state == ScanState::SeekingCandidate {
            if (rule.accept)(text) {
                return Some(text.to_string());
            }
            state = ScanState::SeekingLabel;
        }
    }
    None
}

// ── Tests ──
