//! Entity recognizers over text. Overlap resolution prefers the earlier
//! start, then the longer span, then the stable kind order.

use crate::EgressError;
use regex::Regex;
use std::sync::OnceLock;

/// Recognized entity kinds, in stable resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    /// Social security numbers.
    Ssn,
    /// Credit card numbers.
    CreditCard,
    /// Email addresses.
    Email,
    /// Phone numbers.
    Phone,
    /// IPv4 addresses.
    Ipv4,
    /// URLs.
    Url,
    /// Windows-style file paths.
    FilePath,
    /// Person names (capitalized pairs or name-list matches).
    Name,
    /// Custom regex matches.
    Custom,
}

impl EntityKind {
    /// Token type label, e.g. `EMAIL`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Ssn => "SSN",
            EntityKind::CreditCard => "CREDIT_CARD",
            EntityKind::Email => "EMAIL",
            EntityKind::Phone => "PHONE",
            EntityKind::Ipv4 => "IPV4",
            EntityKind::Url => "URL",
            EntityKind::FilePath => "FILEPATH",
            EntityKind::Name => "NAME",
            EntityKind::Custom => "CUSTOM",
        }
    }
}

/// One detected entity span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Byte offset of the span start.
    pub start: usize,
    /// Byte offset one past the span end.
    pub end: usize,
    /// Entity kind.
    pub kind: EntityKind,
    /// Matched text.
    pub value: String,
}

/// Which recognizers run, plus custom patterns and the name list.
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// SSN recognizer.
    pub ssn: bool,
    /// Credit card recognizer.
    pub credit_card: bool,
    /// Email recognizer.
    pub email: bool,
    /// Phone recognizer.
    pub phone: bool,
    /// IPv4 recognizer.
    pub ipv4: bool,
    /// URL recognizer.
    pub url: bool,
    /// File path recognizer.
    pub filepath: bool,
    /// Capitalized-name recognizer.
    pub names: bool,
    /// Known names from a NER bundle, matched case-insensitively.
    pub name_list: Vec<String>,
    /// Extra caller-supplied patterns.
    pub custom_patterns: Vec<String>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        RecognizerConfig {
            ssn: true,
            credit_card: true,
            email: true,
            phone: true,
            ipv4: true,
            url: true,
            filepath: true,
            names: true,
            name_list: Vec::new(),
            custom_patterns: Vec::new(),
        }
    }
}

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).unwrap_or_else(|err| panic!("{err}")))
        }
    };
}

static_regex!(email_re, r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}");
static_regex!(
    phone_re,
    r"\b(?:\+?1[-.\s]?)?(?:\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4})\b"
);
static_regex!(ssn_re, r"\b\d{3}-\d{2}-\d{4}\b");
static_regex!(credit_card_re, r"\b(?:\d[ -]*?){13,19}\b");
static_regex!(ipv4_re, r"\b(?:\d{1,3}\.){3}\d{1,3}\b");
static_regex!(url_re, r"\bhttps?://[^\s]+");
static_regex!(filepath_re, r"\b[A-Za-z]:\\[^\s]+");
static_regex!(name_re, r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+\b");

/// Find entities in `text` under the configured recognizers.
pub fn find_entities(text: &str, config: &RecognizerConfig) -> Result<Vec<Entity>, EgressError> {
    let mut matches: Vec<Entity> = Vec::new();
    let mut run = |enabled: bool, kind: EntityKind, regex: &Regex| {
        if !enabled {
            return;
        }
        for found in regex.find_iter(text) {
            matches.push(Entity {
                start: found.start(),
                end: found.end(),
                kind,
                value: found.as_str().to_string(),
            });
        }
    };
    run(config.ssn, EntityKind::Ssn, ssn_re());
    run(config.credit_card, EntityKind::CreditCard, credit_card_re());
    run(config.email, EntityKind::Email, email_re());
    run(config.phone, EntityKind::Phone, phone_re());
    run(config.ipv4, EntityKind::Ipv4, ipv4_re());
    run(config.url, EntityKind::Url, url_re());
    run(config.filepath, EntityKind::FilePath, filepath_re());
    run(config.names, EntityKind::Name, name_re());
    for pattern in &config.custom_patterns {
        let regex =
            Regex::new(pattern).map_err(|err| EgressError::Pattern(err.to_string()))?;
        run(true, EntityKind::Custom, &regex);
    }
    for name in &config.name_list {
        if name.is_empty() {
            continue;
        }
        let escaped = regex::escape(name);
        let regex = Regex::new(&format!(r"(?i)\b{escaped}\b"))
            .map_err(|err| EgressError::Pattern(err.to_string()))?;
        run(true, EntityKind::Name, &regex);
    }

    // Overlap resolution: earlier start, longer span, stable kind order.
    matches.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| b.end.cmp(&a.end))
            .then_with(|| a.kind.cmp(&b.kind))
    });
    let mut selected: Vec<Entity> = Vec::new();
    let mut last_end = 0usize;
    for entity in matches {
        if entity.start < last_end && !selected.is_empty() {
            continue;
        }
        last_end = entity.end;
        selected.push(entity);
    }
    Ok(selected)
}
