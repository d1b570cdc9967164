//! Pattern Library
//!
//! Stateless recognizers shared by the detector, the cancellation engine and
//! the confirmation monitor. Every function here is pure and deterministic.

use std::str::FromStr;

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;

use crate::model::candidate::Cadence;

/// Amount with optional thousands separators and optional cents
const AMOUNT: &str = r"(\d{1,3}(?:,\d{3})+(?:\.\d{2})?|\d+(?:\.\d{2})?)";
/// Amount that must carry cents, used where the anchor is a bare keyword
const AMOUNT_WITH_CENTS: &str = r"(\d{1,3}(?:,\d{3})+\.\d{2}|\d+\.\d{2})";

const MONTHS: &str = "jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec";

pub const UNKNOWN_SERVICE: &str = "Unknown Service";

pub const SUBSCRIPTION_KEYWORDS: [&str; 23] = [
    "subscription",
    "subscribe",
    "subscribed",
    "billing",
    "billed",
    "renew",
    "renewal",
    "payment",
    "paid",
    "invoice",
    "receipt",
    "membership",
    "member",
    "auto-pay",
    "recurring",
    "monthly charge",
    "annual fee",
    "plan",
    "premium",
    "upgrade",
    "downgrade",
    "cancel",
    "unsubscribe",
];

/// Display names, most specific first so "amazon prime" wins over "amazon"
const KNOWN_SERVICES: [(&str, &str); 24] = [
    ("amazon prime", "Amazon Prime"),
    ("youtube", "YouTube"),
    ("disney", "Disney"),
    ("netflix", "Netflix"),
    ("spotify", "Spotify"),
    ("hulu", "Hulu"),
    ("hbo max", "HBO Max"),
    ("paramount", "Paramount"),
    ("peacock", "Peacock"),
    ("apple tv", "Apple TV"),
    ("dropbox", "Dropbox"),
    ("adobe", "Adobe"),
    ("microsoft", "Microsoft"),
    ("github", "GitHub"),
    ("slack", "Slack"),
    ("zoom", "Zoom"),
    ("notion", "Notion"),
    ("canva", "Canva"),
    ("linkedin", "LinkedIn"),
    ("audible", "Audible"),
    ("peloton", "Peloton"),
    ("duolingo", "Duolingo"),
    ("google", "Google"),
    ("apple", "Apple"),
];

const SERVICE_CATEGORIES: [(&str, &[&str]); 8] = [
    (
        "Streaming",
        &[
            "netflix", "hulu", "disney", "hbo", "amazon prime", "apple tv", "paramount",
            "peacock", "youtube", "spotify", "apple music", "tidal", "deezer", "pandora",
        ],
    ),
    (
        "SaaS",
        &[
            "dropbox", "google one", "icloud", "onedrive", "adobe", "microsoft", "office",
            "canva", "figma", "notion", "slack", "zoom", "github",
        ],
    ),
    (
        "News",
        &[
            "new york times", "nytimes", "washington post", "wsj", "wall street journal",
            "economist", "medium", "substack",
        ],
    ),
    (
        "Fitness",
        &[
            "peloton", "strava", "myfitnesspal", "fitbit", "headspace", "calm", "noom", "gym",
        ],
    ),
    (
        "Gaming",
        &["xbox", "playstation", "nintendo", "steam", "ea play", "ubisoft"],
    ),
    (
        "Productivity",
        &[
            "evernote", "todoist", "trello", "asana", "grammarly", "1password", "lastpass",
            "nordvpn", "expressvpn",
        ],
    ),
    (
        "Shopping",
        &["amazon", "costco", "walmart", "instacart", "doordash", "uber eats"],
    ),
    (
        "Education",
        &["coursera", "udemy", "skillshare", "masterclass", "duolingo", "linkedin learning"],
    ),
];

const TIER_SUFFIXES: [&str; 8] = [
    "premium",
    "plus",
    "pro",
    "basic",
    "free",
    "trial",
    "individual",
    "family",
];

/// Phrases in a cancellation response page that mean the request took effect
const SUCCESS_PHRASES: [&str; 9] = [
    "successfully unsubscribed",
    "unsubscribe successful",
    "you have been unsubscribed",
    "you've been unsubscribed",
    "subscription cancelled",
    "subscription canceled",
    "successfully cancelled",
    "successfully canceled",
    "cancellation confirmed",
];

/// Second-level labels that sit under a two-letter country code
const SECOND_LEVEL_LABELS: [&str; 7] = ["co", "com", "org", "net", "ac", "gov", "edu"];

fn compile(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("Invalid pattern {p}: {e}")))
        .collect()
}

lazy_static! {
    static ref PRICE_PATTERNS: Vec<Regex> = compile(&[
        format!(r"\$\s?{AMOUNT}"),
        format!(r"(?i)\bUSD\s?{AMOUNT}"),
        format!(r"(?i){AMOUNT}\s?USD\b"),
        format!(r"€\s?{AMOUNT}"),
        format!(r"(?i)\bEUR\s?{AMOUNT}"),
        format!(r"(?i){AMOUNT}\s?EUR\b"),
        format!(r"£\s?{AMOUNT}"),
        format!(r"(?i)\bGBP\s?{AMOUNT}"),
        format!(r"(?i){AMOUNT}\s?GBP\b"),
        format!(r"(?i)\b(?:price|amount|total|charged)\s*:?\s*{AMOUNT_WITH_CENTS}"),
    ]);
    static ref RE_USD: Regex = Regex::new(r"(?i)\bUSD\b").unwrap();
    static ref RE_EUR: Regex = Regex::new(r"(?i)\bEUR\b").unwrap();
    static ref RE_GBP: Regex = Regex::new(r"(?i)\bGBP\b").unwrap();
    static ref CADENCE_PATTERNS: Vec<(Cadence, Vec<Regex>)> = vec![
        (
            Cadence::Monthly,
            compile(&[
                r"(?i)\bper\s+month\b".to_string(),
                r"(?i)/\s?mo(?:nth)?\b".to_string(),
                r"(?i)\bmonthly\b".to_string(),
                r"(?i)\bevery\s+month\b".to_string(),
                r"(?i)\ba\s+month\b".to_string(),
            ]),
        ),
        (
            Cadence::Annually,
            compile(&[
                r"(?i)\bper\s+year\b".to_string(),
                r"(?i)/\s?(?:yr|year)\b".to_string(),
                r"(?i)\bannual(?:ly)?\b".to_string(),
                r"(?i)\byearly\b".to_string(),
                r"(?i)\bevery\s+year\b".to_string(),
                r"(?i)\ba\s+year\b".to_string(),
            ]),
        ),
        (
            Cadence::Quarterly,
            compile(&[
                r"(?i)\bquarter(?:ly)?\b".to_string(),
                r"(?i)\bevery\s+(?:3|three)\s+months\b".to_string(),
                r"(?i)\bper\s+quarter\b".to_string(),
            ]),
        ),
        (
            Cadence::OneTime,
            compile(&[
                r"(?i)\bone[- ]time\b".to_string(),
                r"(?i)\bsingle\s+payment\b".to_string(),
                r"(?i)\blifetime\s+(?:access|license)\b".to_string(),
            ]),
        ),
    ];
    static ref RE_ISO_DATE: Regex = Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap();
    static ref RE_SLASH_DATE: Regex = Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap();
    static ref RE_DASH_DATE: Regex = Regex::new(r"\b(\d{1,2})-(\d{1,2})-(\d{4})\b").unwrap();
    static ref RE_MONTH_FIRST_DATE: Regex = Regex::new(&format!(
        r"(?i)\b({MONTHS})[a-z]*\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"
    ))
    .unwrap();
    static ref RE_DAY_FIRST_DATE: Regex = Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({MONTHS})[a-z]*\.?,?\s+(\d{{4}})\b"
    ))
    .unwrap();
    static ref CANCELLATION_LINK_PATTERNS: Vec<Regex> = compile(&[
        r#"(?i)https?://[^\s<>"']+/(?:unsubscribe|cancel|opt-out|optout|manage|unsub|stop)[^\s<>"']*"#.to_string(),
        r#"(?i)https?://[^\s<>"']+\?[^\s<>"']*(?:unsubscribe|cancel|unsub)[^\s<>"']*"#.to_string(),
        r#"(?i)https?://[^\s<>"']+/account/(?:cancel|manage|settings)[^\s<>"']*"#.to_string(),
        r#"(?i)https?://[^\s<>"']+/subscriptions?/(?:cancel|manage)[^\s<>"']*"#.to_string(),
    ]);
    static ref RE_MANAGEMENT_LINK: Regex = Regex::new(
        r#"(?i)https?://[^\s<>"']+/(?:account|billing|membership|settings|manage)[^\s<>"']*"#
    )
    .unwrap();
    static ref CONFIRMATION_PATTERNS: Vec<Regex> = compile(&[
        r"(?i)subscription\s+(?:has\s+been\s+)?cancell?ed".to_string(),
        r"(?i)successfully\s+unsubscribed".to_string(),
        r"(?i)membership\s+(?:has\s+)?(?:been\s+)?ended".to_string(),
        r"(?i)(?:no\s+longer|not)\s+(?:subscribed|active)".to_string(),
        r"(?i)cancellation\s+(?:is\s+|has\s+been\s+)?confirmed".to_string(),
        r"(?i)subscription\s+(?:has\s+been\s+)?terminated".to_string(),
        r"(?i)account\s+(?:has\s+been\s+)?closed".to_string(),
        r"(?i)auto[- ]renew(?:al)?\s+(?:has\s+been\s+)?(?:disabled|turned\s+off|cancell?ed)".to_string(),
        r"(?i)you(?:'ve|\s+have)\s+been\s+unsubscribed".to_string(),
    ]);
    static ref PAYMENT_LAST4_PATTERNS: Vec<Regex> = compile(&[
        r"(?i)(?:card|visa|mastercard|amex|discover)\s+ending\s+(?:in\s+)?(\d{4})\b".to_string(),
        r"\*{4}\s*(\d{4})\b".to_string(),
        r"(?i)\bx{4}\s*(\d{4})\b".to_string(),
        r"•{4}\s*(\d{4})\b".to_string(),
    ]);
    static ref RE_CAPITALIZED_WORD: Regex = Regex::new(r"\b[A-Z][a-z]+\b").unwrap();
    static ref RE_ANGLE_ADDRESS: Regex = Regex::new(r"<([^<>\s@]+@[^<>\s@]+)>").unwrap();
    static ref RE_BARE_ADDRESS: Regex =
        Regex::new(r"([A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,})").unwrap();
}

// ============================================================================
// Price and currency
// ============================================================================

/// First positive amount found, trying anchors in priority order
pub fn extract_price(text: &str) -> Option<Decimal> {
    PRICE_PATTERNS.iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| Decimal::from_str(&m.as_str().replace(',', "")).ok())
            .find(|amount| *amount > Decimal::ZERO)
    })
}

pub fn infer_currency(text: &str) -> &'static str {
    if text.contains('$') || RE_USD.is_match(text) {
        "USD"
    } else if text.contains('€') || RE_EUR.is_match(text) {
        "EUR"
    } else if text.contains('£') || RE_GBP.is_match(text) {
        "GBP"
    } else {
        "USD"
    }
}

pub fn infer_cadence(text: &str) -> Option<Cadence> {
    CADENCE_PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(text)))
        .map(|(cadence, _)| *cadence)
}

// ============================================================================
// Dates
// ============================================================================

/// First date-shaped substring, in pattern priority order. Not validated.
pub fn extract_date(text: &str) -> Option<&str> {
    [
        &*RE_ISO_DATE,
        &*RE_SLASH_DATE,
        &*RE_DASH_DATE,
        &*RE_MONTH_FIRST_DATE,
        &*RE_DAY_FIRST_DATE,
    ]
    .iter()
    .find_map(|re| re.find(text).map(|m| m.as_str()))
}

fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    MONTHS
        .split('|')
        .position(|m| m == prefix)
        .map(|i| i as u32 + 1)
}

/// Calendar date for a string produced by `extract_date`; `None` when the
/// string does not name a real day
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let num = |caps: &regex::Captures, i: usize| -> Option<u32> { caps.get(i)?.as_str().parse().ok() };
    let ymd = |y: u32, m: u32, d: u32| NaiveDate::from_ymd_opt(y as i32, m, d);

    if let Some(caps) = RE_ISO_DATE.captures(raw) {
        return ymd(num(&caps, 1)?, num(&caps, 2)?, num(&caps, 3)?);
    }
    if let Some(caps) = RE_SLASH_DATE.captures(raw) {
        return ymd(num(&caps, 3)?, num(&caps, 1)?, num(&caps, 2)?);
    }
    if let Some(caps) = RE_DASH_DATE.captures(raw) {
        return ymd(num(&caps, 3)?, num(&caps, 1)?, num(&caps, 2)?);
    }
    if let Some(caps) = RE_MONTH_FIRST_DATE.captures(raw) {
        return ymd(
            num(&caps, 3)?,
            month_number(caps.get(1)?.as_str())?,
            num(&caps, 2)?,
        );
    }
    if let Some(caps) = RE_DAY_FIRST_DATE.captures(raw) {
        return ymd(
            num(&caps, 3)?,
            month_number(caps.get(2)?.as_str())?,
            num(&caps, 1)?,
        );
    }
    None
}

// ============================================================================
// Links
// ============================================================================

fn trim_link(link: &str) -> String {
    link.trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']'])
        .to_string()
}

pub fn extract_cancellation_link(text: &str) -> Option<String> {
    CANCELLATION_LINK_PATTERNS
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| trim_link(m.as_str()))
}

pub fn extract_management_link(text: &str) -> Option<String> {
    RE_MANAGEMENT_LINK.find(text).map(|m| trim_link(m.as_str()))
}

// ============================================================================
// Phrase sets
// ============================================================================

/// Distinct subscription keywords present in `text`
pub fn keyword_hits(text: &str) -> usize {
    let lower = text.to_lowercase();
    SUBSCRIPTION_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count()
}

/// Inbox receipt language confirming a cancellation took effect
pub fn matches_confirmation(text: &str) -> bool {
    CONFIRMATION_PATTERNS.iter().any(|re| re.is_match(text))
}

/// Response-page language after submitting a cancellation
pub fn matches_success_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    SUCCESS_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

pub fn extract_payment_last4(text: &str) -> Option<String> {
    PAYMENT_LAST4_PATTERNS
        .iter()
        .find_map(|re| re.captures(text)?.get(1))
        .map(|m| m.as_str().to_string())
}

// ============================================================================
// Service names
// ============================================================================

/// Known service mentioned in `subject`, as a display name
pub fn known_service_in(subject: &str) -> Option<&'static str> {
    let lower = subject.to_lowercase();
    KNOWN_SERVICES
        .iter()
        .find(|(needle, _)| {
            lower.match_indices(needle).any(|(idx, _)| {
                let before = lower[..idx].chars().next_back();
                let after = lower[idx + needle.len()..].chars().next();
                !before.is_some_and(char::is_alphanumeric)
                    && !after.is_some_and(char::is_alphanumeric)
            })
        })
        .map(|(_, display)| *display)
}

/// First capitalized word in the opening 200 characters of `text`
pub fn first_capitalized_word(text: &str) -> Option<String> {
    let head = crate::util::truncate_chars(text, 200);
    RE_CAPITALIZED_WORD
        .find(head)
        .map(|m| m.as_str().to_string())
}

fn capitalize_word(word: &str) -> String {
    if word.chars().any(|c| c.is_uppercase()) {
        return word.to_string();
    }
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(capitalize_word)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip trailing plan-tier words and tidy casing: "netflix premium" -> "Netflix"
pub fn normalize_service_name(raw: &str) -> String {
    let mut words: Vec<&str> = raw.split_whitespace().collect();
    while words.len() > 1 {
        let last = words[words.len() - 1]
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        if TIER_SUFFIXES.contains(&last.as_str()) {
            words.pop();
        } else {
            break;
        }
    }
    title_case(&words.join(" "))
}

/// Registry dedup key for a service name
pub fn service_key(raw: &str) -> String {
    normalize_service_name(raw).to_lowercase()
}

pub fn service_category(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    SERVICE_CATEGORIES
        .iter()
        .find(|(_, services)| services.iter().any(|s| lower.contains(s)))
        .map(|(category, _)| *category)
        .unwrap_or("Other")
}

// ============================================================================
// Senders and domains
// ============================================================================

/// Mailbox address from a header value like `Netflix <info@mailer.netflix.com>`
pub fn sender_address(from: &str) -> Option<String> {
    RE_ANGLE_ADDRESS
        .captures(from)
        .or_else(|| RE_BARE_ADDRESS.captures(from))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

pub fn sender_domain(from: &str) -> Option<String> {
    let address = sender_address(from)?;
    let (_, domain) = address.rsplit_once('@')?;
    let domain = domain.trim_end_matches('.');
    (!domain.is_empty()).then(|| domain.to_string())
}

/// Registrable part of a host: `mailer.netflix.com` -> `netflix.com`,
/// `mail.bbc.co.uk` -> `bbc.co.uk`
pub fn base_domain(domain: &str) -> String {
    let lower = domain.trim_end_matches('.').to_lowercase();
    let labels: Vec<&str> = lower.split('.').filter(|l| !l.is_empty()).collect();
    let n = labels.len();
    let keep = if n >= 3 && labels[n - 1].len() == 2 && SECOND_LEVEL_LABELS.contains(&labels[n - 2])
    {
        3
    } else {
        2
    };
    labels[n.saturating_sub(keep)..].join(".")
}

/// Brand label of a domain: `mailer.netflix.com` -> `netflix`
pub fn domain_brand(domain: &str) -> Option<String> {
    base_domain(domain)
        .split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}
