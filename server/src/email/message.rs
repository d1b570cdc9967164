use std::borrow::Cow;

use chrono::{DateTime, Utc};
use google_gmail1::api::{Message, MessagePart, MessagePartHeader};
use mail_parser::MessageParser;
use serde::Serialize;

use crate::{
    detection::patterns,
    error::{AppError, AppResult},
    util::truncate_chars,
};

/// Hard cap on MIME parts visited for a single message
const MAX_MIME_PARTS: usize = 512;
const HTML_RENDER_WIDTH: usize = 400;
/// Body prefix used by keyword gating and confirmation matching
pub const BODY_PREVIEW_CHARS: usize = 500;

/// Decoded message as seen by the detector. Never persisted.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedMessage {
    pub id: String,
    pub thread_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    pub body_text: String,
    pub body_html: String,
    pub labels: Vec<String>,
}

impl NormalizedMessage {
    /// Decode a Gmail API message. Supports FULL format (`payload`) and
    /// RAW format (`raw`, parsed as RFC 5322).
    pub fn from_gmail_message(msg: Message) -> AppResult<Self> {
        let id = msg
            .id
            .ok_or_else(|| AppError::UpstreamFetch("Message missing id".to_string()))?;
        let mut normalized = NormalizedMessage {
            thread_id: msg.thread_id.unwrap_or_default(),
            timestamp: msg.internal_date.and_then(DateTime::from_timestamp_millis),
            snippet: msg.snippet.unwrap_or_default(),
            labels: msg.label_ids.unwrap_or_default(),
            id,
            ..Default::default()
        };

        if let Some(payload) = &msg.payload {
            let headers = payload.headers.as_deref().unwrap_or_default();
            normalized.from = header(headers, "From").unwrap_or_default().to_string();
            normalized.to = header(headers, "To").unwrap_or_default().to_string();
            normalized.subject = header(headers, "Subject").unwrap_or_default().to_string();
            if normalized.timestamp.is_none() {
                normalized.timestamp = header(headers, "Date")
                    .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                    .map(|d| d.with_timezone(&Utc));
            }
            let (text, html) = collect_bodies(payload);
            normalized.body_text = text;
            normalized.body_html = html;
        } else if let Some(raw) = &msg.raw {
            normalized.apply_raw(raw)?;
        }

        Ok(normalized)
    }

    fn apply_raw(&mut self, raw: &[u8]) -> AppResult<()> {
        let parsed = MessageParser::default().parse(raw).ok_or_else(|| {
            AppError::UpstreamFetch(format!("Failed to parse MIME message {}", self.id))
        })?;

        let format_addr = |addr: &mail_parser::Addr| match addr.name() {
            Some(name) => format!("{} <{}>", name, addr.address().unwrap_or_default()),
            None => addr.address().unwrap_or_default().to_string(),
        };
        self.from = parsed
            .from()
            .and_then(|f| f.first())
            .map(format_addr)
            .unwrap_or_default();
        self.to = parsed
            .to()
            .and_then(|t| t.first())
            .map(format_addr)
            .unwrap_or_default();
        self.subject = parsed.subject().unwrap_or_default().to_string();
        if self.timestamp.is_none() {
            self.timestamp = parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0));
        }
        self.body_text = (0..)
            .map_while(|i| parsed.body_text(i))
            .collect::<Vec<_>>()
            .join("\n");
        self.body_html = (0..)
            .map_while(|i| parsed.body_html(i))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(())
    }

    /// Plain-text view: the text body, or the rendered HTML body when there is none
    pub fn text_view(&self) -> Cow<'_, str> {
        if !self.body_text.trim().is_empty() {
            Cow::Borrowed(&self.body_text)
        } else if !self.body_html.trim().is_empty() {
            Cow::Owned(html2text::from_read(self.body_html.as_bytes(), HTML_RENDER_WIDTH))
        } else {
            Cow::Borrowed("")
        }
    }

    /// Subject, snippet and the opening of the body, for cheap phrase matching
    pub fn preview_text(&self) -> String {
        let body = self.text_view();
        format!(
            "{}\n{}\n{}",
            self.subject,
            self.snippet,
            truncate_chars(&body, BODY_PREVIEW_CHARS)
        )
    }

    pub fn sender_domain(&self) -> Option<String> {
        patterns::sender_domain(&self.from)
    }
}

fn header<'a>(headers: &'a [MessagePartHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| {
            h.name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h.value.as_deref())
}

fn is_mime(part: &MessagePart, mime: &str) -> bool {
    part.mime_type
        .as_deref()
        .is_some_and(|m| m.eq_ignore_ascii_case(mime))
}

fn part_body(part: &MessagePart) -> Option<Cow<'_, str>> {
    part.body
        .as_ref()
        .and_then(|b| b.data.as_deref())
        .filter(|data| !data.is_empty())
        .map(String::from_utf8_lossy)
}

/// Concatenated (text, html) bodies. A body on the top-level payload wins;
/// otherwise every text/plain and text/html leaf is collected in document
/// order using an explicit stack.
fn collect_bodies(payload: &MessagePart) -> (String, String) {
    let mut text = String::new();
    let mut html = String::new();

    if let Some(body) = part_body(payload) {
        if is_mime(payload, "text/html") {
            html.push_str(&body);
        } else {
            text.push_str(&body);
        }
        return (text, html);
    }

    let mut stack: Vec<&MessagePart> = payload
        .parts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .rev()
        .collect();
    let mut visited = 0;

    while let Some(part) = stack.pop() {
        visited += 1;
        if visited > MAX_MIME_PARTS {
            tracing::warn!("MIME tree exceeds {} parts, truncating", MAX_MIME_PARTS);
            break;
        }

        let target = if is_mime(part, "text/plain") {
            Some(&mut text)
        } else if is_mime(part, "text/html") {
            Some(&mut html)
        } else {
            None
        };
        if let (Some(target), Some(body)) = (target, part_body(part)) {
            if !target.is_empty() {
                target.push('\n');
            }
            target.push_str(&body);
        }

        if let Some(children) = part.parts.as_deref() {
            stack.extend(children.iter().rev());
        }
    }

    (text, html)
}
