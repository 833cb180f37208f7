//! Gmail API response normalization
//!
//! Converts Gmail API messages to [`MailMessage`], the classifier's input.

use base64::prelude::*;
use chrono::{TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

use super::api::{GmailMessage, MessagePart, MessagePayload};
use crate::error::{SyncError, SyncResult};
use crate::models::{EmailAddress, MailMessage, MessageId};

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)\b[^>]*>.*?</(script|style|head)\s*>")
        .expect("static regex")
});
static BLOCK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<\s*(br|/p|/div|/tr|/li|/h[1-6]|/table)\b[^>]*>").expect("static regex")
});
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("static regex"));
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("static regex"));

/// Normalize a Gmail API message to a [`MailMessage`]
///
/// # Errors
/// Returns `Provider` if the message came back without a payload, which
/// happens when it was requested with the wrong format.
pub fn normalize_message(gmail_msg: GmailMessage) -> SyncResult<MailMessage> {
    let id = MessageId::new(&gmail_msg.id);

    let payload = gmail_msg
        .payload
        .as_ref()
        .ok_or_else(|| SyncError::Provider {
            message: format!("message {} has no payload", id),
        })?;

    let from = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.invalid"));

    let subject = extract_header(payload, "Subject").unwrap_or_default();

    // internalDate is milliseconds since epoch
    let internal_date: i64 = gmail_msg.internal_date.parse().unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    // Prefer the plain text part; fall back to stripped HTML
    let body_text = extract_plain_text_body(payload)
        .or_else(|| extract_html_body(payload).map(|html| html_to_text(&html)))
        .unwrap_or_default();

    let snippet = decode_html_entities(&gmail_msg.snippet);

    Ok(MailMessage {
        id,
        from,
        subject,
        snippet,
        body_text,
        received_at,
        label_ids: gmail_msg.label_ids.unwrap_or_default(),
    })
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

fn is_mime(mime_type: &Option<String>, prefix: &str) -> bool {
    mime_type.as_ref().is_some_and(|m| m.starts_with(prefix))
}

/// Extract plain text body from message payload
fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && is_mime(&payload.mime_type, "text/plain")
    {
        return decode_base64_body(data);
    }

    payload
        .parts
        .as_deref()
        .and_then(|parts| find_part(parts, "text/plain"))
}

/// Extract HTML body from message payload
fn extract_html_body(payload: &MessagePayload) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && is_mime(&payload.mime_type, "text/html")
    {
        return decode_base64_body(data);
    }

    payload
        .parts
        .as_deref()
        .and_then(|parts| find_part(parts, "text/html"))
}

/// Depth-first search of message parts for the first body of `mime_prefix`
fn find_part(parts: &[MessagePart], mime_prefix: &str) -> Option<String> {
    for part in parts {
        if is_mime(&part.mime_type, mime_prefix)
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        if let Some(nested) = &part.parts
            && let Some(text) = find_part(nested, mime_prefix)
        {
            return Some(text);
        }
    }

    None
}

/// Decode base64-encoded body data
///
/// Gmail uses URL-safe base64 but padding can vary, so we try multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    decoders
        .iter()
        .filter_map(|decoder| decoder.decode(data).ok())
        .find_map(|bytes| String::from_utf8(bytes).ok())
}

/// Decode the HTML entities Gmail leaves in snippets and bodies
fn decode_html_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&euro;", "€")
        .replace("&amp;", "&")
}

/// Reduce an HTML body to readable text, keeping line structure so
/// line-anchored patterns still match
fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, "");
    let text = BLOCK_TAG.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = decode_html_entities(&text);
    let text = SPACES.replace_all(&text, " ");
    let text = BLANK_LINES.replace_all(&text, "\n");

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
