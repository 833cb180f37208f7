//! Message classification into candidate commerce events
//!
//! Two signatures run over every message: a shipping label being created
//! (pending shipment) and the buyer's funds being transferred (completed
//! sale). Field extraction is rule based and carrier aware; the fields found
//! make up the confidence score.

use chrono::NaiveDate;
use log::debug;
use regex::Regex;
use std::sync::LazyLock;

use super::session::ProviderSession;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncResult};
use crate::gmail::normalize_message;
use crate::models::{CandidateEvent, CandidateKind, Carrier, MailMessage, MessageId};

/// A detection signature and the search used to find it without history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub kind: CandidateKind,
    pub name: &'static str,
    /// Gmail search query for the full-window fallback
    pub query: &'static str,
    /// Case-insensitive pattern matched against subject and body
    pattern: &'static str,
}

pub const SIGNATURES: [Signature; 2] = [
    Signature {
        kind: CandidateKind::PendingShipment,
        name: "shipment label created",
        query: r#"{subject:"shipping label" subject:"ready to ship" subject:bordereau}"#,
        pattern: r"(?i)(shipping label|label is ready|ready to ship|bordereau)",
    },
    Signature {
        kind: CandidateKind::CompletedTransfer,
        name: "funds transferred",
        query: r#"{subject:"funds transferred" subject:"payment transferred" subject:"money is on its way"}"#,
        pattern: r"(?i)(funds (have been |were )?(transferred|released|credited)|payment (has been |was )?(transferred|released)|money is on its way|transferred to your (balance|wallet|bank account))",
    },
];

static TRANSACTION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:order|transaction|sale)\b\s*(?:#|no\.?|number|id)?\s*[:#]?\s*([A-Z0-9][A-Z0-9-]+)")
        .expect("static regex")
});
static ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:item|article)\s*:\s*(.+?)\s*$").expect("static regex")
});
static AMOUNT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{1,6}[.,]\d{2})\s*(?:€|EUR\b|\$|USD\b|£|GBP\b)").expect("static regex")
});
static AMOUNT_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:€|\bEUR|\$|\bUSD|£|\bGBP)\s*(\d{1,6}[.,]\d{2})").expect("static regex")
});
static DEADLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ship|send|post)\s+(?:it\s+)?(?:by|before)\s*:?\s*(\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{4})")
        .expect("static regex")
});
static TRACKING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\btracking\s*(?:number|no\.?|ref(?:erence)?|code)?\s*[:#]?\s*([A-Z0-9]{8,30})\b")
        .expect("static regex")
});
static CARRIERS: LazyLock<Vec<(Carrier, Regex)>> = LazyLock::new(|| {
    [
        (Carrier::MondialRelay, r"(?i)\bmondial[\s-]?relay\b"),
        (Carrier::Colissimo, r"(?i)\bcolissimo\b"),
        (Carrier::Chronopost, r"(?i)\bchronopost\b"),
        (Carrier::RelaisColis, r"(?i)\brelais[\s-]?colis\b"),
        (Carrier::InPost, r"(?i)\binpost\b"),
        (Carrier::Dhl, r"(?i)\bdhl\b"),
        (Carrier::Ups, r"\bUPS\b"),
    ]
    .into_iter()
    .map(|(carrier, pattern)| (carrier, Regex::new(pattern).expect("static regex")))
    .collect()
});

/// Longest snippet kept on a candidate
const MAX_SNIPPET_CHARS: usize = 200;

/// Outcome of classifying one message
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Event(CandidateEvent),
    /// Not a commerce message, or too little could be extracted
    Skipped { message_id: MessageId, reason: String },
}

/// Events and skips from one batch of messages
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub events: Vec<CandidateEvent>,
    pub skipped: Vec<(MessageId, String)>,
}

/// Rule-based classifier over normalized messages
pub struct MessageClassifier {
    rules: Vec<(Signature, Regex)>,
    min_confidence: f32,
}

impl MessageClassifier {
    pub fn new(min_confidence: f32) -> Self {
        let rules = SIGNATURES
            .iter()
            .map(|sig| (*sig, Regex::new(sig.pattern).expect("static regex")))
            .collect();
        Self {
            rules,
            min_confidence,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.min_parser_confidence)
    }

    pub fn signatures(&self) -> &'static [Signature] {
        &SIGNATURES
    }

    /// Fetch and classify one message
    pub fn classify(
        &self,
        session: &ProviderSession<'_>,
        message_id: &MessageId,
    ) -> SyncResult<Classification> {
        let raw = session.get_message(message_id)?;
        let message = normalize_message(raw)?;
        Ok(self.classify_message(&message))
    }

    /// Classify a batch of messages.
    ///
    /// A message that still fails after retries is recorded as skipped so it
    /// does not sink the batch. Failures that concern the whole cycle
    /// (credentials, quota, throttling, deadline) are returned.
    pub fn classify_batch(
        &self,
        session: &ProviderSession<'_>,
        message_ids: &[MessageId],
    ) -> SyncResult<BatchResult> {
        let mut result = BatchResult::default();

        for id in message_ids {
            match self.classify(session, id) {
                Ok(Classification::Event(event)) => result.events.push(event),
                Ok(Classification::Skipped { message_id, reason }) => {
                    debug!("Skipped message {}: {}", message_id, reason);
                    result.skipped.push((message_id, reason));
                }
                Err(e) if is_per_message(e.kind()) => {
                    debug!("Failed to classify message {}: {}", id, e);
                    result.skipped.push((id.clone(), e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(result)
    }

    /// Classify an already-normalized message
    pub fn classify_message(&self, message: &MailMessage) -> Classification {
        let skip = |reason: String| Classification::Skipped {
            message_id: message.id.clone(),
            reason,
        };

        let Some(kind) = self.detect(message) else {
            return skip("no signature matched".to_string());
        };

        let text = message.searchable_text();
        let Some(transaction_id) = extract_transaction_id(&text) else {
            return skip("no transaction id".to_string());
        };

        let item = extract_item(&text);
        let amount = extract_amount(&text);
        let deadline = match kind {
            CandidateKind::PendingShipment => extract_deadline(&text),
            CandidateKind::CompletedTransfer => None,
        };
        let carrier = extract_carrier(&text, message.from.domain().as_deref());
        let tracking_ref = extract_tracking(&text);

        // Weighted in whole points so threshold comparisons are exact
        let mut points: u32 = 40;
        if item.is_some() {
            points += 20;
        }
        match kind {
            CandidateKind::PendingShipment => {
                if deadline.is_some() {
                    points += 20;
                }
                if carrier.is_known() || tracking_ref.is_some() {
                    points += 20;
                }
            }
            CandidateKind::CompletedTransfer => {
                if amount.is_some() {
                    points += 20;
                }
                // The settlement date is the message date, always known
                points += 20;
            }
        }
        let confidence = points as f32 / 100.0;

        if confidence < self.min_confidence {
            return skip(format!(
                "confidence {:.2} below {:.2}",
                confidence, self.min_confidence
            ));
        }

        Classification::Event(CandidateEvent {
            kind,
            transaction_id,
            item,
            amount,
            carrier,
            tracking_ref,
            deadline,
            message_id: message.id.clone(),
            snippet: message.snippet.chars().take(MAX_SNIPPET_CHARS).collect(),
            confidence,
            event_date: message.received_at,
        })
    }

    /// Subject matches win over body matches; earlier signatures win ties
    fn detect(&self, message: &MailMessage) -> Option<CandidateKind> {
        let body = format!("{}\n{}", message.snippet, message.body_text);
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(&message.subject))
            .or_else(|| self.rules.iter().find(|(_, re)| re.is_match(&body)))
            .map(|(sig, _)| sig.kind)
    }
}

/// Errors that concern a single message rather than the cycle.
///
/// Throttling outlasting the retries is about the mailbox, not the message:
/// skipping would let the cursor move past a message that was never read.
fn is_per_message(kind: ErrorKind) -> bool {
    match kind {
        ErrorKind::TransientProvider | ErrorKind::TransientCredential | ErrorKind::Provider => {
            true
        }
        ErrorKind::RateLimited
        | ErrorKind::ReauthorizationRequired
        | ErrorKind::CursorExpired
        | ErrorKind::QuotaExhausted
        | ErrorKind::Timeout
        | ErrorKind::Storage
        | ErrorKind::RecordNotEditable
        | ErrorKind::RecordNotFound => false,
    }
}

/// First order/transaction reference that contains a digit
fn extract_transaction_id(text: &str) -> Option<String> {
    TRANSACTION_ID
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches('-'))
        .find(|id| id.chars().any(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

fn extract_item(text: &str) -> Option<String> {
    ITEM.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|item| !item.is_empty())
}

fn extract_amount(text: &str) -> Option<f64> {
    AMOUNT_SUFFIX
        .captures(text)
        .or_else(|| AMOUNT_PREFIX.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
}

fn extract_deadline(text: &str) -> Option<NaiveDate> {
    let raw = DEADLINE.captures(text)?.get(1)?.as_str();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
}

/// Carrier named in the text, or hinted by the sender's domain
fn extract_carrier(text: &str, sender_domain: Option<&str>) -> Carrier {
    if let Some((carrier, _)) = CARRIERS.iter().find(|(_, re)| re.is_match(text)) {
        return *carrier;
    }
    let Some(domain) = sender_domain else {
        return Carrier::Unknown;
    };
    let labels: Vec<String> = domain
        .to_lowercase()
        .split('.')
        .map(|label| label.replace('-', ""))
        .collect();
    Carrier::KNOWN
        .into_iter()
        .find(|c| labels.contains(&c.as_str().replace('_', "")))
        .unwrap_or(Carrier::Unknown)
}

fn extract_tracking(text: &str) -> Option<String> {
    TRACKING
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmailAddress;
    use chrono::{TimeZone, Utc};

    fn message(subject: &str, body: &str) -> MailMessage {
        MailMessage {
            id: MessageId::new("m1"),
            from: EmailAddress::new("no-reply@shop.example"),
            subject: subject.to_string(),
            snippet: String::new(),
            body_text: body.to_string(),
            received_at: Utc.with_ymd_and_hms(2025, 1, 3, 8, 30, 0).unwrap(),
            label_ids: vec!["INBOX".into()],
        }
    }

    fn event(c: Classification) -> CandidateEvent {
        match c {
            Classification::Event(e) => e,
            Classification::Skipped { reason, .. } => panic!("skipped: {}", reason),
        }
    }

    #[test]
    fn test_pending_shipment_extraction() {
        let classifier = MessageClassifier::new(0.6);
        let msg = message(
            "Your shipping label is ready",
            "Order #X1\nItem: Blue denim jacket\nShip by: 2025-01-10\nCarrier: Mondial Relay\nTracking number: 12345678",
        );

        let e = event(classifier.classify_message(&msg));
        assert_eq!(e.kind, CandidateKind::PendingShipment);
        assert_eq!(e.transaction_id, "X1");
        assert_eq!(e.item.as_deref(), Some("Blue denim jacket"));
        assert_eq!(e.deadline, NaiveDate::from_ymd_opt(2025, 1, 10));
        assert_eq!(e.carrier, Carrier::MondialRelay);
        assert_eq!(e.tracking_ref.as_deref(), Some("12345678"));
        assert_eq!(e.confidence, 1.0);
        assert_eq!(e.event_date, msg.received_at);
    }

    #[test]
    fn test_completed_transfer_extraction() {
        let classifier = MessageClassifier::new(0.6);
        let msg = message(
            "Funds transferred to your balance",
            "The funds have been transferred for order X1.\nTotal: 42,50 €",
        );

        let e = event(classifier.classify_message(&msg));
        assert_eq!(e.kind, CandidateKind::CompletedTransfer);
        assert_eq!(e.transaction_id, "X1");
        assert_eq!(e.amount, Some(42.5));
        assert_eq!(e.carrier, Carrier::Unknown);
        assert_eq!(e.deadline, None);
    }

    #[test]
    fn test_minimal_pending_meets_default_threshold() {
        let classifier = MessageClassifier::new(0.6);
        let msg = message("Shipping label", "Order X1, please ship by 10/01/2025");
        let e = event(classifier.classify_message(&msg));
        assert_eq!(e.confidence, 0.6);
        assert_eq!(e.deadline, NaiveDate::from_ymd_opt(2025, 1, 10));
    }

    #[test]
    fn test_low_confidence_is_skipped() {
        let classifier = MessageClassifier::new(0.6);
        let msg = message("Shipping label", "Order X1");
        assert!(matches!(
            classifier.classify_message(&msg),
            Classification::Skipped { ref reason, .. } if reason.starts_with("confidence")
        ));
    }

    #[test]
    fn test_unrelated_message_is_skipped() {
        let classifier = MessageClassifier::new(0.0);
        let msg = message("Weekly newsletter", "Order now and save 20%");
        assert!(matches!(
            classifier.classify_message(&msg),
            Classification::Skipped { ref reason, .. } if reason == "no signature matched"
        ));
    }

    #[test]
    fn test_missing_transaction_id_is_skipped() {
        let classifier = MessageClassifier::new(0.0);
        let msg = message("Your shipping label", "Your order is confirmed");
        assert!(matches!(
            classifier.classify_message(&msg),
            Classification::Skipped { ref reason, .. } if reason == "no transaction id"
        ));
    }

    #[test]
    fn test_subject_match_wins() {
        let classifier = MessageClassifier::new(0.0);
        let msg = message(
            "Money is on its way",
            "Order 77 shipped earlier with the shipping label you printed",
        );
        assert_eq!(
            event(classifier.classify_message(&msg)).kind,
            CandidateKind::CompletedTransfer
        );
    }

    #[test]
    fn test_transaction_id_requires_digit() {
        assert_eq!(
            extract_transaction_id("Order confirmed. Transaction ID: TX-9981-"),
            Some("TX-9981".to_string())
        );
        assert_eq!(extract_transaction_id("Order confirmed"), None);
        assert_eq!(extract_transaction_id("wholesale 123"), None);
    }

    #[test]
    fn test_amount_formats() {
        assert_eq!(extract_amount("Total 42.50 EUR"), Some(42.5));
        assert_eq!(extract_amount("Total: €1234,00"), Some(1234.0));
        assert_eq!(extract_amount("You earned $7.99"), Some(7.99));
        assert_eq!(extract_amount("No price here"), None);
    }

    #[test]
    fn test_carrier_from_sender_domain() {
        assert_eq!(
            extract_carrier("your parcel", Some("mondialrelay.fr")),
            Carrier::MondialRelay
        );
        assert_eq!(
            extract_carrier("your parcel", Some("shop.example")),
            Carrier::Unknown
        );
        assert_eq!(extract_carrier("ships with Colissimo", None), Carrier::Colissimo);
    }

    #[test]
    fn test_only_message_failures_are_skipped() {
        assert!(is_per_message(ErrorKind::Provider));
        assert!(is_per_message(ErrorKind::TransientProvider));
        assert!(!is_per_message(ErrorKind::RateLimited));
        assert!(!is_per_message(ErrorKind::QuotaExhausted));
        assert!(!is_per_message(ErrorKind::ReauthorizationRequired));
    }
}
