//! Contact Schema
//!
//! The unit of value produced by a harvest, plus the not-yet-admitted
//! candidate shape the extractor hands to the dedup gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contact admitted into the corpus.
///
/// `email` is the corpus-wide unique key and is always stored normalized
/// (see [`normalize_email`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub source_id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company_or_firm: String,
    #[serde(default)]
    pub source_ref: String,
    pub discovered_at: DateTime<Utc>,
    /// Set by the downstream campaign sender once the contact was mailed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

impl ContactRecord {
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }
}

/// Raw record produced by the extractor, pending validation and dedup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub source_id: String,
    /// Raw e-mail text as found on the page (may be empty)
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company_or_firm: String,
    pub source_ref: String,
    /// Page the candidate was extracted from
    pub page_url: String,
}

impl CandidateRecord {
    /// Promotes the candidate to a contact with an already-normalized e-mail
    pub fn into_contact(self, email: String) -> ContactRecord {
        ContactRecord {
            source_id: self.source_id,
            email,
            first_name: self.first_name.trim().to_string(),
            last_name: self.last_name.trim().to_string(),
            company_or_firm: collapse_whitespace(&self.company_or_firm),
            source_ref: self.source_ref,
            discovered_at: Utc::now(),
            sent_at: None,
        }
    }
}

/// Normalizes an e-mail address for use as the corpus key.
///
/// Strips a `mailto:` prefix and any `?subject=...` suffix, trims
/// surrounding whitespace and punctuation, and lowercases.
pub fn normalize_email(raw: &str) -> String {
    let mut email = raw.trim();
    if email.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("mailto:")) {
        email = &email[7..];
    }
    if let Some(idx) = email.find('?') {
        email = &email[..idx];
    }
    email
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"' | '\'' | ',' | ';' | '.'))
        .to_lowercase()
}

/// Returns the domain part of a normalized e-mail
pub fn email_domain(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
