//! Deduplication Gate
//!
//! Admits a candidate only if its e-mail:
//! - normalizes to a syntactically valid address
//! - is not on a blocklisted domain (or a subdomain of one)
//! - is not already in the durable corpus or in this run's working set
//!
//! Log lines carry a SHA-256 fingerprint of the address, never the address.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use url::Url;
use validator::ValidateEmail;

use crate::error::Result;
use crate::schemas::{email_domain, normalize_email, CandidateRecord, ContactRecord};
use crate::store::PersistenceSink;

/// Suffixes of asset file names that look like e-mails (`logo@2x.png`)
const ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".css", ".js"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    Missing,
    Malformed,
    Blocklisted(String),
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::Missing => "missing",
            InvalidReason::Malformed => "malformed",
            InvalidReason::Blocklisted(_) => "blocklisted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit(ContactRecord),
    RejectDuplicate,
    RejectInvalid(InvalidReason),
}

/// Computes SHA-256 hash of content
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Short log-safe fingerprint of a normalized e-mail
pub fn email_fingerprint(email: &str) -> String {
    compute_hash(email)[..16].to_string()
}

/// Normalizes a profile URL to canonical form
/// - Removes fragments (#...)
/// - Removes tracking parameters (utm_*, fbclid, etc.)
/// - Sorts query parameters
pub fn canonicalize_url(url_str: &str) -> std::result::Result<String, url::ParseError> {
    let mut url = Url::parse(url_str)?;
    url.set_fragment(None);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    url.set_query(None);
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }

    Ok(url.to_string())
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_")
        || matches!(
            key,
            "fbclid" | "gclid" | "msclkid" | "mc_cid" | "mc_eid" | "_ga" | "_gl" | "yclid" | "twclid"
        )
}

/// Domain blocklist with subdomain matching
#[derive(Debug, Clone, Default)]
pub struct DomainBlocklist {
    domains: HashSet<String>,
}

impl DomainBlocklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('@').trim_start_matches('.').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// The blocked domain that `domain` falls under, if any
    pub fn matching(&self, domain: &str) -> Option<&str> {
        let mut candidate = domain;
        loop {
            if let Some(hit) = self.domains.get(candidate) {
                return Some(hit.as_str());
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Syntactic check on a normalized address
pub fn validate_email(email: &str) -> std::result::Result<(), InvalidReason> {
    if email.is_empty() {
        return Err(InvalidReason::Missing);
    }
    if ASSET_SUFFIXES.iter().any(|s| email.ends_with(s)) || !email.validate_email() {
        return Err(InvalidReason::Malformed);
    }
    Ok(())
}

pub struct DedupGate {
    sink: Arc<dyn PersistenceSink>,
    blocklist: DomainBlocklist,
    /// E-mails admitted during this run
    seen: RwLock<HashSet<String>>,
}

impl DedupGate {
    pub fn new(sink: Arc<dyn PersistenceSink>, blocklist: DomainBlocklist) -> Self {
        Self {
            sink,
            blocklist,
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Validation and blocklist check, before any corpus lookup
    fn screen(&self, candidate: &CandidateRecord) -> std::result::Result<String, InvalidReason> {
        let email = normalize_email(&candidate.email);
        validate_email(&email)?;
        if let Some(domain) = email_domain(&email) {
            if let Some(blocked) = self.blocklist.matching(domain) {
                return Err(InvalidReason::Blocklisted(blocked.to_string()));
            }
        }
        Ok(email)
    }

    /// Checks and marks one candidate
    pub async fn admit(&self, candidate: CandidateRecord) -> Result<Admission> {
        let mut admissions = self.admit_batch(vec![candidate]).await?;
        Ok(admissions.pop().unwrap_or(Admission::RejectDuplicate))
    }

    /// Checks a page of candidates with one corpus lookup.
    ///
    /// Admitted e-mails enter the working set immediately, so repeats on
    /// the same page or a later page are duplicates.
    pub async fn admit_batch(&self, candidates: Vec<CandidateRecord>) -> Result<Vec<Admission>> {
        let screened: Vec<(CandidateRecord, std::result::Result<String, InvalidReason>)> = candidates
            .into_iter()
            .map(|c| {
                let res = self.screen(&c);
                (c, res)
            })
            .collect();

        let lookup: Vec<String> = {
            let seen = self.seen.read();
            screened
                .iter()
                .filter_map(|(_, r)| r.as_ref().ok())
                .filter(|email| !seen.contains(*email))
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };
        let existing = if lookup.is_empty() {
            HashSet::new()
        } else {
            self.sink.exists_batch(&lookup).await?
        };

        let mut seen = self.seen.write();
        let admissions = screened
            .into_iter()
            .map(|(candidate, screened)| match screened {
                Err(reason) => {
                    debug!(
                        source = %candidate.source_id,
                        reason = reason.as_str(),
                        "Rejected invalid candidate"
                    );
                    Admission::RejectInvalid(reason)
                }
                Ok(email) => {
                    if existing.contains(&email) || !seen.insert(email.clone()) {
                        debug!(
                            source = %candidate.source_id,
                            email_hash = %email_fingerprint(&email),
                            "Rejected duplicate"
                        );
                        Admission::RejectDuplicate
                    } else {
                        Admission::Admit(candidate.into_contact(email))
                    }
                }
            })
            .collect();

        Ok(admissions)
    }

    /// Number of e-mails admitted so far in this run
    pub fn seen_count(&self) -> usize {
        self.seen.read().len()
    }
}
