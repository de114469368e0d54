//! Fetched mail messages and recipient matching

use crate::error::{Error, Result};
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};

/// Headers that may carry the address a catch-all message was sent to.
const RECIPIENT_HEADERS: [&str; 6] = [
    "To",
    "Cc",
    "Delivered-To",
    "X-Original-To",
    "X-Forwarded-To",
    "Envelope-To",
];

/// A message as far as code extraction cares about it.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub uid: u32,
    pub subject: String,
    recipients: Vec<String>,
    /// Plain text part, or the HTML part when there is no plain one.
    pub body: String,
}

impl MailMessage {
    /// Parse a raw RFC 5322 message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the MIME structure is unreadable.
    pub fn parse(uid: u32, raw: &[u8]) -> Result<Self> {
        let mail = mailparse::parse_mail(raw)
            .map_err(|e| Error::Parse(format!("UID {uid}: {e}")))?;

        let subject = mail.headers.get_first_value("Subject").unwrap_or_default();

        let mut recipients = Vec::new();
        for header in RECIPIENT_HEADERS {
            for value in mail.headers.get_all_values(header) {
                recipients.extend(addresses(&value));
            }
        }

        let body = find_part(&mail, "text/plain")
            .or_else(|| find_part(&mail, "text/html"))
            .unwrap_or_default();

        Ok(Self {
            uid,
            subject,
            recipients,
            body,
        })
    }

    /// Addresses from every recipient header, lowercased.
    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Exact, case-insensitive match on the full address. Substrings
    /// and other addresses on the same domain never match.
    #[must_use]
    pub fn is_addressed_to(&self, address: &str) -> bool {
        let wanted = address.trim().to_ascii_lowercase();
        self.recipients.iter().any(|r| *r == wanted)
    }
}

/// Every address in a header value, lowercased.
fn addresses(value: &str) -> Vec<String> {
    match mailparse::addrparse(value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![info.addr.to_ascii_lowercase()],
                MailAddr::Group(group) => group
                    .addrs
                    .iter()
                    .map(|info| info.addr.to_ascii_lowercase())
                    .collect(),
            })
            .collect(),
        // Some relays write bare or bracketed lists addrparse rejects.
        Err(_) => value
            .split(',')
            .filter_map(|part| {
                let part = part.trim();
                let inner = match (part.rfind('<'), part.rfind('>')) {
                    (Some(open), Some(close)) if open < close => &part[open + 1..close],
                    _ => part,
                };
                let inner = inner.trim();
                inner
                    .contains('@')
                    .then(|| inner.to_ascii_lowercase())
            })
            .collect(),
    }
}

fn find_part(mail: &ParsedMail<'_>, mimetype: &str) -> Option<String> {
    if mail.subparts.is_empty() {
        let is_attachment =
            mail.get_content_disposition().disposition == DispositionType::Attachment;
        if !is_attachment && mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return mail.get_body().ok();
        }
        return None;
    }
    mail.subparts.iter().find_map(|part| find_part(part, mimetype))
}
