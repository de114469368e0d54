//! UID SEARCH command handler.
//!
//! Matches emails against parsed `SearchKey` criteria from imap-types.
//! We support:
//!
//! - `All` -- returns every UID in the selected folder
//! - `Unseen` / `Seen` -- flag-based filtering
//! - `To(s)` / `Cc(s)` / `Subject(s)` / `Header(name, s)` --
//!   case-insensitive substring match on the header, which is what real
//!   servers do (so `TO "bob@x.io"` also matches `alice.bob@x.io`)
//! - `And`, `Or`, `Not` -- logical combinators
//!
//! The response format (RFC 3501 Section 7.2.5):
//!
//! ```text
//! * SEARCH 1 2 3
//! A0003 OK SEARCH completed
//! ```

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::{Mailbox, TestEmail};
use imap_codec::imap_types::core::AString;
use imap_codec::imap_types::search::SearchKey;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle the UID SEARCH command. Returns matching UIDs from the
/// selected folder.
pub async fn handle_uid_search<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    criteria: &[SearchKey<'_>],
    mailbox: &Mailbox,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder_name) = selected_folder else {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let Some(folder) = mailbox.get_folder(folder_name) else {
        let resp = format!("{tag} BAD Folder not found\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    let uids: Vec<u32> = folder
        .emails
        .iter()
        .filter(|e| criteria.iter().all(|key| matches_key(e, key)))
        .map(|e| e.uid)
        .collect();

    // "* SEARCH 1 2 3", or a bare "* SEARCH" for no hits.
    let search_line: String = uids
        .iter()
        .fold("* SEARCH".to_string(), |line, uid| format!("{line} {uid}"))
        + "\r\n";
    let _ = write_line(stream, &search_line).await;
    let resp = format!("{tag} OK SEARCH completed\r\n");
    let _ = write_line(stream, &resp).await;
}

/// Check if a test email matches a single `SearchKey`.
fn matches_key(email: &TestEmail, key: &SearchKey<'_>) -> bool {
    match key {
        SearchKey::All => true,
        SearchKey::Unseen => !email.seen,
        SearchKey::Seen => email.seen,
        SearchKey::To(needle) => header_contains(email, "To", needle),
        SearchKey::Cc(needle) => header_contains(email, "Cc", needle),
        SearchKey::Header(name, needle) => {
            let name: &[u8] = name.as_ref();
            header_contains(email, &String::from_utf8_lossy(name), needle)
        }
        SearchKey::Subject(needle) => header_contains(email, "Subject", needle),
        SearchKey::And(keys) => keys.as_ref().iter().all(|k| matches_key(email, k)),
        SearchKey::Or(a, b) => matches_key(email, a) || matches_key(email, b),
        SearchKey::Not(k) => !matches_key(email, k),
        // Fallback: return all for unsupported criteria.
        _ => true,
    }
}

fn header_contains(email: &TestEmail, header: &str, needle: &AString<'_>) -> bool {
    let bytes: &[u8] = needle.as_ref();
    let needle = String::from_utf8_lossy(bytes).to_lowercase();
    email
        .header_values(header)
        .iter()
        .any(|value| value.to_lowercase().contains(&needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::io::{pipe, received};
    use crate::fake_imap::mailbox::MailboxBuilder;

    fn raw(to: &str, subject: &str) -> Vec<u8> {
        format!("From: a@b.com\r\nTo: {to}\r\nSubject: {subject}\r\n\r\nBody")
            .into_bytes()
    }

    fn astring(s: &str) -> AString<'static> {
        AString::try_from(s.to_string()).unwrap()
    }

    fn inbox() -> Mailbox {
        MailboxBuilder::new()
            .folder("INBOX")
            .email(1, true, &raw("Bob@Example.com", "Your code"))
            .email(2, false, &raw("alice.bob@example.com", "Newsletter"))
            .email(5, false, &raw("carol@example.com", "Your code"))
            .build()
    }

    async fn search(
        criteria: &[SearchKey<'_>],
        mailbox: &Mailbox,
        selected: Option<&str>,
    ) -> String {
        let (client, mut stream) = pipe();
        handle_uid_search("A1", criteria, mailbox, selected, &mut stream).await;
        drop(stream);
        received(client).await
    }

    /// The untagged SEARCH line for `criteria` against INBOX.
    async fn hits(criteria: &[SearchKey<'_>]) -> String {
        let output = search(criteria, &inbox(), Some("INBOX")).await;
        assert!(output.ends_with("A1 OK SEARCH completed\r\n"));
        output.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn all_and_flag_keys() {
        assert_eq!(hits(&[SearchKey::All]).await, "* SEARCH 1 2 5");
        assert_eq!(hits(&[SearchKey::Unseen]).await, "* SEARCH 2 5");
        assert_eq!(hits(&[SearchKey::Seen]).await, "* SEARCH 1");
    }

    #[tokio::test]
    async fn to_is_a_case_insensitive_substring_match() {
        let to = SearchKey::To(astring("bob@example.com"));
        assert_eq!(hits(&[to]).await, "* SEARCH 1 2");
    }

    #[tokio::test]
    async fn keys_combine_with_and() {
        let criteria = [
            SearchKey::To(astring("bob@example.com")),
            SearchKey::Subject(astring("CODE")),
        ];
        assert_eq!(hits(&criteria).await, "* SEARCH 1");
    }

    #[tokio::test]
    async fn or_and_not() {
        let either = SearchKey::Or(
            Box::new(SearchKey::To(astring("carol@"))),
            Box::new(SearchKey::Subject(astring("newsletter"))),
        );
        assert_eq!(hits(&[either]).await, "* SEARCH 2 5");

        let not_code = SearchKey::Not(Box::new(SearchKey::Subject(astring("code"))));
        assert_eq!(hits(&[not_code]).await, "* SEARCH 2");
    }

    #[tokio::test]
    async fn cc_and_named_headers() {
        let mailbox = MailboxBuilder::new()
            .folder("INBOX")
            .email(
                3,
                false,
                b"To: all@example.com\r\nDelivered-To: Dave@example.com\r\n\r\nBody",
            )
            .email(4, false, b"To: all@example.com\r\nCc: erin@example.com\r\n\r\nBody")
            .build();
        let first_line = |output: String| output.lines().next().unwrap_or_default().to_string();

        let delivered = SearchKey::Header(astring("delivered-to"), astring("dave@example.com"));
        assert_eq!(
            first_line(search(&[delivered], &mailbox, Some("INBOX")).await),
            "* SEARCH 3"
        );

        let cc = SearchKey::Cc(astring("erin@"));
        assert_eq!(
            first_line(search(&[cc], &mailbox, Some("INBOX")).await),
            "* SEARCH 4"
        );

        let to = SearchKey::To(astring("dave@example.com"));
        assert_eq!(
            first_line(search(&[to], &mailbox, Some("INBOX")).await),
            "* SEARCH"
        );
    }

    #[tokio::test]
    async fn no_hits_sends_bare_search_line() {
        let to = SearchKey::To(astring("nobody@example.com"));
        assert_eq!(hits(&[to]).await, "* SEARCH");
    }

    #[tokio::test]
    async fn requires_an_existing_selected_folder() {
        let mailbox = inbox();
        assert_eq!(
            search(&[SearchKey::All], &mailbox, None).await,
            "A1 BAD No folder selected\r\n"
        );
        assert_eq!(
            search(&[SearchKey::All], &mailbox, Some("Gone")).await,
            "A1 BAD Folder not found\r\n"
        );
    }
}
