//! Catch-all mailbox client
//!
//! Polls the shared catch-all mailbox for the verification code sent to
//! one generated address. Concurrent attempts each check out their own
//! IMAP session from a small pool for the duration of a poll.

use crate::code::CodeParser;
use crate::config::ImapConfig;
use crate::connection::{self, ImapSession};
use crate::error::{Error, Result};
use crate::message::MailMessage;
use crate::orchestrator::CodeSource;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Newest messages inspected per poll.
const FETCH_LIMIT: usize = 20;
const MAX_IDLE: usize = 4;

/// Read-only IMAP client with exclusive-checkout session pooling
pub struct MailClient {
    config: ImapConfig,
    parser: CodeParser,
    subject_filter: Option<String>,
    idle: Mutex<Vec<ImapSession>>,
}

impl MailClient {
    #[must_use]
    pub fn new(config: ImapConfig, parser: CodeParser, subject_filter: Option<String>) -> Self {
        Self {
            config,
            parser,
            subject_filter,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Poll until a code addressed to `recipient` arrives or `timeout`
    /// passes.
    ///
    /// # Errors
    ///
    /// [`Error::VerificationTimeout`] when nothing arrived in time,
    /// [`Error::Connection`] when the server cannot be reached or
    /// rejects the credentials.
    pub async fn await_code(
        &self,
        recipient: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<String> {
        info!(
            "Waiting up to {}s for a code sent to {}",
            timeout.as_secs(),
            recipient
        );
        let started = Instant::now();

        let polling = async {
            let mut polls = 0u32;
            loop {
                polls += 1;
                match self.check_once(recipient).await {
                    Ok(Some(code)) => return Ok(code),
                    Ok(None) => debug!("Poll {} for {}: nothing yet", polls, recipient),
                    Err(e @ Error::Connection(_)) => return Err(e),
                    Err(e) => warn!("Poll {} for {} failed: {}", polls, recipient, e),
                }
                tokio::time::sleep(poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, polling).await {
            Ok(Ok(code)) => {
                info!(
                    "Got code for {} after {:.1}s",
                    recipient,
                    started.elapsed().as_secs_f64()
                );
                Ok(code)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::VerificationTimeout {
                recipient: recipient.to_string(),
                waited: timeout,
            }),
        }
    }

    /// Run a single poll for `recipient`.
    ///
    /// The session is returned to the pool only when the poll went
    /// through cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting, SELECT, SEARCH or FETCH fails.
    pub async fn check_once(&self, recipient: &str) -> Result<Option<String>> {
        let mut session = self.checkout().await?;
        let result = self.poll(&mut session, recipient).await;
        if result.is_ok() {
            self.release(session).await;
        }
        result
    }

    /// Log out every idle session.
    pub async fn shutdown(&self) {
        let sessions: Vec<ImapSession> = self.idle.lock().await.drain(..).collect();
        let count = sessions.len();
        for mut session in sessions {
            session.logout().await.ok();
        }
        debug!("Closed {} pooled IMAP sessions", count);
    }

    /// Number of sessions currently waiting in the pool.
    pub async fn idle_sessions(&self) -> usize {
        self.idle.lock().await.len()
    }

    // -- private helpers --

    async fn checkout(&self) -> Result<ImapSession> {
        let pooled = self.idle.lock().await.pop();
        match pooled {
            Some(session) => Ok(session),
            None => connection::connect(&self.config).await,
        }
    }

    async fn release(&self, mut session: ImapSession) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE {
            idle.push(session);
        } else {
            drop(idle);
            session.logout().await.ok();
        }
    }

    async fn poll(&self, session: &mut ImapSession, recipient: &str) -> Result<Option<String>> {
        connection::select(session, &self.config.folder).await?;

        let query = search_query(recipient, self.subject_filter.as_deref());
        let uids = session
            .uid_search(&query)
            .await
            .map_err(|e| Error::Imap(format!("Search failed: {e}")))?;

        let mut uid_list: Vec<u32> = uids.into_iter().collect();
        if uid_list.is_empty() {
            return Ok(None);
        }
        uid_list.sort_unstable();
        let recent = &uid_list[uid_list.len().saturating_sub(FETCH_LIMIT)..];
        debug!("{} candidate messages for {}", recent.len(), recipient);

        let mut messages = fetch_messages(session, recent).await?;
        messages.sort_by(|a, b| b.uid.cmp(&a.uid));

        for message in messages {
            if !message.is_addressed_to(recipient) {
                debug!(
                    "Skipping UID {}: addressed to {:?}, not {}",
                    message.uid,
                    message.recipients(),
                    recipient
                );
                continue;
            }
            if let Some(code) = self
                .parser
                .parse(&message.body)
                .or_else(|| self.parser.parse(&message.subject))
            {
                debug!("Found code in UID {} for {}", message.uid, recipient);
                return Ok(Some(code));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CodeSource for MailClient {
    async fn await_code(
        &self,
        recipient: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<String> {
        Self::await_code(self, recipient, timeout, poll_interval).await
    }
}

async fn fetch_messages(session: &mut ImapSession, uids: &[u32]) -> Result<Vec<MailMessage>> {
    let uid_set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut raw = Vec::new();
    {
        let mut stream = session
            .uid_fetch(&uid_set, "(BODY.PEEK[])")
            .await
            .map_err(|e| Error::Imap(format!("Fetch failed: {e}")))?;
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(|e| Error::Imap(format!("Fetch error: {e}")))?;
            if let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) {
                raw.push((uid, body.to_vec()));
            }
        }
    }

    let mut messages = Vec::with_capacity(raw.len());
    for (uid, body) in raw {
        match MailMessage::parse(uid, &body) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Failed to parse UID {}: {}", uid, e),
        }
    }
    Ok(messages)
}

/// Headers besides `To` a catch-all delivery may name the recipient in.
const EXTRA_RECIPIENT_HEADERS: [&str; 4] =
    ["Delivered-To", "X-Original-To", "X-Forwarded-To", "Envelope-To"];

/// Any recipient header mentioning `recipient`, optionally narrowed by
/// subject. IMAP `OR` is binary, so the keys nest:
/// `OR TO x OR CC x OR HEADER Delivered-To x ... HEADER Envelope-To x`.
fn search_query(recipient: &str, subject_filter: Option<&str>) -> String {
    let value = quote(recipient);
    let mut keys = vec![format!("TO {value}"), format!("CC {value}")];
    keys.extend(
        EXTRA_RECIPIENT_HEADERS
            .iter()
            .map(|header| format!("HEADER {header} {value}")),
    );

    let mut query = keys
        .into_iter()
        .rev()
        .reduce(|rest, key| format!("OR {key} {rest}"))
        .unwrap_or_default();
    if let Some(subject) = subject_filter {
        query.push_str(" SUBJECT ");
        query.push_str(&quote(subject));
    }
    query
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
