//! Configuration loaded from the environment
//!
//! Everything is read through a lookup function so callers (and tests)
//! can supply values without touching the process environment.
//! [`Settings::from_env`] wires the lookup to `.env` + `std::env`.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_IMAP_SERVER: &str = "imap.gmail.com";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_SIGNUP_URL: &str = "https://www.trae.ai/sign-up";
const DEFAULT_TOKEN_MARKER: &str = "GetUserToken";
const DEFAULT_ACCOUNTS_DIR: &str = "accounts";

pub const MIN_CODE_LENGTH: usize = 4;
pub const MAX_CODE_LENGTH: usize = 8;

/// How the IMAP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapSecurity {
    /// TLS from the first byte (port 993).
    Tls,
    /// Plain connection upgraded with STARTTLS (port 143, bridges).
    StartTls,
}

/// IMAP connection configuration
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub security: ImapSecurity,
    /// Skip certificate verification (self-signed bridges, test servers).
    pub accept_invalid_certs: bool,
    pub folder: String,
}

/// CSS selectors and button labels for the signup page.
#[derive(Debug, Clone)]
pub struct Selectors {
    pub email_input: String,
    pub code_input: String,
    pub password_input: String,
    pub error_message: String,
    pub send_code_text: String,
    pub signup_text: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            email_input: r#"input[type="email"], input[name="email"], input[placeholder*="mail" i]"#
                .to_string(),
            code_input: r#"input[name="code"], input[placeholder*="code" i], input[autocomplete="one-time-code"]"#
                .to_string(),
            password_input: r#"input[type="password"]"#.to_string(),
            error_message: ".error-message".to_string(),
            send_code_text: "Send Code".to_string(),
            signup_text: "Sign Up".to_string(),
        }
    }
}

/// Browser session options.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub signup_url: String,
    /// Substring of the API response URL that carries the session token.
    pub token_response_match: String,
    pub token_capture_retries: u32,
    pub navigation_timeout: Duration,
    pub element_timeout: Duration,
    pub selectors: Selectors,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            chrome_path: None,
            signup_url: DEFAULT_SIGNUP_URL.to_string(),
            token_response_match: DEFAULT_TOKEN_MARKER.to_string(),
            token_capture_retries: 3,
            navigation_timeout: Duration::from_millis(20_000),
            element_timeout: Duration::from_millis(10_000),
            selectors: Selectors::default(),
        }
    }
}

/// Everything a registration run needs.
#[derive(Debug, Clone)]
pub struct Settings {
    pub imap: ImapConfig,
    pub domains: Vec<String>,
    pub code_length: usize,
    pub subject_filter: Option<String>,
    pub local_part_length: usize,
    pub password_length: usize,
    pub email_wait_timeout: Duration,
    pub email_poll_interval: Duration,
    pub browser: BrowserOptions,
    pub accounts_dir: PathBuf,
    pub retry: RetryPolicy,
    pub log_level: String,
}

impl Settings {
    /// Load settings from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `EMAIL_USER`
    /// - `EMAIL_PASS`
    /// - `CUSTOM_DOMAIN` (comma separated)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let missing: Vec<&str> = ["EMAIL_USER", "EMAIL_PASS", "CUSTOM_DOMAIN"]
            .into_iter()
            .filter(|key| var(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "Missing required configuration: {}",
                missing.join(", ")
            )));
        }

        let port = match var("IMAP_PORT") {
            None => DEFAULT_IMAP_PORT,
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "Invalid IMAP_PORT '{raw}': must be a number between 1 and 65535"
                    ))
                })?,
        };

        let security = match var("IMAP_SECURITY").as_deref().map(str::to_ascii_lowercase) {
            None => ImapSecurity::Tls,
            Some(s) if s == "tls" || s == "ssl" => ImapSecurity::Tls,
            Some(s) if s == "starttls" => ImapSecurity::StartTls,
            Some(other) => {
                return Err(Error::Config(format!(
                    "Invalid IMAP_SECURITY '{other}': expected 'tls' or 'starttls'"
                )));
            }
        };

        let domains = parse_domains(&var("CUSTOM_DOMAIN").unwrap_or_default())?;

        let code_length = env_usize(&var, "VERIFICATION_CODE_LENGTH", 6);
        if !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&code_length) {
            return Err(Error::Config(format!(
                "Invalid VERIFICATION_CODE_LENGTH {code_length}: must be between \
                 {MIN_CODE_LENGTH} and {MAX_CODE_LENGTH}"
            )));
        }

        let defaults = BrowserOptions::default();
        let default_selectors = defaults.selectors;
        let selectors = Selectors {
            email_input: var("EMAIL_SELECTOR").unwrap_or(default_selectors.email_input),
            code_input: var("CODE_SELECTOR").unwrap_or(default_selectors.code_input),
            password_input: var("PASSWORD_SELECTOR").unwrap_or(default_selectors.password_input),
            error_message: var("ERROR_SELECTOR").unwrap_or(default_selectors.error_message),
            send_code_text: var("SEND_CODE_TEXT").unwrap_or(default_selectors.send_code_text),
            signup_text: var("SIGNUP_TEXT").unwrap_or(default_selectors.signup_text),
        };

        let browser = BrowserOptions {
            headless: env_bool(&var, "HEADLESS", false),
            chrome_path: var("CHROME_PATH").map(PathBuf::from),
            signup_url: match var("SIGNUP_URL") {
                Some(raw) => parse_signup_url(raw)?,
                None => defaults.signup_url,
            },
            token_response_match: var("TOKEN_RESPONSE_MATCH")
                .unwrap_or(defaults.token_response_match),
            token_capture_retries: env_u64(&var, "TOKEN_CAPTURE_RETRIES", 3)
                .try_into()
                .unwrap_or(u32::MAX),
            navigation_timeout: Duration::from_millis(
                env_u64(&var, "NAVIGATION_TIMEOUT_MS", 20_000).max(1_000),
            ),
            element_timeout: Duration::from_millis(
                env_u64(&var, "ELEMENT_TIMEOUT_MS", 10_000).max(1_000),
            ),
            selectors,
        };

        let retry = RetryPolicy::new(
            env_u64(&var, "NAVIGATION_RETRIES", 1)
                .try_into()
                .unwrap_or(u32::MAX),
            Duration::from_millis(env_u64(&var, "RETRY_BACKOFF_MS", 2_000)),
        );

        Ok(Self {
            imap: ImapConfig {
                host: var("IMAP_SERVER").unwrap_or_else(|| DEFAULT_IMAP_SERVER.to_string()),
                port,
                username: var("EMAIL_USER").unwrap_or_default(),
                password: var("EMAIL_PASS").unwrap_or_default(),
                security,
                accept_invalid_certs: env_bool(&var, "IMAP_ACCEPT_INVALID_CERTS", false),
                folder: var("IMAP_FOLDER").unwrap_or_else(|| "INBOX".to_string()),
            },
            domains,
            code_length,
            subject_filter: var("MAIL_SUBJECT_FILTER"),
            local_part_length: env_usize(&var, "LOCAL_PART_LENGTH", 10).max(8),
            password_length: env_usize(&var, "PASSWORD_LENGTH", 12).max(8),
            email_wait_timeout: Duration::from_secs(
                env_u64(&var, "EMAIL_WAIT_TIMEOUT_S", 60).max(10),
            ),
            email_poll_interval: Duration::from_secs(
                env_u64(&var, "EMAIL_POLL_INTERVAL_S", 5).max(1),
            ),
            browser,
            accounts_dir: accounts_dir_from(&var),
            retry,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Directory holding one JSON file per account (`ACCOUNTS_DIR`).
///
/// Needed on its own by `merge-accounts`, which must work without
/// mailbox credentials.
#[must_use]
pub fn accounts_dir_from_env() -> PathBuf {
    dotenvy::dotenv().ok();
    accounts_dir_from(&|key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty()))
}

/// Default tracing filter (`LOG_LEVEL`, else `info`).
#[must_use]
pub fn log_level_from_env() -> String {
    dotenvy::dotenv().ok();
    env::var("LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn accounts_dir_from(var: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    var("ACCOUNTS_DIR").map_or_else(|| PathBuf::from(DEFAULT_ACCOUNTS_DIR), PathBuf::from)
}

/// Split and validate a comma separated domain list.
fn parse_domains(raw: &str) -> Result<Vec<String>> {
    let domains: Vec<String> = raw
        .split(',')
        .map(|d| d.trim().trim_start_matches('@').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .collect();

    if domains.is_empty() {
        return Err(Error::Config(
            "Invalid CUSTOM_DOMAIN: no valid domains found".into(),
        ));
    }

    for domain in &domains {
        if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
            return Err(Error::Config(format!(
                "Invalid CUSTOM_DOMAIN '{domain}': expected something like 'example.com'"
            )));
        }
        if domain.contains(|c: char| c.is_whitespace() || c == '@') {
            return Err(Error::Config(format!(
                "Invalid CUSTOM_DOMAIN '{domain}': contains whitespace or '@'"
            )));
        }
    }

    Ok(domains)
}

/// The signup page is left once the browser's path no longer starts
/// with this one, so a bare origin can never be left.
fn parse_signup_url(raw: String) -> Result<String> {
    if !raw.contains("://") {
        return Err(Error::Config(format!(
            "Invalid SIGNUP_URL '{raw}': expected an absolute URL"
        )));
    }
    if url_path(&raw).trim_end_matches('/').is_empty() {
        return Err(Error::Config(format!(
            "Invalid SIGNUP_URL '{raw}': must include the signup page path, like /sign-up"
        )));
    }
    Ok(raw)
}

/// Path component of an absolute URL, `/` when there is none.
pub(crate) fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = rest.find('/').map_or("/", |i| &rest[i..]);
    path.split(['?', '#']).next().unwrap_or(path)
}

fn env_bool(var: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match var(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "y" | "on") => true,
        Some("0" | "false" | "no" | "n" | "off") => false,
        _ => default,
    }
}

fn env_u64(var: &dyn Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(var: &dyn Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
