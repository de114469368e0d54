//! Browser capability seam
//!
//! The orchestrator only talks to [`SignupDriver`]; the Chrome
//! implementation lives in [`crate::chrome`], tests plug in scripted
//! fakes.

use crate::error::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static JWT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").expect("valid JWT pattern")
});

/// What the signup form is filled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Token and cookies of a freshly registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionArtifacts {
    pub token: String,
    /// `name=value; name2=value2`
    pub cookie: String,
}

/// One browser session walking through the signup flow.
///
/// Every method is bounded by the driver's own timeouts.
#[async_trait]
pub trait SignupDriver: Send {
    /// Open the signup page, fill the email field and request a code.
    async fn submit_email(&mut self, credentials: &Credentials) -> Result<()>;

    /// Wait until the page shows the code field.
    async fn await_code_prompt(&mut self) -> Result<()>;

    /// Fill code and password, submit, and wait for the page to leave
    /// the signup path.
    async fn submit_code(&mut self, code: &str) -> Result<()>;

    async fn extract_session(&mut self) -> Result<SessionArtifacts>;

    /// Release the browser. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens driver sessions.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn SignupDriver>>;
}

/// Pull the session token out of a token API response body.
///
/// Prefers `Result.Token` of a JSON body and falls back to the first
/// JWT-shaped string anywhere in the text.
#[must_use]
pub fn extract_token(body: &str) -> Option<String> {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(token) = json
            .pointer("/Result/Token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
        {
            return Some(token.to_string());
        }
    }
    JWT.find(body).map(|m| m.as_str().to_string())
}

/// `name=value` pairs joined for a `Cookie` header.
#[must_use]
pub fn cookie_header<'a, I>(cookies: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    cookies
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}
