//! Scripted account signup with catch-all mail verification
//!
//! Generates throwaway addresses on a catch-all domain, drives a
//! browser through a signup form, reads the verification code from
//! the catch-all mailbox over IMAP and stores the resulting session.
//!
//! The pieces are usable on their own: [`MailClient`] polls for the
//! code sent to one exact address, [`CodeParser`] pulls codes out of
//! mail bodies, [`AccountStore`] persists and merges records, and
//! [`Orchestrator`] runs bounded-concurrency batches over any
//! [`DriverFactory`] and [`CodeSource`].

mod address;
pub mod chrome;
mod client;
mod code;
pub mod config;
mod connection;
mod driver;
mod error;
mod message;
mod orchestrator;
mod retry;
pub mod store;

pub use address::{AddressGenerator, generate_password};
pub use chrome::ChromeDriverFactory;
pub use client::MailClient;
pub use code::{CodeCandidate, CodeFormat, CodeParser};
pub use config::{BrowserOptions, ImapConfig, ImapSecurity, Selectors, Settings};
pub use driver::{
    Credentials, DriverFactory, SessionArtifacts, SignupDriver, cookie_header, extract_token,
};
pub use error::{Error, FailureKind, Result};
pub use message::MailMessage;
pub use orchestrator::{AttemptReport, AttemptStatus, BatchReport, CodeSource, Orchestrator};
pub use retry::RetryPolicy;
pub use store::{AccountRecord, AccountStore, MergeReport};
