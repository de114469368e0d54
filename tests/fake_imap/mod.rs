//! Fake IMAP server for integration testing
//!
//! An in-process server that speaks just enough IMAP for the mail
//! client's polling loop:
//!
//! TCP -> [STARTTLS] -> TLS -> LOGIN -> (SELECT, UID SEARCH, UID FETCH)* -> LOGOUT
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, TLS modes, connection counting, dispatch
//! - `handlers/` -- one file per supported command
//! - `mailbox` -- test data model (folders, emails, builder)
//! - `io` -- shared write helpers

mod handlers;
mod server;

pub use mailbox::MailboxBuilder;
pub use server::FakeImapServer;
