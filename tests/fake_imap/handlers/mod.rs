//! IMAP command handlers for the fake server.
//!
//! Each handler lives in its own module and processes a single IMAP
//! command (LOGIN, LOGOUT, SELECT, UID SEARCH, UID FETCH). Anything
//! else gets a `BAD` from the dispatcher.

mod logout;
mod uid_search;

pub use login::handle_login;
pub use logout::handle_logout;
pub use select::handle_select;
pub use uid_fetch::handle_uid_fetch;
pub use uid_search::handle_uid_search;
