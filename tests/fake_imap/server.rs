//! In-process fake IMAP server for integration testing
//!
//! # How the catch-all poll looks on the wire
//!
//! IMAP (RFC 3501) is a text protocol. The mail client only needs a
//! read-only slice of it:
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   (implicit TLS: handshake right away)
//!   (STARTTLS: plain greeting, STARTTLS, then the handshake)
//!       |
//!   Server greeting: "* OK IMAP4rev1 ready\r\n"
//!       |
//!   A0001 LOGIN user pass
//!       |
//!   A0002 SELECT INBOX
//!   A0003 UID SEARCH TO "abc@example.com"
//!   A0004 UID FETCH 7,3 BODY.PEEK[]
//!       |   (repeated for every poll on the same session)
//!   A0009 LOGOUT
//! ```
//!
//! Every command starts with a **tag** the client chooses; the server
//! echoes it in the final `OK`/`NO`/`BAD` line. Lines starting with `*`
//! are untagged data sent before that final line.
//!
//! Message bodies come back as counted literals (`{bytecount}\r\n`
//! followed by exactly that many bytes), which is how async-imap knows
//! where a raw message ends.

use super::handlers::{
    handle_login, handle_logout, handle_select, handle_uid_fetch, handle_uid_search,
};
use super::io::write_line;
use super::mailbox::Mailbox;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

const GREETING: &str = "* OK IMAP4rev1 Fake server ready\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    StartTls,
    ImplicitTls,
}

/// A fake IMAP server on localhost with an OS-assigned port.
///
/// A self-signed certificate is generated at startup with `rcgen`, so
/// clients must run with certificate verification disabled. The
/// mailbox stays shared with the test, which can [`deliver`] messages
/// while a client is polling.
///
/// [`deliver`]: FakeImapServer::deliver
pub struct FakeImapServer {
    port: u16,
    mailbox: Arc<Mutex<Mailbox>>,
    connections: Arc<AtomicUsize>,
    /// Handle to the accept loop so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a server that expects STARTTLS before anything else.
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Mode::StartTls).await
    }

    /// Start a server that speaks TLS from the first byte (port 993
    /// style).
    pub async fn start_implicit_tls(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Mode::ImplicitTls).await
    }

    async fn spawn(mailbox: Mailbox, mode: Mode) -> Self {
        // Several tests may race to install the provider; losing the
        // race is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let mailbox = Arc::new(Mutex::new(mailbox));
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = {
            let mailbox = mailbox.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _addr)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let acceptor = acceptor.clone();
                    let mailbox = mailbox.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, mode, acceptor, &mailbox).await;
                    });
                }
            })
        };

        Self {
            port,
            mailbox,
            connections,
            _handle: handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Drop a new message into `folder`; the next SELECT sees it.
    pub fn deliver(&self, folder: &str, uid: u32, raw: &[u8]) {
        self.mailbox.lock().unwrap().deliver(folder, uid, raw);
    }
}

/// Bring one connection up to an encrypted stream, then run the
/// command loop on it.
async fn handle_connection(
    stream: TcpStream,
    mode: Mode,
    acceptor: TlsAcceptor,
    mailbox: &Mutex<Mailbox>,
) {
    match mode {
        Mode::ImplicitTls => {
            let Ok(tls_stream) = acceptor.accept(stream).await else {
                return;
            };
            let mut reader = BufReader::new(tls_stream);
            if write_line(&mut reader, GREETING).await.is_err() {
                return;
            }
            handle_imap_session(reader, mailbox).await;
        }
        Mode::StartTls => {
            let Some(tcp) = negotiate_starttls(stream).await else {
                return;
            };
            let Ok(tls_stream) = acceptor.accept(tcp).await else {
                return;
            };
            handle_imap_session(BufReader::new(tls_stream), mailbox).await;
        }
    }
}

/// Plain-text phase: greet, wait for STARTTLS, agree to it. Returns the
/// raw socket ready for the handshake.
async fn negotiate_starttls(stream: TcpStream) -> Option<TcpStream> {
    let mut reader = BufReader::new(stream);
    write_line(&mut reader, GREETING).await.ok()?;

    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;

    let (tag, command) = line.trim().split_once(' ')?;
    if !command.eq_ignore_ascii_case("STARTTLS") {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(&mut reader, &resp).await;
        return None;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    write_line(&mut reader, &resp).await.ok()?;
    Some(reader.into_inner())
}

/// Extract the folder name from a parsed `imap_types::Mailbox`.
fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Command loop over an encrypted stream.
///
/// Each line is parsed with `imap-codec`'s `CommandCodec`; handlers get
/// a snapshot of the mailbox taken under the lock, so a delivery that
/// happens mid-command shows up on the next one.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    mailbox: &Mutex<Mailbox>,
) {
    let mut selected_folder: Option<String> = None;
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();
        let snap = mailbox.lock().unwrap().clone();

        match command.body {
            CommandBody::Login { .. } => {
                if !handle_login(tag, snap.reject_login, &mut reader).await {
                    break;
                }
            }
            CommandBody::Select { mailbox: mb, .. } => {
                let name = mailbox_name(&mb);
                selected_folder = handle_select(tag, &name, &snap, &mut reader).await;
            }
            CommandBody::Search {
                criteria,
                uid: true,
                ..
            } => {
                handle_uid_search(
                    tag,
                    criteria.as_ref(),
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Fetch {
                sequence_set,
                uid: true,
                ..
            } => {
                handle_uid_fetch(
                    tag,
                    &sequence_set,
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unsupported command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
