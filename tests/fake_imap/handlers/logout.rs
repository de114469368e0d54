//! LOGOUT command handler.
//!
//! The mail client logs out every pooled session on shutdown. The
//! server answers with an untagged BYE, then the tagged OK, and the
//! dispatcher closes the connection.

use crate::fake_imap::io::write_line;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn handle_logout<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    stream: &mut BufReader<S>,
) {
    let lines = [
        "* BYE Fake server logging out\r\n".to_string(),
        format!("{tag} OK LOGOUT completed\r\n"),
    ];
    for line in &lines {
        if write_line(stream, line).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::io::{pipe, received};

    #[tokio::test]
    async fn bye_precedes_tagged_ok() {
        let (client, mut stream) = pipe();
        handle_logout("A0009", &mut stream).await;
        drop(stream);
        let output = received(client).await;

        assert_eq!(
            output,
            "* BYE Fake server logging out\r\nA0009 OK LOGOUT completed\r\n"
        );
    }
}
