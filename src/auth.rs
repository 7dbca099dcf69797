//! AUTH LOGIN handled at the proxy and replayed to the backends as a
//! single AUTH PLAIN command (RFC 4954, RFC 4616).
//!
//! ```text
//! C: AUTH LOGIN
//! S: 334 VXNlcm5hbWU6
//! C: dGVzdA==
//! S: 334 UGFzc3dvcmQ6
//! C: c2VjcmV0
//!    -> AUTH PLAIN dGVzdAB0ZXN0AHNlY3JldA== to every backend
//! ```

use std::fmt;
use std::io;

use thiserror::Error;

use crate::client::{is_overlong, ClientConn};
use crate::reply::trim_eol;

/// Longest decoded username or password accepted.
pub const MAX_CREDENTIAL_LEN: usize = 255;

/// `334 ` + base64("Username:")
pub const USERNAME_CHALLENGE: &str = "334 VXNlcm5hbWU6\r\n";
/// `334 ` + base64("Password:")
pub const PASSWORD_CHALLENGE: &str = "334 UGFzc3dvcmQ6\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Username,
    Password,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Username => "login",
            Field::Password => "password",
        })
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("client i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("client closed the connection")]
    Eof,

    #[error("client cancelled the exchange")]
    Cancelled,

    #[error("{field} is not valid base64: {source}")]
    Decode {
        field: Field,
        source: base64::DecodeError,
    },

    #[error("{field} too long, length={len}")]
    TooLong { field: Field, len: usize },

    #[error("response line too long")]
    LineTooLong,
}

/// Decoded LOGIN credentials.
pub struct PlainCredentials {
    username: Vec<u8>,
    password: Vec<u8>,
}

impl PlainCredentials {
    pub fn decode(username_b64: &str, password_b64: &str) -> Result<Self, AuthError> {
        Ok(Self {
            username: decode_field(Field::Username, username_b64)?,
            password: decode_field(Field::Password, password_b64)?,
        })
    }

    pub fn username(&self) -> &[u8] {
        &self.username
    }

    /// `authzid \0 authcid \0 passwd` with the login as both identities.
    pub fn blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.username.len() * 2 + self.password.len() + 2);
        blob.extend_from_slice(&self.username);
        blob.push(0);
        blob.extend_from_slice(&self.username);
        blob.push(0);
        blob.extend_from_slice(&self.password);
        blob
    }

    /// The command line to forward, CRLF terminated.
    pub fn to_command(&self) -> String {
        format!("AUTH PLAIN {}\r\n", base64::encode(self.blob()))
    }
}

impl fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("username_len", &self.username.len())
            .field("password_len", &self.password.len())
            .finish()
    }
}

fn decode_field(field: Field, encoded: &str) -> Result<Vec<u8>, AuthError> {
    let decoded =
        base64::decode(encoded.trim()).map_err(|source| AuthError::Decode { field, source })?;
    if decoded.len() > MAX_CREDENTIAL_LEN {
        return Err(AuthError::TooLong {
            field,
            len: decoded.len(),
        });
    }
    Ok(decoded)
}

/// The username given on the AUTH LOGIN line itself, if any.
pub fn inline_username(line: &str) -> Option<&str> {
    let rest = line.get("AUTH LOGIN".len()..)?.trim();
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

async fn read_response(client: &mut ClientConn) -> Result<String, AuthError> {
    let mut buf = Vec::new();
    if client.read_line(&mut buf).await? == 0 {
        return Err(AuthError::Eof);
    }
    if is_overlong(&buf) {
        return Err(AuthError::LineTooLong);
    }

    let response = String::from_utf8_lossy(trim_eol(&buf)).into_owned();
    if response.trim() == "*" {
        return Err(AuthError::Cancelled);
    }
    Ok(response)
}

/// Runs the LOGIN exchange with the client. The caller forwards
/// [`PlainCredentials::to_command`]; nothing is sent to the client on failure.
pub async fn login_to_plain(
    client: &mut ClientConn,
    line: &str,
) -> Result<PlainCredentials, AuthError> {
    let username = match inline_username(line) {
        Some(username) => username.to_string(),
        None => {
            client.send(USERNAME_CHALLENGE).await?;
            read_response(client).await?
        }
    };

    client.send(PASSWORD_CHALLENGE).await?;
    let password = read_response(client).await?;

    PlainCredentials::decode(&username, &password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Logger;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn plain_blob(command: &str) -> Vec<u8> {
        let encoded = command
            .strip_prefix("AUTH PLAIN ")
            .unwrap()
            .trim_end_matches("\r\n");
        base64::decode(encoded).unwrap()
    }

    #[test]
    fn builds_plain_blob() {
        let creds = PlainCredentials::decode("dGVzdA==", "c2VjcmV0").unwrap();
        assert_eq!(creds.username(), b"test");
        assert_eq!(creds.blob(), b"test\0test\0secret");
        assert_eq!(plain_blob(&creds.to_command()), b"test\0test\0secret");
        assert_eq!(creds.to_command(), "AUTH PLAIN dGVzdAB0ZXN0AHNlY3JldA==\r\n");
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(matches!(
            PlainCredentials::decode("not base64!", "c2VjcmV0"),
            Err(AuthError::Decode {
                field: Field::Username,
                ..
            })
        ));
        assert!(matches!(
            PlainCredentials::decode("dGVzdA==", "%%%"),
            Err(AuthError::Decode {
                field: Field::Password,
                ..
            })
        ));
    }

    #[test]
    fn enforces_length_cap() {
        let at_cap = base64::encode(vec![b'a'; MAX_CREDENTIAL_LEN]);
        let over_cap = base64::encode(vec![b'a'; MAX_CREDENTIAL_LEN + 1]);

        assert!(PlainCredentials::decode(&at_cap, &at_cap).is_ok());
        assert!(matches!(
            PlainCredentials::decode(&over_cap, "c2VjcmV0"),
            Err(AuthError::TooLong {
                field: Field::Username,
                len: 256
            })
        ));
        assert!(matches!(
            PlainCredentials::decode("dGVzdA==", &over_cap),
            Err(AuthError::TooLong {
                field: Field::Password,
                ..
            })
        ));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let creds = PlainCredentials::decode("dGVzdA==", "c2VjcmV0").unwrap();
        let shown = format!("{:?}", creds);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("password_len: 6"));
    }

    #[test]
    fn inline_usernames() {
        assert_eq!(inline_username("AUTH LOGIN"), None);
        assert_eq!(inline_username("AUTH LOGIN   "), None);
        assert_eq!(inline_username("auth login dGVzdA=="), Some("dGVzdA=="));
    }

    fn client(stream: tokio::io::DuplexStream) -> ClientConn {
        let logger = Arc::new(Logger::new(None, false, 0).unwrap());
        ClientConn::new(stream, Duration::from_secs(5), "t", logger)
    }

    #[tokio::test]
    async fn solicits_username_and_password() {
        let (ours, theirs) = duplex(1024);
        let mut conn = client(ours);
        let mut peer = BufReader::new(theirs);

        let dialogue = tokio::spawn(async move {
            let mut line = String::new();
            peer.read_line(&mut line).await.unwrap();
            assert_eq!(line, USERNAME_CHALLENGE);
            peer.get_mut().write_all(b"dGVzdA==\r\n").await.unwrap();

            line.clear();
            peer.read_line(&mut line).await.unwrap();
            assert_eq!(line, PASSWORD_CHALLENGE);
            peer.get_mut().write_all(b"c2VjcmV0\r\n").await.unwrap();
            peer
        });

        let creds = login_to_plain(&mut conn, "AUTH LOGIN").await.unwrap();
        assert_eq!(creds.blob(), b"test\0test\0secret");
        dialogue.await.unwrap();
    }

    #[tokio::test]
    async fn inline_username_skips_first_challenge() {
        let (ours, theirs) = duplex(1024);
        let mut conn = client(ours);
        let mut peer = BufReader::new(theirs);

        let dialogue = tokio::spawn(async move {
            let mut line = String::new();
            peer.read_line(&mut line).await.unwrap();
            assert_eq!(line, PASSWORD_CHALLENGE);
            peer.get_mut().write_all(b"c2VjcmV0\r\n").await.unwrap();
            peer
        });

        let creds = login_to_plain(&mut conn, "AUTH LOGIN dGVzdA==").await.unwrap();
        assert_eq!(creds.blob(), b"test\0test\0secret");
        dialogue.await.unwrap();
    }

    #[tokio::test]
    async fn client_cancel_aborts() {
        let (ours, mut theirs) = duplex(1024);
        let mut conn = client(ours);
        theirs.write_all(b"*\r\n").await.unwrap();

        assert!(matches!(
            login_to_plain(&mut conn, "AUTH LOGIN dGVzdA==").await,
            Err(AuthError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn endless_response_line_aborts() {
        let (ours, mut theirs) = duplex(16 * 1024);
        let mut conn = client(ours);
        theirs.write_all(&[b'A'; 4096]).await.unwrap();

        assert!(matches!(
            login_to_plain(&mut conn, "AUTH LOGIN dGVzdA==").await,
            Err(AuthError::LineTooLong)
        ));
    }

    #[tokio::test]
    async fn hang_up_aborts() {
        let (ours, theirs) = duplex(1024);
        let mut conn = client(ours);
        drop(theirs);

        assert!(matches!(
            login_to_plain(&mut conn, "AUTH LOGIN").await,
            Err(AuthError::Eof) | Err(AuthError::Io(_))
        ));
    }
}
