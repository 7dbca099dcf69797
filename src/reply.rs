//! SMTP reply parsing.
//!
//! A reply is one or more lines, each starting with a three digit status
//! code. A `-` in the fourth column marks a continuation line; anything else
//! ends the reply (RFC 5321 section 4.2).

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Code assumed when a reply does not start with three digits.
pub const MALFORMED_CODE: u16 = 450;

/// Longest line read from either side, CRLF included (RFC 5321
/// section 4.5.3.1.6).
pub const MAX_LINE: usize = 1000;

/// One complete, possibly multi-line, reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Every line of the reply, CRLF terminated.
    pub text: String,
}

impl Reply {
    /// A reply standing in for garbage received from a backend.
    pub fn malformed(text: impl Into<String>) -> Self {
        Self {
            code: MALFORMED_CODE,
            text: text.into(),
        }
    }

    /// 2xx and 3xx replies.
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// The lines of the reply without their terminators.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text.trim_end())
    }
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("read error: {0}")]
    Io(#[from] io::Error),

    #[error("unexpected EOF")]
    Eof,

    #[error("reply line too short: {0:?}")]
    ShortLine(String),

    #[error("reply line longer than {} bytes", MAX_LINE)]
    TooLong,
}

/// Strips a trailing CRLF or bare LF.
pub fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Interprets the first three bytes of `line` as a status code.
pub fn parse_code(line: &[u8]) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }

    Some(
        digits
            .iter()
            .fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')),
    )
}

/// Reads one full reply from `reader`.
///
/// The code of the last line read is returned, defaulting to
/// [`MALFORMED_CODE`] when that line does not start with digits. A reply
/// with a non-numeric code ends at that line, even if it carries a `-`.
/// At most [`MAX_LINE`] bytes are buffered per line.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, ReplyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut text = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if (&mut *reader)
            .take(MAX_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?
            == 0
        {
            return Err(ReplyError::Eof);
        }
        if line.len() >= MAX_LINE && !line.ends_with(b"\n") {
            return Err(ReplyError::TooLong);
        }

        let content = trim_eol(&line);
        if content.len() < 4 {
            return Err(ReplyError::ShortLine(
                String::from_utf8_lossy(content).into_owned(),
            ));
        }

        text.push_str(&String::from_utf8_lossy(content));
        text.push_str("\r\n");

        match parse_code(content) {
            Some(_) if content[3] == b'-' => continue,
            Some(code) => return Ok(Reply { code, text }),
            None => return Ok(Reply::malformed(text)),
        }
    }
}
