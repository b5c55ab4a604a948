//! RouterOS API wire format
//!
//! A sentence is a sequence of length-prefixed words closed by an empty word.
//! Requests are a command path followed by `=attr=value` and `?query=value` words.
//! Replies are sentences whose first word is one of `!re`, `!done`, `!trap` or
//! `!fatal`. The protocol carries no request ids: a reply belongs to whichever
//! request was written before it.

use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, RouterError};

/// Largest word accepted from a router
pub const MAX_WORD_LEN: usize = 1 << 20;

/// Request builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    words: Vec<String>,
}

impl Command {
    /// Start a command, e.g. `/ppp/secret/set`
    pub fn new(path: &str) -> Self {
        Self {
            words: vec![path.to_string()],
        }
    }

    /// Add an `=key=value` attribute word
    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.words.push(format!("={}={}", key, value));
        self
    }

    /// Add a `?key=value` query word
    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.words.push(format!("?{}={}", key, value));
        self
    }

    /// Command path (first word)
    pub fn path(&self) -> &str {
        &self.words[0]
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

/// Attribute map of a reply sentence
pub type Attributes = BTreeMap<String, String>;

/// Reply sentence type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Re,
    Done,
    Trap,
    Fatal,
    /// Newer firmware announces a print with no rows before its `!done`
    Empty,
}

/// One parsed reply sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub attributes: Attributes,
    /// Free text following `!fatal`
    pub message: Option<String>,
}

impl Reply {
    /// Parse the raw words of a reply sentence
    pub fn parse(words: Vec<String>) -> Result<Self> {
        let mut iter = words.into_iter();
        let head = iter
            .next()
            .ok_or_else(|| RouterError::Malformed("empty reply sentence".into()))?;
        let kind = match head.as_str() {
            "!re" => ReplyKind::Re,
            "!done" => ReplyKind::Done,
            "!trap" => ReplyKind::Trap,
            "!fatal" => ReplyKind::Fatal,
            "!empty" => ReplyKind::Empty,
            other => return Err(RouterError::Malformed(format!("unexpected reply word {:?}", other))),
        };

        let mut attributes = Attributes::new();
        let mut message = None;
        for word in iter {
            if let Some(rest) = word.strip_prefix('=') {
                // key may be empty-valued: "=comment="
                match rest.split_once('=') {
                    Some((key, value)) => {
                        attributes.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        attributes.insert(rest.to_string(), String::new());
                    }
                }
            } else if word.starts_with(".tag=") {
                continue;
            } else if kind == ReplyKind::Fatal {
                message = Some(word);
            }
        }

        Ok(Self {
            kind,
            attributes,
            message,
        })
    }
}

/// Outcome of a completed command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// `!re` rows
    pub rows: Vec<Attributes>,
    /// Attributes carried by `!done` (e.g. `ret`)
    pub done: Attributes,
}

/// Append the variable-length prefix for a word of `len` bytes
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    let l = len as u32;
    if len < 0x80 {
        out.push(l as u8);
    } else if len < 0x4000 {
        out.extend_from_slice(&(l | 0x8000).to_be_bytes()[2..]);
    } else if len < 0x20_0000 {
        out.extend_from_slice(&(l | 0xC0_0000).to_be_bytes()[1..]);
    } else if len < 0x1000_0000 {
        out.extend_from_slice(&(l | 0xE000_0000).to_be_bytes());
    } else {
        out.push(0xF0);
        out.extend_from_slice(&l.to_be_bytes());
    }
}

/// Encode a full sentence including its terminating empty word
pub fn encode_sentence<S: AsRef<str>>(words: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for word in words {
        let bytes = word.as_ref().as_bytes();
        encode_length(bytes.len(), &mut out);
        out.extend_from_slice(bytes);
    }
    out.push(0);
    out
}

/// Read one word length prefix
pub async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize> {
    let first = reader.read_u8().await?;
    let (extra, mut len) = match first {
        b if b & 0x80 == 0x00 => (0, b as usize),
        b if b & 0xC0 == 0x80 => (1, (b & 0x3F) as usize),
        b if b & 0xE0 == 0xC0 => (2, (b & 0x1F) as usize),
        b if b & 0xF0 == 0xE0 => (3, (b & 0x0F) as usize),
        0xF0 => (4, 0),
        b => return Err(RouterError::Malformed(format!("reserved length byte {:#04x}", b))),
    };
    for _ in 0..extra {
        len = (len << 8) | reader.read_u8().await? as usize;
    }
    Ok(len)
}

/// Read one sentence as raw words
pub async fn read_sentence<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<String>> {
    let mut words = Vec::new();
    loop {
        let len = read_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LEN {
            return Err(RouterError::Malformed(format!("word of {} bytes exceeds limit", len)));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        let word = String::from_utf8(buf)
            .map_err(|e| RouterError::Malformed(format!("non UTF-8 word: {}", e)))?;
        words.push(word);
    }
}

/// Write one sentence and flush
pub async fn write_sentence<W, S>(writer: &mut W, words: &[S]) -> Result<()>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    writer.write_all(&encode_sentence(words)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read reply sentences until the command completes.
///
/// A `!trap` is remembered and returned as an error once the trailing `!done`
/// arrives, so the stream stays aligned for the next command.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Response> {
    let mut response = Response::default();
    let mut trap: Option<Attributes> = None;

    loop {
        let reply = Reply::parse(read_sentence(reader).await?)?;
        match reply.kind {
            ReplyKind::Re => response.rows.push(reply.attributes),
            ReplyKind::Empty => {}
            ReplyKind::Trap => {
                // only the first trap of a command is reported
                if trap.is_none() {
                    trap = Some(reply.attributes);
                }
            }
            ReplyKind::Fatal => {
                return Err(RouterError::Fatal(reply.message.unwrap_or_default()));
            }
            ReplyKind::Done => {
                if let Some(attrs) = trap {
                    return Err(RouterError::Trap {
                        message: attrs.get("message").cloned().unwrap_or_default(),
                        category: attrs.get("category").and_then(|c| c.parse().ok()),
                    });
                }
                response.done = reply.attributes;
                return Ok(response);
            }
        }
    }
}
