//! Wire protocol between the pool and a worker
//!
//! Newline-delimited JSON over the worker's stdin (manager → worker) and
//! stdout (worker → manager). Anything on stdout that is not a protocol
//! message (plain text, binary noise, lines over the length cap) is logged
//! and skipped, so a chatty bot library cannot wedge the exchange.
//!
//! ```text
//! manager                         worker
//!   | -- load {identity, definition} -->|
//!   | <------------- ready ------------ |
//!   | -- question {seq, text} --------> |
//!   | <------ answer {seq, text} ------ |
//!   | -- shutdown --------------------> |
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::types::{BotIdentity, Result};

/// Messages sent by the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    /// First message on a fresh worker: the bot it should become
    Load {
        identity: BotIdentity,
        #[serde(with = "base64_bytes")]
        definition: Vec<u8>,
    },
    Question {
        seq: u64,
        text: String,
    },
    Shutdown,
}

/// Messages sent by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready,
    Answer {
        seq: u64,
        text: String,
    },
    /// `seq` names the question that failed; without it the worker itself is unusable
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        error: String,
    },
}

/// Base64 encoding for binary payloads
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(&s)
            .map_err(|e| serde::de::Error::custom(format!("base64 decode error: {e}")))
    }
}

/// Write one message as a single line and flush
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Longest line accepted from a peer; longer ones are dropped unread
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Line reader yielding protocol messages
pub struct MessageReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::new(),
            max_line: MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line: usize) -> Self {
        self.max_line = max_line.max(1);
        self
    }

    /// Next decodable message, or `None` once the stream is closed
    pub async fn next<M: DeserializeOwned>(&mut self) -> Result<Option<M>> {
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(self.max_line as u64)
                .read_until(b'\n', &mut self.line)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if read == self.max_line && self.line.last() != Some(&b'\n') {
                let dropped = self.skip_rest_of_line().await? + read;
                debug!(dropped, "Skipping oversized worker line");
                continue;
            }

            let trimmed = self.line.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_slice::<M>(trimmed) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => debug!(line = %String::from_utf8_lossy(trimmed), ?e, "Skipping non-protocol line"),
            }
        }
    }

    /// Discard input up to and including the next newline
    async fn skip_rest_of_line(&mut self) -> Result<usize> {
        let mut skipped = 0;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(skipped);
            }
            let (consumed, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            self.reader.consume(consumed);
            skipped += consumed;
            if done {
                return Ok(skipped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_wire_format() {
        let json = serde_json::to_string(&ManagerMessage::Question {
            seq: 3,
            text: "hi".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"question","seq":3,"text":"hi"}"#);
    }

    #[test]
    fn test_load_encodes_definition_as_base64() {
        let json = serde_json::to_string(&ManagerMessage::Load {
            identity: "b1".into(),
            definition: b"D1".to_vec(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"load","identity":"b1","definition":"RDE="}"#);
    }

    #[test]
    fn test_failed_without_seq() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"type":"failed","error":"bad model"}"#).unwrap();
        assert_eq!(
            msg,
            WorkerMessage::Failed {
                seq: None,
                error: "bad model".into()
            }
        );
    }

    #[tokio::test]
    async fn test_reader_skips_noise() {
        let input: &[u8] = b"loading model...\n\n{\"type\":\"ready\"}\n{\"type\":\"answer\",\"seq\":1,\"text\":\"hello\"}\n";
        let mut reader = MessageReader::new(input);

        assert_eq!(reader.next::<WorkerMessage>().await.unwrap(), Some(WorkerMessage::Ready));
        assert_eq!(
            reader.next::<WorkerMessage>().await.unwrap(),
            Some(WorkerMessage::Answer {
                seq: 1,
                text: "hello".into()
            })
        );
        assert_eq!(reader.next::<WorkerMessage>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_skips_binary_output() {
        let input: &[u8] = b"\xff\xfe binary noise\n\x00\x9f\n{\"type\":\"ready\"}\n";
        let mut reader = MessageReader::new(input);

        assert_eq!(reader.next::<WorkerMessage>().await.unwrap(), Some(WorkerMessage::Ready));
        assert_eq!(reader.next::<WorkerMessage>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_drops_oversized_lines() {
        let mut input = vec![b'x'; 100];
        input.extend_from_slice(b"\n{\"type\":\"ready\"}\n");
        input.extend(std::iter::repeat(b'y').take(40));
        let mut reader = MessageReader::new(input.as_slice()).with_max_line_bytes(32);

        assert_eq!(reader.next::<WorkerMessage>().await.unwrap(), Some(WorkerMessage::Ready));
        // Unterminated tail longer than the cap is dropped, then the stream ends
        assert_eq!(reader.next::<WorkerMessage>().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_message_appends_newline() {
        let mut out = Vec::new();
        write_message(&mut out, &WorkerMessage::Ready).await.unwrap();
        assert_eq!(out, b"{\"type\":\"ready\"}\n");
    }
}
