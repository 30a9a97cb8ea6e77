//! Coordinator/worker wire protocol
//!
//! Newline-delimited JSON. Every request carries an `id` echoed by its reply,
//! so one connection can have several requests in flight.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::models::TestResult;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Registration refused: {0}")]
    Refused(String),

    #[error("Unexpected message: {0}")]
    Unexpected(String),

    #[error("Connection closed")]
    Closed,
}

/// Worker to coordinator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Register { passkey: String, capacity: usize },
    RequestUnit,
    /// Has this `build_once` fixture been built?
    BuildQuery { resource: String },
    ReportBuild {
        resource: String,
        #[serde(default)]
        reference: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    ReportResult { result: TestResult },
    Complete { unit: u64 },
    /// Sent once a worker has no slot left running. Answered only after
    /// every unit of the run is done, so fixtures built by this worker stay
    /// up while other workers may still use them.
    AwaitRunEnd,
}

/// Coordinator to worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Registered,
    Refused { reason: String },
    Assign { unit: u64, uid: String },
    NoMoreWork,
    AlreadyBuilt { reference: Option<String> },
    YouBuild,
    BuildFailed { cause: String },
    Ack,
    RunFinished,
    Error { message: String },
}

/// Message with its correlation id
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(id: u64, body: T) -> Self {
        Self { id, body }
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Next message, or `None` once the peer closed the connection.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            return Ok(Some(serde_json::from_str(line.trim_end())?));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_wire_format() {
        let message = Envelope::new(7, Request::BuildQuery {
            resource: "gem5".to_string(),
        });
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"id":7,"type":"build_query","resource":"gem5"}"#);

        let reply: Envelope<Reply> = serde_json::from_str(r#"{"id":7,"type":"you_build"}"#).unwrap();
        assert_eq!(reply, Envelope::new(7, Reply::YouBuild));

        let json = serde_json::to_string(&Envelope::new(9, Request::AwaitRunEnd)).unwrap();
        assert_eq!(json, r#"{"id":9,"type":"await_run_end"}"#);
    }

    #[tokio::test]
    async fn test_framing_over_stream() {
        let (mut write, server) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(server);

        let sent = vec![
            Envelope::new(1, Request::RequestUnit),
            Envelope::new(2, Request::Complete { unit: 4 }),
        ];
        for message in &sent {
            write_message(&mut write, message).await.unwrap();
        }
        drop(write);

        let mut received = Vec::new();
        while let Some(message) = read_message::<_, Envelope<Request>>(&mut reader).await.unwrap() {
            received.push(message);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_malformed_line() {
        let mut reader = BufReader::new(&b"{not json\n"[..]);
        let result = read_message::<_, Envelope<Request>>(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }
}
