//! Distributed run credentials
//!
//! INI-style file shared by the coordinator and its workers:
//!
//! ```text
//! [coordinator]
//! hostname = build-01.example.com
//! port = 11112
//! passkey = hunter2
//! ```

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Failed to read credentials {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Line {line}: expected 'key = value', got '{content}'")]
    Syntax { line: usize, content: String },

    #[error("Missing credential field '{0}'")]
    Missing(&'static str),

    #[error("Invalid value '{value}' for credential field '{field}'")]
    Invalid { field: &'static str, value: String },
}

/// Coordinator address and shared passkey
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub hostname: String,
    pub port: u16,
    pub passkey: String,
}

impl Credentials {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredentialsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CredentialsError> {
        let mut hostname = None;
        let mut port = None;
        let mut passkey = None;

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(CredentialsError::Syntax {
                    line: idx + 1,
                    content: raw.to_string(),
                });
            };
            let value = value.trim().to_string();
            match key.trim() {
                "hostname" => hostname = Some(value),
                "port" => {
                    let parsed = value.parse::<u16>().map_err(|_| CredentialsError::Invalid {
                        field: "port",
                        value: value.clone(),
                    })?;
                    port = Some(parsed);
                }
                "passkey" => passkey = Some(value),
                // Unknown keys are left for other tools sharing the file.
                _ => {}
            }
        }

        Ok(Self {
            hostname: hostname.ok_or(CredentialsError::Missing("hostname"))?,
            port: port.ok_or(CredentialsError::Missing("port"))?,
            passkey: passkey.ok_or(CredentialsError::Missing("passkey"))?,
        })
    }

    /// `hostname:port`; an empty hostname binds every interface.
    pub fn address(&self) -> String {
        let host = if self.hostname.is_empty() {
            "0.0.0.0"
        } else {
            self.hostname.as_str()
        };
        format!("{}:{}", host, self.port)
    }

    /// Address a worker dials; an empty hostname means this machine.
    pub fn connect_address(&self) -> String {
        let host = if self.hostname.is_empty() {
            "127.0.0.1"
        } else {
            self.hostname.as_str()
        };
        format!("{}:{}", host, self.port)
    }
}
