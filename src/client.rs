//! Client library for connecting to a linevault server
//!
//! The protocol has no end-of-response marker, so reads collect lines until
//! the server has been quiet for `response_timeout`.

use crate::error::{Error, Result};
use crate::protocol::Command;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Client for connecting to a linevault server
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    response_timeout: Duration,
}

impl Client {
    /// Connect to a linevault server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        })
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Send a raw line; a missing trailing newline is added
    pub async fn send_line(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(line).await?;
        if line.last() != Some(&b'\n') {
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_command(&mut self, command: Command<'_>) -> Result<()> {
        if command == Command::Unrecognized {
            return Err(Error::Client("command has no wire form".to_string()));
        }
        self.send_line(&command.to_line()).await
    }

    /// Read response lines until the server goes quiet or closes the
    /// connection. Lines are returned without their newline.
    pub async fn read_responses(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut responses = Vec::new();

        loop {
            let mut line = Vec::new();
            let read = match timeout(self.response_timeout, self.reader.read_until(b'\n', &mut line)).await {
                Ok(read) => read?,
                Err(_) => break,
            };
            if read == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            responses.push(line);
        }

        Ok(responses)
    }

    /// Add a value under a key
    pub async fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.send_command(Command::Put {
            key: key.as_bytes(),
            value: value.as_bytes(),
        })
        .await
    }

    /// Every value stored under `key`; empty if none
    pub async fn get(&mut self, key: &str) -> Result<Vec<String>> {
        self.send_command(Command::Get { key: key.as_bytes() }).await?;

        let prefix = format!("{}:", key);
        self.read_responses()
            .await?
            .into_iter()
            .map(|line| {
                let value = line.strip_prefix(prefix.as_bytes()).ok_or_else(|| {
                    Error::Client(format!("unexpected response: {}", String::from_utf8_lossy(&line)))
                })?;
                Ok(String::from_utf8_lossy(value).into_owned())
            })
            .collect()
    }

    /// Replace `old` with `new` under `key`
    pub async fn update(&mut self, key: &str, old: &str, new: &str) -> Result<()> {
        self.send_command(Command::Update {
            key: key.as_bytes(),
            old: old.as_bytes(),
            new: new.as_bytes(),
        })
        .await
    }

    /// Delete a key and all of its values
    pub async fn delete(&mut self, key: &str) -> Result<()> {
        self.send_command(Command::Delete { key: key.as_bytes() }).await
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
