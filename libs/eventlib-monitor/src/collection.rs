// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Collection client
//!
//! The process-lifecycle collection layer drives every DAQ process through
//! JSON transitions. This client speaks the newline-delimited JSON framing:
//! each message is `{"header": {"key": ..., "msg_id": ...}, "body": ...}`,
//! and every transition gets a reply echoing the key and msg_id, with
//! `err_info` in the body when the transition failed.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

/// One transition received from the collection server.
#[derive(Debug)]
pub struct Message {
    pub key: String,
    pub msg_id: Value,
    pub body: Value,
}

pub struct CollectionClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Identity assigned by the collection server at registration.
    id: u64,
}

impl CollectionClient {
    /// Register with the collection server as `level`/`alias`.
    pub fn connect(coll_srv: &str, partition: u32, level: &str, alias: &str) -> Result<Self> {
        let stream = TcpStream::connect(coll_srv)
            .with_context(|| format!("connecting to collection server {coll_srv}"))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .context("setting collection read timeout")?;
        let writer = stream.try_clone().context("cloning collection stream")?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
            id: 0,
        };

        client.send(&json!({
            "header": { "key": "hello", "msg_id": 0 },
            "body": {
                "level": level,
                "alias": alias,
                "partition": partition,
                "pid": std::process::id(),
            }
        }))?;
        let hello = client
            .read_blocking()?
            .context("collection server closed during registration")?;
        client.id = hello.body["id"].as_u64().unwrap_or(0);
        tracing::info!(id = client.id, "registered with collection server");
        Ok(client)
    }

    /// The identity the server knows this process by.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next transition, or `None` when the read timed out. An EOF is an
    /// error; the collection link going away means the process must stop.
    pub fn poll(&mut self) -> Result<Option<Message>> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => anyhow::bail!("collection server closed the connection"),
            Ok(_) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(err) => return Err(err).context("reading from collection server"),
        }
        let msg: Value = serde_json::from_str(line.trim_end())
            .with_context(|| format!("undecodable collection message: {line:?}"))?;
        Ok(Some(Message {
            key: msg["header"]["key"].as_str().unwrap_or_default().to_string(),
            msg_id: msg["header"]["msg_id"].clone(),
            body: msg["body"].clone(),
        }))
    }

    fn read_blocking(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(msg) = self.poll()? {
                return Ok(Some(msg));
            }
        }
    }

    /// Reply to a transition. `err_info`, when present, marks it failed.
    pub fn reply(&mut self, key: &str, msg_id: &Value, body: Value) -> Result<()> {
        self.send(&json!({
            "header": { "key": key, "msg_id": msg_id, "sender_id": self.id },
            "body": body,
        }))
    }

    fn send(&mut self, msg: &Value) -> Result<()> {
        let mut line = serde_json::to_string(msg).context("encoding collection message")?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .context("writing to collection server")
    }
}

/// Build a failure reply body.
pub fn err_body(err_info: impl Into<String>) -> Value {
    json!({ "err_info": err_info.into() })
}
