//! Client side of the TCP service: a protocol speaker plus the
//! interactive REPL.
//!
//! Data placement is client-driven: upload and retrieve first look the
//! name's key up through the connected node, and when the owner turns out
//! to be elsewhere in the ring they re-dispatch the data operation over a
//! fresh connection to that owner.

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

use crate::core::{key_of, Endpoint, Key, NodeRef};
use crate::framing;
use crate::server::{CMD_CLOSE, CMD_LOOKUP, CMD_RETRIEVE, CMD_UPLOAD};

/// A connection to one node's client service.
pub struct ServiceClient {
    stream: BufStream<TcpStream>,
    server: Endpoint,
    node_id: Key,
}

impl ServiceClient {
    /// Connect and read the framing preamble (the node's identifier).
    pub async fn connect(server: Endpoint) -> Result<Self> {
        let stream = TcpStream::connect(SocketAddr::V4(server))
            .await
            .with_context(|| format!("connecting to service at {server}"))?;
        let mut stream = BufStream::new(stream);
        let node_id = stream.read_u32_le().await.context("reading node id")?;
        Ok(Self {
            stream,
            server,
            node_id,
        })
    }

    /// Identifier of the node we are connected to.
    pub fn node_id(&self) -> Key {
        self.node_id
    }

    /// The service endpoint this client is connected to.
    pub fn server(&self) -> Endpoint {
        self.server
    }

    /// Ask the connected node who is responsible for `key`.
    pub async fn lookup(&mut self, key: Key) -> Result<NodeRef> {
        self.stream.write_u32_le(CMD_LOOKUP).await?;
        self.stream.write_u32_le(key).await?;
        self.stream.flush().await?;
        framing::read_node_ref(&mut self.stream).await
    }

    /// Store `bytes` under `name` on the connected node.
    pub async fn upload(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        self.stream.write_u32_le(CMD_UPLOAD).await?;
        framing::write_string(&mut self.stream, name).await?;
        framing::write_frame(&mut self.stream, bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Fetch the blob stored under `name`; a zero-length payload means the
    /// blob is absent.
    pub async fn retrieve(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        self.stream.write_u32_le(CMD_RETRIEVE).await?;
        framing::write_string(&mut self.stream, name).await?;
        self.stream.flush().await?;
        let payload = framing::read_frame(&mut self.stream).await?;
        Ok(if payload.is_empty() { None } else { Some(payload) })
    }

    /// End the session politely.
    pub async fn close(mut self) -> Result<()> {
        self.stream.write_u32_le(CMD_CLOSE).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Resolve the owner of `name` through `client`. `None` means the
/// connected node owns the name; otherwise a fresh session against the
/// owning node is returned for the data operation.
async fn session_for_owner(
    client: &mut ServiceClient,
    name: &str,
) -> Result<Option<ServiceClient>> {
    let key = key_of(name);
    let owner = client.lookup(key).await?;
    if owner.is_nil() {
        bail!("no owner found for '{name}' (key {key:#010x})");
    }
    debug!(name, key, owner = %owner, "resolved owner");

    if owner.addr == client.server() {
        Ok(None)
    } else {
        // The owner is elsewhere in the ring; its service listens on the
        // same port number as its node endpoint.
        Ok(Some(ServiceClient::connect(owner.addr).await?))
    }
}

/// Upload a file (or stdin when `path` is `-`) under `name`, dispatching
/// to the owning node.
pub async fn upload_blob(client: &mut ServiceClient, path: &str, name: &str) -> Result<()> {
    let content = if path == "-" {
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        buf
    } else {
        tokio::fs::read(Path::new(path))
            .await
            .with_context(|| format!("reading file {path}"))?
    };

    match session_for_owner(client, name).await? {
        Some(mut owner) => {
            owner.upload(name, &content).await?;
            owner.close().await?;
        }
        None => client.upload(name, &content).await?,
    }

    println!("uploaded '{name}' ({} bytes)", content.len());
    Ok(())
}

/// Retrieve the blob stored under `name` into `dest` (stdout when `-`),
/// dispatching to the owning node.
pub async fn retrieve_blob(client: &mut ServiceClient, name: &str, dest: &str) -> Result<()> {
    let payload = match session_for_owner(client, name).await? {
        Some(mut owner) => {
            let payload = owner.retrieve(name).await?;
            owner.close().await?;
            payload
        }
        None => client.retrieve(name).await?,
    };

    let Some(payload) = payload else {
        bail!("'{name}' not found");
    };

    if dest == "-" {
        std::io::stdout().write_all(&payload)?;
    } else {
        tokio::fs::write(Path::new(dest), &payload)
            .await
            .with_context(|| format!("writing file {dest}"))?;
        println!("retrieved '{name}' into {dest} ({} bytes)", payload.len());
    }
    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  l <name>           look up the node owning <name>");
    println!("  u <path> <name>    upload a file (or - for stdin) under <name>");
    println!("  d <name> [dest]    retrieve <name> into a file (or - for stdout)");
    println!("  h                  this help");
    println!("  q                  quit");
}

/// The interactive client loop against one node's service endpoint.
pub async fn run_repl(server: Endpoint) -> Result<()> {
    let mut client = ServiceClient::connect(server).await?;
    println!(
        "connected to node {:#010x} at {}",
        client.node_id(),
        client.server()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> (h for help) ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");

        let outcome = match (command, parts.next(), parts.next()) {
            ("", _, _) => Ok(()),
            ("h", _, _) => {
                print_help();
                Ok(())
            }
            ("q", _, _) => {
                println!("bye bye!");
                break;
            }
            ("l", Some(name), _) => match client.lookup(key_of(name)).await {
                Ok(owner) if owner.is_nil() => Err(anyhow::anyhow!("lookup timed out")),
                Ok(owner) => {
                    println!("'{name}' (key {:#010x}) lives at {owner}", key_of(name));
                    Ok(())
                }
                Err(err) => Err(err),
            },
            ("u", Some(path), Some(name)) => upload_blob(&mut client, path, name).await,
            ("d", Some(name), dest) => {
                retrieve_blob(&mut client, name, dest.unwrap_or("-")).await
            }
            _ => {
                eprintln!("ERROR: command '{line}' not recognized");
                Ok(())
            }
        };

        if let Err(err) = outcome {
            eprintln!("ERROR: {err:#}");
        }
    }

    client.close().await
}
