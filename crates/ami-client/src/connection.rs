//! One established manager connection.
//!
//! Handles the transport handshake: TCP connect, banner consumption,
//! and the `Login` exchange. The read half plus decoder stay here; the
//! write half is handed back to the client so writes and reads never
//! contend.

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use ringflow_ami_core::{Action, Block, BlockDecoder};

use crate::config::AmiClientConfig;
use crate::error::{ClientError, Result};

const READ_CHUNK: usize = 4096;

/// The reading side of an established, logged-in connection.
pub(crate) struct Connection {
    reader: OwnedReadHalf,
    decoder: BlockDecoder,
    read_buf: [u8; READ_CHUNK],
}

impl Connection {
    /// Connect, consume the banner, and perform the login handshake.
    ///
    /// `login_action_id` correlates the login response; it comes from
    /// the client's regular ActionID sequence so ids stay unique per
    /// connection.
    pub(crate) async fn establish(
        config: &AmiClientConfig,
        login_action_id: &str,
    ) -> Result<(Connection, OwnedWriteHalf)> {
        info!("connecting to switch at {}", config.address);
        let stream = TcpStream::connect(&config.address).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let mut conn = Connection {
            reader,
            decoder: BlockDecoder::with_banner(),
            read_buf: [0u8; READ_CHUNK],
        };

        let login = Action::new("Login")
            .field("Username", &config.username)
            .field("Secret", &config.secret)
            .into_block(login_action_id);
        write_block(&writer, &login).await?;

        // Blocks can precede the login response (FullyBooted on fast
        // switches); skip them until the Response block arrives.
        let response = loop {
            let block = conn.next_block().await?;
            if block.response_status().is_some() {
                break block;
            }
            debug!("pre-login block skipped: {:?}", block.event_name());
        };

        if let Some(banner) = conn.decoder.take_banner() {
            debug!("switch banner: {}", banner);
        }

        if !response.is_success() {
            let message = response
                .get("Message")
                .unwrap_or("no message")
                .to_string();
            warn!("login rejected: {}", message);
            return Err(ClientError::AuthRejected(message));
        }

        info!("logged in to switch at {}", config.address);
        Ok((conn, writer))
    }

    /// Read until the next complete block. An EOF or framing violation
    /// is a connection-level error; the caller reconnects.
    pub(crate) async fn next_block(&mut self) -> Result<Block> {
        loop {
            if let Some(block) = self.decoder.next_block()? {
                return Ok(block);
            }
            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ClientError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "switch closed the connection",
                )));
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }
}

/// Write one encoded block to the connection.
pub(crate) async fn write_block(writer: &OwnedWriteHalf, block: &Block) -> Result<()> {
    let bytes = ringflow_ami_core::encode_block(block);
    loop {
        writer.writable().await?;
        match writer.try_write(&bytes) {
            Ok(n) if n == bytes.len() => return Ok(()),
            Ok(n) => {
                // Partial write; retry the remainder.
                return write_remainder(writer, &bytes[n..]).await;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

async fn write_remainder(writer: &OwnedWriteHalf, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        writer.writable().await?;
        match writer.try_write(bytes) {
            Ok(n) => bytes = &bytes[n..],
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
