//! Data phase: streaming index entries over the data socket.
//!
//! For each entry `i` the sender writes a frame
//! `{requestId: i, file, fileSize, directory}` followed, for files, by exactly
//! `fileSize` raw bytes. The receiver stores the entry and answers
//! `{requestId: i, result: true}`, or `{requestId: i, result: false, error}`.

use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::Session;
use crate::error::{Error, Result};
use crate::index::sanitize_relative_path;
use crate::protocol::{self, keys, ErrorKind, FileIndexEntry, Message};

fn entry_header(index: usize, entry: &FileIndexEntry) -> Message {
    Message::new()
        .with(keys::REQUEST_ID, index)
        .with(keys::FILE, entry.name.as_str())
        .with(keys::FILE_SIZE, entry.size)
        .with(keys::DIRECTORY, entry.is_directory)
}

fn ack(index: usize, failure: Option<ErrorKind>) -> Message {
    let message = Message::new()
        .with(keys::REQUEST_ID, index)
        .with(keys::RESULT, failure.is_none());
    match failure {
        Some(kind) => message.with(keys::ERROR, kind.as_str()),
        None => message,
    }
}

fn check_request_id(message: &Message, expected: usize) -> Result<()> {
    let got = message.require_u64(keys::REQUEST_ID)?;
    if usize::try_from(got).ok() == Some(expected) {
        Ok(())
    } else {
        Err(Error::ProtocolViolation(format!(
            "expected entry {expected}, got {got}"
        )))
    }
}

/// Whether a sender's entry header describes the accepted index entry.
fn header_matches(header: &Message, entry: &FileIndexEntry) -> bool {
    header.opt_str(keys::FILE) == Some(entry.name.as_str())
        && header.opt_u64(keys::FILE_SIZE).unwrap_or(0) == entry.size
        && header.opt_bool(keys::DIRECTORY).unwrap_or(false) == entry.is_directory
}

/// Send every entry and wait for each acknowledgement.
pub(crate) async fn send_entries<S>(
    stream: &mut S,
    entries: &[FileIndexEntry],
    chunk_size: usize,
    read_timeout: Duration,
    session: &mut Session,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];

    for (index, entry) in entries.iter().enumerate() {
        session.begin_entry(index);
        protocol::write_message_with_timeout(stream, &entry_header(index, entry), read_timeout)
            .await?;

        if !entry.is_directory {
            let source = entry.source.as_deref().ok_or_else(|| {
                Error::InvalidInput(format!("no local source for '{}'", entry.name))
            })?;
            let mut file = File::open(source).await?;
            let mut remaining = entry.size;
            while remaining > 0 {
                let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
                let n = file.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("'{}' shrank while sending", entry.name),
                    )));
                }
                timeout(read_timeout, stream.write_all(&buf[..n]))
                    .await
                    .map_err(|_| Error::Timeout(protocol::millis(read_timeout)))??;
                remaining -= n as u64;
                session.advance(n as u64);
            }
            stream.flush().await?;
        }

        let reply = protocol::read_message_with_timeout(stream, read_timeout).await?;
        check_request_id(&reply, index)?;
        if !reply.result() {
            let reason = reply.opt_str(keys::ERROR).unwrap_or("unknown");
            return Err(Error::Io(std::io::Error::other(format!(
                "peer could not store '{}': {reason}",
                entry.name
            ))));
        }
        debug!(index, name = %entry.name, "entry acknowledged");
    }

    Ok(())
}

/// Receive every entry into `output_dir`, acknowledging each one.
///
/// Names, sizes and kinds come from the accepted index; a header that
/// disagrees with it is refused with `notAllowed`.
pub(crate) async fn receive_entries<S>(
    stream: &mut S,
    entries: &[FileIndexEntry],
    output_dir: &Path,
    chunk_size: usize,
    read_timeout: Duration,
    session: &mut Session,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];

    for (index, entry) in entries.iter().enumerate() {
        session.begin_entry(index);
        let header = protocol::read_message_with_timeout(stream, read_timeout).await?;
        check_request_id(&header, index)?;
        if !header_matches(&header, entry) {
            protocol::write_message(stream, &ack(index, Some(ErrorKind::NotAllowed))).await?;
            return Err(Error::ProtocolViolation(format!(
                "entry {index} does not match the accepted index entry '{}'",
                entry.name
            )));
        }
        let name = entry.name.as_str();
        let size = entry.size;
        let is_directory = entry.is_directory;

        let Some(target) = sanitize_relative_path(output_dir, name) else {
            protocol::write_message(stream, &ack(index, Some(ErrorKind::NotAllowed))).await?;
            return Err(Error::ProtocolViolation(format!(
                "entry name '{name}' escapes the output directory"
            )));
        };

        if is_directory {
            tokio::fs::create_dir_all(&target).await?;
        } else {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = File::create(&target).await?;
            let mut remaining = size;
            while remaining > 0 {
                let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
                let n = timeout(read_timeout, stream.read(&mut buf[..want]))
                    .await
                    .map_err(|_| Error::Timeout(protocol::millis(read_timeout)))??;
                if n == 0 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("sender closed during '{name}'"),
                    )));
                }
                file.write_all(&buf[..n]).await?;
                remaining -= n as u64;
                session.advance(n as u64);
            }
            file.flush().await?;
        }

        protocol::write_message_with_timeout(stream, &ack(index, None), read_timeout).await?;
        debug!(index, %name, "entry stored");
    }

    Ok(())
}
