use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::message::Message;
use crate::protocol::{BODY_MAX, MessageCodec};
use crate::server::{ServerState, accept_side};

/// Raw file data moves in chunks the size of a legacy fixed-width record.
pub const CHUNK_SIZE: usize = 1010;

const NAME_LIMIT: usize = 255;

/// The shared directory uploads land in and downloads are served from.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a client-supplied name to a path inside the store. Only a
    /// single plain path component is accepted.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, RelayError> {
        let refused = |why: &str| RelayError::InvalidFileName(format!("'{name}': {why}"));

        if name.is_empty() {
            return Err(refused("empty"));
        }
        if name.len() > NAME_LIMIT {
            return Err(refused("too long"));
        }
        if name.starts_with('.') {
            return Err(refused("hidden or relative"));
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(refused("not a plain file name"));
        }
        Ok(self.dir.join(name))
    }

    /// File names in the store, sorted.
    pub async fn names(&self) -> Result<Vec<String>, RelayError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// `name1/name2/` as sent to downloading clients, cut at the last entry
    /// that fits in a message body.
    pub async fn listing(&self) -> Result<String, RelayError> {
        let mut listing = String::new();
        for name in self.names().await? {
            if listing.len() + name.len() + 1 > BODY_MAX {
                break;
            }
            listing.push_str(&name);
            listing.push('/');
        }
        Ok(listing)
    }
}

/// Copy up to `size` bytes in [`CHUNK_SIZE`] pieces. Stops early if the
/// reader hits end of stream; returns how many bytes were copied.
pub async fn copy_chunks<R, W>(reader: &mut R, writer: &mut W, size: u64) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    while copied < size {
        let want = (size - copied).min(CHUNK_SIZE as u64) as usize;
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&chunk[..n]).await?;
        copied += n as u64;
    }
    Ok(copied)
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

/// Upload worker: accept one connection on the upload port, then receive
/// a file name, an 8-byte little-endian size and the file bytes.
pub async fn serve_upload(state: Arc<ServerState>, uploader: String) -> Result<(), RelayError> {
    let (stream, peer) = accept_side(&state, &state.services.upload, "upload").await?;
    let mut framed = Framed::new(stream, MessageCodec);

    let Some(request) = framed.next().await else {
        info!(%uploader, %peer, "upload abandoned before a file name was sent");
        return Ok(());
    };
    let request = request?;
    let path = state.files.path_for(&request.message)?;

    // The size field and file bytes may already sit in the codec's buffer.
    let parts = framed.into_parts();
    let mut reader = Cursor::new(parts.read_buf).chain(parts.io);

    let size = match reader.read_u64_le().await {
        Ok(size) => size,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            info!(%uploader, file = %request.message, "upload abandoned before its size was sent");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let max = state.config.max_upload_bytes;
    if size > max {
        return Err(RelayError::UploadTooLarge { size, max });
    }

    let mut file = File::create(&path).await?;
    let received = copy_chunks(&mut reader, &mut file, size).await;
    file.flush().await?;

    match received {
        Ok(received) if received == size => {
            info!(%uploader, file = %request.message, size, "upload complete");
        }
        Ok(received) => {
            warn!(%uploader, file = %request.message, size, received, "upload truncated by peer");
        }
        Err(e) if is_disconnect(&e) => {
            warn!(%uploader, file = %request.message, error = %e, "uploader disconnected");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Download worker: accept one connection on the download port, list the
/// shared files, then stream the chosen one after its 8-byte size.
pub async fn serve_download(state: Arc<ServerState>, requester: String) -> Result<(), RelayError> {
    let (stream, peer) = accept_side(&state, &state.services.download, "download").await?;
    let mut framed = Framed::new(stream, MessageCodec);

    let listing = state.files.listing().await?;
    framed
        .send(Message::reply("download", requester.as_str(), listing))
        .await?;

    let Some(choice) = framed.next().await else {
        info!(%requester, %peer, "download abandoned");
        return Ok(());
    };
    let choice = choice?;
    if choice.cmd == "cancel" {
        debug!(%requester, "download cancelled");
        return Ok(());
    }

    let path = state.files.path_for(&choice.message)?;
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(%requester, file = %choice.message, "requested file does not exist");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();

    let mut stream = framed.into_inner();
    let sent = async {
        stream.write_u64_le(size).await?;
        let sent = copy_chunks(&mut file, &mut stream, size).await?;
        stream.shutdown().await?;
        Ok::<_, std::io::Error>(sent)
    }
    .await;

    match sent {
        Ok(sent) => info!(%requester, file = %choice.message, size, sent, "download complete"),
        Err(e) if is_disconnect(&e) => {
            warn!(%requester, file = %choice.message, error = %e, "downloader disconnected");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
