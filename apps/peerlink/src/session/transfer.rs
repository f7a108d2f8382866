//! File streaming over `download` channels.
//!
//! The requester opens a channel labeled with a virtual path. The responder
//! answers with binary chunks followed by `END`, or with a single denial
//! code, and the requester closes the channel once it has either.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::SharedManifest;
use super::tunnel::ChannelOpener;
use crate::config::PeerConfig;
use crate::error::{FileDenial, PeerError, TransportError};
use crate::rtc::{ChannelEvent, ChannelInit, ChannelMessage, RtcDataChannel, send_text};

pub const DOWNLOAD_PROTOCOL: &str = "download";
pub const END_MARKER: &str = "END";

#[derive(Clone, Debug)]
struct Shared {
    manifest: SharedManifest,
    root: PathBuf,
}

/// The instance currently offered to peers, if any.
#[derive(Debug, Default)]
pub struct SharedInstance {
    inner: RwLock<Option<Shared>>,
}

impl SharedInstance {
    pub fn share(&self, manifest: SharedManifest, root: impl Into<PathBuf>) {
        *self.inner.write() = Some(Shared {
            manifest,
            root: root.into(),
        });
    }

    pub fn unshare(&self) {
        *self.inner.write() = None;
    }

    pub fn manifest(&self) -> Option<SharedManifest> {
        self.inner.read().as_ref().map(|shared| shared.manifest.clone())
    }

    fn lookup(&self, file: &str) -> Result<PathBuf, FileDenial> {
        let guard = self.inner.read();
        let shared = guard.as_ref().ok_or(FileDenial::NoPermission)?;
        if !shared.manifest.contains(file) {
            return Err(FileDenial::NoPermission);
        }
        Ok(shared.root.join(file))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Source {
    Inline(Vec<u8>),
    File(PathBuf),
}

/// `path` below `prefix`: the prefix itself or the prefix followed by `/`.
fn under<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

/// Maps a virtual path onto something servable.
///
/// `/sharing` is the manifest itself; `/sharing/<file>` must be listed in
/// it. `/image`, `/assets` and `/libraries` map onto configured roots.
pub fn resolve(path: &str, sharing: &SharedInstance, config: &PeerConfig) -> Result<Source, FileDenial> {
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(FileDenial::NoPermission);
    }
    if path == "/sharing" {
        let manifest = sharing.manifest().ok_or(FileDenial::NotFound)?;
        return serde_json::to_vec(&manifest)
            .map(Source::Inline)
            .map_err(|_| FileDenial::NotFound);
    }
    if let Some(file) = path.strip_prefix("/sharing/") {
        return sharing.lookup(file).map(Source::File);
    }
    let (root, rest) = if let Some(rest) = under(path, "/image") {
        (config.shared_image_dir.as_ref(), rest)
    } else if let Some(rest) = under(path, "/assets") {
        (config.shared_assets_dir.as_ref(), rest)
    } else if let Some(rest) = under(path, "/libraries") {
        (config.shared_libraries_dir.as_ref(), rest)
    } else {
        return Err(FileDenial::NotFound);
    };
    let root = root.ok_or(FileDenial::NotFound)?;
    let relative = Path::new(rest.trim_start_matches('/'));
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(FileDenial::NoPermission);
    }
    Ok(Source::File(root.join(relative)))
}

/// Answers one remote request. Returns once the requester closes the
/// channel.
pub async fn serve(
    channel: Arc<dyn RtcDataChannel>,
    sharing: &SharedInstance,
    config: &PeerConfig,
) {
    let Some(mut events) = channel.take_events() else {
        return;
    };
    let path = channel.label();
    if !channel.is_open() && !wait_open(&mut events).await {
        return;
    }
    let outcome = match resolve(&path, sharing, config) {
        Ok(Source::Inline(bytes)) => stream(&*channel, &bytes[..], config.chunk_bytes).await,
        Ok(Source::File(file)) => match tokio::fs::File::open(&file).await {
            Ok(reader) => stream(&*channel, reader, config.chunk_bytes).await,
            Err(_) => deny(&*channel, FileDenial::NotFound).await,
        },
        Err(denial) => deny(&*channel, denial).await,
    };
    match outcome {
        Ok(Some(bytes)) => info!(target = "peerlink::transfer", %path, bytes, "file served"),
        Ok(None) => {}
        Err(err) => warn!(target = "peerlink::transfer", %path, error = %err, "file stream failed"),
    }
    while let Some(event) = events.recv().await {
        if event == ChannelEvent::Close {
            break;
        }
    }
}

async fn wait_open(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => return true,
            ChannelEvent::Close => return false,
            ChannelEvent::Message(_) => {}
        }
    }
    false
}

async fn deny(channel: &dyn RtcDataChannel, denial: FileDenial) -> Result<Option<u64>, TransportError> {
    debug!(target = "peerlink::transfer", path = %channel.label(), code = denial.as_code(), "request denied");
    send_text(channel, denial.as_code()).await?;
    Ok(None)
}

async fn stream<R>(channel: &dyn RtcDataChannel, mut reader: R, chunk: usize) -> Result<Option<u64>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        if n == 0 {
            break;
        }
        channel
            .send(ChannelMessage::Binary(Bytes::copy_from_slice(&buf[..n])))
            .await?;
        total += n as u64;
    }
    send_text(channel, END_MARKER).await?;
    Ok(Some(total))
}

/// Requests `path` from the remote and writes the bytes into `writer`.
pub async fn download<W>(
    opener: &dyn ChannelOpener,
    path: &str,
    writer: &mut W,
) -> Result<u64, PeerError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let channel = opener
        .open_channel(path, ChannelInit::ordered(DOWNLOAD_PROTOCOL))
        .await?;
    let Some(mut events) = channel.take_events() else {
        channel.close().await;
        return Err(TransportError::ChannelClosed.into());
    };
    let mut total = 0u64;
    let result = loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => {}
            Some(ChannelEvent::Message(ChannelMessage::Binary(data))) => {
                if let Err(err) = writer.write_all(&data).await {
                    break Err(PeerError::Io(err));
                }
                total += data.len() as u64;
            }
            Some(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                if text == END_MARKER {
                    break writer.flush().await.map(|()| total).map_err(PeerError::Io);
                }
                match FileDenial::from_code(&text) {
                    Some(denial) => break Err(PeerError::Denied(denial)),
                    None => {
                        debug!(target = "peerlink::transfer", %path, %text, "ignoring text frame");
                    }
                }
            }
            Some(ChannelEvent::Close) | None => {
                break Err(TransportError::ChannelClosed.into());
            }
        }
    };
    channel.close().await;
    if let Ok(bytes) = &result {
        debug!(target = "peerlink::transfer", %path, bytes, "download finished");
    }
    result
}
