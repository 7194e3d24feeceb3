//! Chunked image transfer.
//!
//! The sender writes a fixed-width header (see `cairn_core::framing`) and the
//! raw archive on one upload stream, then waits for a signed `TransferReply`
//! on the reply protocol, matched by `(receiver, content_hash)`.
//!
//! The receiver stages exactly `file_size` bytes in a temp file, checks the
//! BLAKE3 against the header, loads the archive into the runtime, records
//! the uploader's signature and always removes the temp file.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use cairn_core::config::TransferConfig;
use cairn_core::crypto::{Hasher, Keypair, PeerId};
use cairn_core::envelope::{new_message_id, unix_now, SignedMessage};
use cairn_core::framing::{TransferHeader, TransferMeta, CHUNK_SIZE, HEADER_LEN, NAME_WIDTH};
use cairn_core::message::{RemoteResult, TransferReply};
use cairn_core::wire::{UPLOAD_PROTOCOL, UPLOAD_REPLY_PROTOCOL};

use crate::error::ProtocolError;
use crate::runtime::ContainerRuntime;
use crate::store::{record_image_upload, Store};
use crate::transport::{
    ensure_verified, read_message, send_message, BoxStream, LatchedWriter, StreamHandler,
    Transport,
};

type ReplyKey = (PeerId, String);

#[derive(Clone)]
pub struct Transfer {
    keypair: Arc<Keypair>,
    transport: Arc<dyn Transport>,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn Store>,
    config: TransferConfig,
    replies: Arc<DashMap<ReplyKey, oneshot::Sender<RemoteResult<String>>>>,
    /// Serializes read-modify-write of image records.
    record_lock: Arc<Mutex<()>>,
}

impl Transfer {
    pub fn new(
        keypair: Arc<Keypair>,
        transport: Arc<dyn Transport>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn Store>,
        config: TransferConfig,
    ) -> Self {
        Self {
            keypair,
            transport,
            runtime,
            store,
            config,
            replies: Arc::new(DashMap::new()),
            record_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Handler for the upload protocol.
    pub fn upload_handler(&self) -> Arc<dyn StreamHandler> {
        Arc::new(UploadHandler(self.clone()))
    }

    /// Handler for the reply protocol.
    pub fn reply_handler(&self) -> Arc<dyn StreamHandler> {
        Arc::new(ReplyHandler(self.clone()))
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Upload the archive at `path` to `peer`. Returns the image id the
    /// remote runtime assigned.
    pub async fn push_image(
        &self,
        peer: PeerId,
        path: &Path,
        timeout: Duration,
    ) -> Result<String, ProtocolError> {
        let (file_size, digest) = hash_file(path).await?;
        let content_hash = hex::encode(digest);
        let meta = TransferMeta {
            file_size,
            file_name: header_name(path),
            signature: hex::encode(self.keypair.sign(&digest)),
            content_hash: content_hash.clone(),
        };
        let header = TransferHeader::encode(&meta)?;

        let key = (peer, content_hash.clone());
        let (tx, rx) = oneshot::channel();
        self.replies.insert(key.clone(), tx);

        if let Err(e) = self.send_upload(peer, path, &header, file_size).await {
            self.replies.remove(&key);
            return Err(e);
        }
        tracing::info!(
            peer = %peer.short(),
            content_hash = %content_hash,
            bytes = file_size,
            "image sent, awaiting reply"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result.into_result().map_err(ProtocolError::Remote),
            Ok(Err(_)) => Err(ProtocolError::TimedOut("image upload")),
            Err(_) => {
                self.replies.remove(&key);
                tracing::warn!(
                    peer = %peer.short(),
                    content_hash = %content_hash,
                    "upload reply timed out"
                );
                Err(ProtocolError::TimedOut("image upload"))
            }
        }
    }

    async fn send_upload(
        &self,
        peer: PeerId,
        path: &Path,
        header: &TransferHeader,
        file_size: u64,
    ) -> Result<(), ProtocolError> {
        let stream = self.transport.open_stream(peer, UPLOAD_PROTOCOL).await?;
        let mut body = tokio::fs::File::open(path).await?.take(file_size);

        let mut writer = LatchedWriter::new(stream);
        writer.write_chunk(header.as_wire()).await;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while writer.error().is_none() {
            let n = body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_chunk(&buf[..n]).await;
        }
        let written = writer.written();
        let mut stream = writer.finish().await?;
        stream.shutdown().await?;
        tracing::debug!(peer = %peer.short(), written, "upload stream closed");
        Ok(())
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    async fn receive(&self, peer: PeerId, mut stream: BoxStream) -> Result<(), ProtocolError> {
        let mut raw = [0u8; HEADER_LEN];
        stream.read_exact(&mut raw).await?;
        let meta = TransferHeader::from_wire(&raw)?.decode()?;
        if !is_content_hash(&meta.content_hash) {
            return Err(ProtocolError::InvalidHeader(format!(
                "content hash {:?} is not 64 hex digits",
                meta.content_hash
            )));
        }
        tracing::info!(
            peer = %peer.short(),
            content_hash = %meta.content_hash,
            file_name = %meta.file_name,
            bytes = meta.file_size,
            "receiving image"
        );

        let result = self.ingest(&mut stream, &meta).await;
        match &result {
            Ok(image_id) => {
                tracing::info!(peer = %peer.short(), image_id = %image_id, "image loaded")
            }
            Err(e) => tracing::warn!(
                peer = %peer.short(),
                content_hash = %meta.content_hash,
                error = %e,
                "image upload failed"
            ),
        }

        let reply = TransferReply {
            content_hash: meta.content_hash,
            result: result.into(),
        };
        let msg = SignedMessage::new(&self.keypair, new_message_id(), false, reply)?;
        send_message(self.transport.as_ref(), peer, UPLOAD_REPLY_PROTOCOL, &msg).await
    }

    /// Stage, check, load and record one upload. The temp file is removed
    /// whatever the outcome.
    async fn ingest<R: AsyncRead + Unpin>(
        &self,
        body: &mut R,
        meta: &TransferMeta,
    ) -> Result<String, ProtocolError> {
        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        let path = self
            .config
            .temp_dir
            .join(format!("{}-{}.tar", meta.content_hash, Uuid::new_v4()));
        let result = self.ingest_at(body, meta, &path).await;
        remove_staged(&path).await;
        result
    }

    async fn ingest_at<R: AsyncRead + Unpin>(
        &self,
        body: &mut R,
        meta: &TransferMeta,
        path: &Path,
    ) -> Result<String, ProtocolError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut hasher = Hasher::new();
        let mut remaining = meta.file_size;
        let mut buf = vec![0u8; CHUNK_SIZE.min(meta.file_size.max(1) as usize)];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = body.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended {remaining} bytes short"),
                )
                .into());
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        file.flush().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(&meta.content_hash) {
            return Err(ProtocolError::HashMismatch {
                expected: meta.content_hash.clone(),
                actual,
            });
        }

        let image_id = self.runtime.load_image(path).await?;
        let _guard = self.record_lock.lock().await;
        record_image_upload(
            self.store.as_ref(),
            &image_id,
            &meta.content_hash.to_ascii_lowercase(),
            &meta.signature,
            unix_now(),
        )
        .map_err(ProtocolError::Store)?;
        Ok(image_id)
    }

    fn on_reply(&self, msg: SignedMessage<TransferReply>) -> Result<(), ProtocolError> {
        ensure_verified(&msg)?;
        let sender = msg.sender();
        let key = (sender, msg.body.content_hash.to_ascii_lowercase());
        match self.replies.remove(&key) {
            Some((_, tx)) => {
                let _ = tx.send(msg.body.result);
                Ok(())
            }
            None => Err(ProtocolError::UnknownRequest {
                peer: sender,
                msg_id: msg.envelope.message_id,
            }),
        }
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}

struct UploadHandler(Transfer);

#[async_trait]
impl StreamHandler for UploadHandler {
    async fn handle(&self, peer: PeerId, stream: BoxStream) {
        if let Err(e) = self.0.receive(peer, stream).await {
            tracing::warn!(peer = %peer.short(), error = %e, "upload dropped");
        }
    }
}

struct ReplyHandler(Transfer);

#[async_trait]
impl StreamHandler for ReplyHandler {
    async fn handle(&self, peer: PeerId, mut stream: BoxStream) {
        let result = match read_message::<TransferReply>(&mut stream).await {
            Ok(msg) => self.0.on_reply(msg),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(peer = %peer.short(), error = %e, "upload reply dropped");
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Size and BLAKE3 of a file, read in `CHUNK_SIZE` pieces.
async fn hash_file(path: &Path) -> io::Result<(u64, [u8; 32])> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize()))
}

/// The file's base name, cut to the header width on a char boundary and
/// without a trailing filler byte.
fn header_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut end = name.len().min(NAME_WIDTH);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end]
        .trim_end_matches(cairn_core::framing::FILLER as char)
        .to_string()
}

fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn remove_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "could not remove staged upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::memory::{MemoryNetwork, MemoryTransport};
    use crate::store::{load_image_record, SqliteStore};
    use crate::testing::{unique_temp_dir, Collector, FakeRuntime};
    use cairn_core::crypto::{hash, verify_signature};

    struct Side {
        keypair: Arc<Keypair>,
        transfer: Transfer,
        runtime: Arc<FakeRuntime>,
        store: Arc<SqliteStore>,
        transport: Arc<MemoryTransport>,
        temp_dir: PathBuf,
    }

    fn side(net: &MemoryNetwork, label: &str) -> Side {
        let keypair = Arc::new(Keypair::generate());
        let transport = net.join(keypair.peer_id());
        let runtime = Arc::new(FakeRuntime::new());
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let temp_dir = unique_temp_dir(label);
        let transfer = Transfer::new(
            keypair.clone(),
            transport.clone(),
            runtime.clone(),
            store.clone(),
            TransferConfig {
                temp_dir: temp_dir.clone(),
                reply_timeout_secs: 5,
            },
        );
        transport.set_handler(UPLOAD_PROTOCOL, transfer.upload_handler());
        transport.set_handler(UPLOAD_REPLY_PROTOCOL, transfer.reply_handler());
        Side {
            keypair,
            transfer,
            runtime,
            store,
            transport,
            temp_dir,
        }
    }

    fn pair() -> (MemoryNetwork, Side, Side) {
        let net = MemoryNetwork::new();
        let a = side(&net, "sender");
        let b = side(&net, "receiver");
        net.connect(&a.transport, &b.transport);
        (net, a, b)
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn upload_arrives_byte_identical_and_is_recorded() {
        let (_net, a, b) = pair();
        // Spans several chunks and ends mid-chunk.
        let archive: Vec<u8> = (0..(CHUNK_SIZE * 2 + 4321)).map(|i| (i % 251) as u8).collect();
        let src = unique_temp_dir("src").join("app image.tar");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, &archive).unwrap();

        let image_id = a
            .transfer
            .push_image(b.keypair.peer_id(), &src, Duration::from_secs(5))
            .await
            .unwrap();

        let digest = hash(&archive);
        assert_eq!(image_id, format!("sha256:{}", hex::encode(digest)));
        assert_eq!(b.runtime.loaded_images(), vec![archive]);

        let record = load_image_record(b.store.as_ref(), &image_id)
            .unwrap()
            .unwrap();
        assert_eq!(record.content_hash, hex::encode(digest));
        let sig = hex::decode(&record.signatures[0]).unwrap();
        assert!(verify_signature(&a.keypair.public_key(), &digest, &sig));

        assert_eq!(staged_files(&b.temp_dir), 0);
        assert_eq!(a.transfer.pending_replies(), 0);
    }

    #[tokio::test]
    async fn second_uploader_appends_its_signature() {
        let (net, a, b) = pair();
        let c = side(&net, "second-sender");
        net.connect(&c.transport, &b.transport);

        let src = unique_temp_dir("src2").join("img.tar");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, b"same archive").unwrap();

        let to = b.keypair.peer_id();
        let id_a = a.transfer.push_image(to, &src, Duration::from_secs(5)).await.unwrap();
        let id_c = c.transfer.push_image(to, &src, Duration::from_secs(5)).await.unwrap();
        assert_eq!(id_a, id_c);

        let record = load_image_record(b.store.as_ref(), &id_a).unwrap().unwrap();
        assert_eq!(record.signatures.len(), 2);
    }

    #[tokio::test]
    async fn corrupted_body_is_refused_with_an_error_reply() {
        let (_net, a, b) = pair();
        let replies: Collector<TransferReply> = Collector::new();
        a.transport
            .set_handler(UPLOAD_REPLY_PROTOCOL, Arc::new(replies.clone()));

        let claimed = hash(b"what was promised");
        let body = b"what was delivered";
        let header = TransferHeader::encode(&TransferMeta {
            file_size: body.len() as u64,
            file_name: "x.tar".into(),
            signature: hex::encode(a.keypair.sign(&claimed)),
            content_hash: hex::encode(claimed),
        })
        .unwrap();

        let mut stream = a
            .transport
            .open_stream(b.keypair.peer_id(), UPLOAD_PROTOCOL)
            .await
            .unwrap();
        stream.write_all(header.as_wire()).await.unwrap();
        stream.write_all(body).await.unwrap();
        stream.shutdown().await.unwrap();

        let reply = replies.next().await.unwrap();
        assert!(reply.verify());
        assert_eq!(reply.body.content_hash, hex::encode(claimed));
        match reply.body.result {
            RemoteResult::Err(e) => assert!(e.contains("mismatch"), "{e}"),
            RemoteResult::Ok(id) => panic!("corrupt upload loaded as {id}"),
        }
        assert!(b.runtime.loaded_images().is_empty());
        assert_eq!(staged_files(&b.temp_dir), 0);
    }

    #[tokio::test]
    async fn truncated_body_is_not_loaded() {
        let (_net, a, b) = pair();
        let replies: Collector<TransferReply> = Collector::new();
        a.transport
            .set_handler(UPLOAD_REPLY_PROTOCOL, Arc::new(replies.clone()));

        let full = b"0123456789";
        let header = TransferHeader::encode(&TransferMeta {
            file_size: full.len() as u64,
            file_name: "short.tar".into(),
            signature: String::new(),
            content_hash: hex::encode(hash(full)),
        })
        .unwrap();
        let mut stream = a
            .transport
            .open_stream(b.keypair.peer_id(), UPLOAD_PROTOCOL)
            .await
            .unwrap();
        stream.write_all(header.as_wire()).await.unwrap();
        stream.write_all(&full[..4]).await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        let reply = replies.next().await.unwrap();
        assert!(matches!(reply.body.result, RemoteResult::Err(_)));
        assert!(b.runtime.loaded_images().is_empty());
    }

    #[tokio::test]
    async fn unreachable_peer_leaves_no_waiter() {
        let (net, a, b) = pair();
        net.leave(&b.keypair.peer_id());
        let src = unique_temp_dir("src3").join("img.tar");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, b"archive").unwrap();

        let err = a
            .transfer
            .push_image(b.keypair.peer_id(), &src, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
        assert_eq!(a.transfer.pending_replies(), 0);
    }

    #[test]
    fn header_name_is_cut_to_width() {
        let long = format!("{}.tar", "é".repeat(40));
        let name = header_name(Path::new(&long));
        assert!(name.len() <= NAME_WIDTH);
        assert!(long.starts_with(&name));
        assert_eq!(header_name(Path::new("/tmp/a:b::")), "a:b");
    }
}
