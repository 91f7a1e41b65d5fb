//! 保存済みモデルのtar.gzエクスポート
//!
//! アーカイブの中身（この順）:
//! - model/        - ディレクトリエントリ
//! - model/...     - モデルファイル（名前順）
//! - labels.json
//! - info.json
//!
//! mtime・uid・gidは0固定なので、同じモデルからは同じバイト列ができる。

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::LifecycleError;
use crate::model::model_storage::{ArtifactStore, INFO_FILE_NAME, LABELS_FILE_NAME, MODEL_DIR_NAME};

/// 送信単位
const CHUNK_SIZE: usize = 64 * 1024;

/// チャネルに溜められるチャンク数
const CHANNEL_CAPACITY: usize = 8;

/// エクスポート結果のバイトストリーム
pub type ExportStream = ReceiverStream<io::Result<Bytes>>;

/// 保存済みモデルのエクスポーター
#[derive(Debug, Clone)]
pub struct ArtifactExporter {
    store: ArtifactStore,
}

impl ArtifactExporter {
    pub fn new(store: ArtifactStore) -> Self {
        Self { store }
    }

    fn ensure_persisted(&self) -> crate::error::Result<()> {
        if self.store.exists() {
            Ok(())
        } else {
            Err(LifecycleError::ArtifactNotFound(
                self.store.root().display().to_string(),
            ))
        }
    }

    /// アーカイブを書き出す（同期）
    pub fn export_to_writer<W: Write>(&self, writer: W) -> crate::error::Result<W> {
        self.ensure_persisted()?;
        write_archive(&self.store, writer).map_err(LifecycleError::PersistenceFailure)
    }

    /// アーカイブをストリームとして返す
    ///
    /// 読み出し側が遅ければ書き込み側も待つ。tokioランタイム上で呼ぶこと。
    pub fn export(&self) -> crate::error::Result<ExportStream> {
        self.ensure_persisted()?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let result = write_archive(&store, ChannelWriter::new(tx.clone()))
                .and_then(|mut writer| writer.flush().context("Failed to flush archive"));
            if let Err(e) = result {
                warn!("エクスポートに失敗しました: {:#}", e);
                tx.blocking_send(Err(io::Error::other(format!("{:#}", e)))).ok();
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

/// model/ 以下・labels.json・info.json をtar.gzで書き出す
fn write_archive<W: Write>(store: &ArtifactStore, writer: W) -> Result<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_dir(&mut tar_builder, &format!("{}/", MODEL_DIR_NAME))?;

    let model_dir = store.model_dir();
    for entry in WalkDir::new(&model_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.context("Failed to walk model directory")?;
        let relative = entry
            .path()
            .strip_prefix(&model_dir)
            .context("Unexpected path outside model directory")?;
        let name = format!(
            "{}/{}",
            MODEL_DIR_NAME,
            relative.to_string_lossy().replace('\\', "/")
        );

        if entry.file_type().is_dir() {
            append_dir(&mut tar_builder, &format!("{}/", name))?;
        } else {
            append_file(&mut tar_builder, &name, entry.path())?;
        }
    }

    append_file(&mut tar_builder, LABELS_FILE_NAME, &store.labels_path())?;
    append_file(&mut tar_builder, INFO_FILE_NAME, &store.info_path())?;

    // tarアーカイブを完成させる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")
}

fn base_header(entry_type: EntryType, size: u64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_dir<W: Write>(tar_builder: &mut Builder<W>, name: &str) -> Result<()> {
    let mut header = base_header(EntryType::Directory, 0, 0o755);
    header.set_path(name)?;
    header.set_cksum();
    tar_builder
        .append(&header, io::empty())
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// ファイルは読みながらアーカイブへ流す（全体をメモリに載せない）
fn append_file<W: Write>(tar_builder: &mut Builder<W>, name: &str, path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let size = file
        .metadata()
        .with_context(|| format!("Failed to read metadata of {:?}", path))?
        .len();
    let mut header = base_header(EntryType::Regular, size, 0o644);
    header.set_path(name)?;
    header.set_cksum();
    debug!("アーカイブに追加: {} ({} bytes)", name, size);
    tar_builder
        .append(&header, BufReader::new(file))
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// 書き込まれたバイトをチャンク単位でチャネルへ送る
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buffer: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(CHUNK_SIZE),
        ));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "export stream was dropped"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= CHUNK_SIZE {
            self.send_buffer()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer()
    }
}
