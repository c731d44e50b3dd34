//! Durable, resumable stage output.
//!
//! Each stage task owns one [`WriterSession`], which streams records to a
//! `.partial` shard and only renames it into place when explicitly closed.
//! A stage's shards are staged in a hidden directory, and only promoted to the
//! stage's output directory (along with a [`CompletionMarker`]) once every
//! task has finished successfully. This means that a crashed or interrupted
//! run never leaves behind output which looks complete.

use std::{
    collections::HashSet,
    fmt,
    fs::{self, File},
    io::{BufWriter, Write as _},
    mem,
    sync::{LazyLock, Mutex},
};

use clap::ValueEnum;
use flate2::{Compression as GzLevel, write::GzEncoder};
use schemars::JsonSchema;

use crate::{
    async_utils::blocking_iter_streams::spawn_blocking_propagating_panics, document::Document,
    prelude::*,
};

pub mod reader;
pub mod validate;

/// Name of the marker file written once a stage's output is complete.
pub const COMPLETION_MARKER: &str = "_COMPLETED.json";

/// Suffix for shards which are still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Destinations which currently have an open [`WriterSession`].
static OPEN_DESTINATIONS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// How to compress output shards.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Gzip each shard. This is the default.
    #[default]
    Gzip,
    /// Plain JSONL.
    None,
}

impl Compression {
    /// The file extension used for shards.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Gzip => "jsonl.gz",
            Compression::None => "jsonl",
        }
    }

    /// Guess the compression of a shard from its file name.
    pub fn from_shard_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".jsonl.gz") {
            Some(Compression::Gzip)
        } else if name.ends_with(".jsonl") {
            Some(Compression::None)
        } else {
            None
        }
    }
}

/// Configuration for a [`JsonlWriter`].
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterConfig {
    /// Shard compression.
    pub compression: Compression,

    /// Flush buffered output every N records.
    pub flush_every: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Gzip,
            flush_every: 100,
        }
    }
}

/// Writes JSONL shards for a stage.
#[derive(Clone, Debug)]
pub struct JsonlWriter {
    config: WriterConfig,
    save_media_bytes: bool,
}

impl JsonlWriter {
    /// Create a new writer.
    pub fn new(config: WriterConfig, save_media_bytes: bool) -> Self {
        Self {
            config,
            save_media_bytes,
        }
    }

    /// Our compression setting.
    pub fn compression(&self) -> Compression {
        self.config.compression
    }

    /// The shard file name for a task rank.
    pub fn shard_name(&self, rank: usize) -> String {
        format!("{:05}.{}", rank, self.config.compression.extension())
    }

    /// Open a session writing the shard for `rank` inside `dir`.
    pub fn open(&self, dir: &Path, rank: usize) -> Result<WriterSession> {
        WriterSession::open(
            dir.join(self.shard_name(rank)),
            self.config.compression,
            self.config.flush_every.max(1),
            self.save_media_bytes,
        )
    }
}

/// The underlying output stream of a session.
enum SessionOutput {
    Gzip(GzEncoder<BufWriter<File>>),
    Plain(BufWriter<File>),
}

impl SessionOutput {
    fn writer(&mut self) -> &mut dyn std::io::Write {
        match self {
            SessionOutput::Gzip(encoder) => encoder,
            SessionOutput::Plain(writer) => writer,
        }
    }

    /// Append serialized records and push them through to the file.
    fn write_batch(&mut self, batch: &[u8]) -> Result<()> {
        let writer = self.writer();
        writer.write_all(batch).context("cannot write records")?;
        writer.flush().context("cannot flush output")
    }

    /// Finish any compression and return the underlying file.
    fn finish(self) -> Result<File> {
        let buffered = match self {
            SessionOutput::Gzip(encoder) => {
                encoder.finish().context("cannot finish gzip stream")?
            }
            SessionOutput::Plain(writer) => writer,
        };
        buffered
            .into_inner()
            .map_err(|err| err.into_error())
            .context("cannot flush output")
    }
}

/// An open output shard.
///
/// Records are serialized into memory and handed to a blocking thread every
/// `flush_every` records, which compresses them into `<destination>.partial`.
/// [`WriterSession::close`] flushes, syncs and renames the shard into place.
/// Closing twice is a no-op. Dropping an open session leaves the `.partial`
/// file behind, which validation reports as incomplete.
pub struct WriterSession {
    destination: PathBuf,
    partial_path: PathBuf,
    output: Option<SessionOutput>,
    pending: Vec<u8>,
    registered: bool,
    flush_every: usize,
    save_media_bytes: bool,
    records: usize,
    bytes: u64,
}

impl WriterSession {
    /// Open a new session. Fails if another session is already writing to
    /// `destination`.
    pub fn open(
        destination: PathBuf,
        compression: Compression,
        flush_every: usize,
        save_media_bytes: bool,
    ) -> Result<Self> {
        {
            let mut open = OPEN_DESTINATIONS.lock().expect("lock poisoned");
            if !open.insert(destination.clone()) {
                return Err(anyhow!(
                    "another writer session is already open for {}",
                    destination.display()
                ));
            }
        }

        let mut session = Self {
            partial_path: partial_path(&destination),
            destination,
            output: None,
            pending: vec![],
            registered: true,
            flush_every,
            save_media_bytes,
            records: 0,
            bytes: 0,
        };
        let file = File::create(&session.partial_path).with_context(|| {
            format!("cannot create {}", session.partial_path.display())
        })?;
        let buffered = BufWriter::new(file);
        session.output = Some(match compression {
            Compression::Gzip => {
                SessionOutput::Gzip(GzEncoder::new(buffered, GzLevel::default()))
            }
            Compression::None => SessionOutput::Plain(buffered),
        });
        debug!(path = %session.partial_path.display(), "opened writer session");
        Ok(session)
    }

    /// How many records have we written?
    pub fn records(&self) -> usize {
        self.records
    }

    /// Size of the finished shard on disk. Zero until closed.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Is this session still accepting records?
    pub fn is_open(&self) -> bool {
        self.output.is_some()
    }

    fn closed_error(&self) -> anyhow::Error {
        anyhow!(
            "writer session for {} is already closed",
            self.destination.display()
        )
    }

    /// Append a document as one JSON line.
    pub async fn write(&mut self, document: &Document) -> Result<()> {
        if self.output.is_none() {
            return Err(self.closed_error());
        }
        let record = document.to_record(self.save_media_bytes)?;
        serde_json::to_writer(&mut self.pending, &record)
            .with_context(|| format!("cannot write record {:?}", document.id))?;
        self.pending.push(b'\n');
        self.records += 1;
        if self.records % self.flush_every == 0 {
            self.flush().await?;
        }
        Ok(())
    }

    /// Compress and write any buffered records on a blocking thread.
    pub async fn flush(&mut self) -> Result<()> {
        let mut output = self.output.take().ok_or_else(|| self.closed_error())?;
        let batch = mem::take(&mut self.pending);
        let (output, result) = spawn_blocking_propagating_panics(move || {
            let result = output.write_batch(&batch);
            (output, result)
        })
        .await;
        self.output = Some(output);
        result
    }

    /// Flush, sync and promote the shard. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        let result = match self.output.take() {
            Some(output) => {
                let batch = mem::take(&mut self.pending);
                let partial_path = self.partial_path.clone();
                let destination = self.destination.clone();
                spawn_blocking_propagating_panics(move || {
                    finish_shard(output, &batch, &partial_path, &destination)
                })
                .await
            }
            None => Ok(self.bytes),
        };
        self.release();
        self.bytes = result?;
        debug!(
            path = %self.destination.display(),
            records = self.records,
            bytes = self.bytes,
            "closed writer session"
        );
        Ok(())
    }

    /// Allow another session to open our destination.
    fn release(&mut self) {
        if self.registered {
            OPEN_DESTINATIONS
                .lock()
                .expect("lock poisoned")
                .remove(&self.destination);
            self.registered = false;
        }
    }
}

/// Write the last batch, finish the container, sync, and rename the shard
/// into place. Returns the size of the finished shard.
fn finish_shard(
    mut output: SessionOutput,
    batch: &[u8],
    partial_path: &Path,
    destination: &Path,
) -> Result<u64> {
    output.write_batch(batch)?;
    let file = output.finish()?;
    file.sync_all()
        .with_context(|| format!("cannot sync {}", partial_path.display()))?;
    let bytes = file
        .metadata()
        .with_context(|| format!("cannot stat {}", partial_path.display()))?
        .len();
    drop(file);
    fs::rename(partial_path, destination).with_context(|| {
        format!(
            "cannot rename {} to {}",
            partial_path.display(),
            destination.display()
        )
    })?;
    Ok(bytes)
}

impl fmt::Debug for WriterSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSession")
            .field("destination", &self.destination)
            .field("open", &self.is_open())
            .field("records", &self.records)
            .finish()
    }
}

impl Drop for WriterSession {
    fn drop(&mut self) {
        if self.output.is_some() {
            warn!(
                path = %self.partial_path.display(),
                "writer session dropped without being closed; output is incomplete"
            );
        }
        self.release();
    }
}

/// The `.partial` path for a shard.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Per-shard summary recorded in the [`CompletionMarker`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ShardSummary {
    /// Shard file name, relative to the stage directory.
    pub file: String,
    /// Number of records in the shard.
    pub records: usize,
    /// Size of the shard file in bytes.
    pub bytes: u64,
}

/// Written as `_COMPLETED.json` once a stage's output is final.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct CompletionMarker {
    /// Stage which produced this output.
    pub stage: String,
    /// Run which produced this output.
    pub run_id: String,
    /// Shard compression.
    pub compression: Compression,
    /// Every shard, in rank order.
    pub shards: Vec<ShardSummary>,
}

impl CompletionMarker {
    /// Total number of records across all shards.
    pub fn total_records(&self) -> usize {
        self.shards.iter().map(|s| s.records).sum()
    }

    /// Read the marker in `dir`.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(COMPLETION_MARKER);
        let data = fs::read(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("cannot parse {}", path.display()))
    }

    fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(COMPLETION_MARKER);
        let mut file = File::create(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }
}

/// A hidden directory where a stage writes shards before they are promoted.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    output_dir: PathBuf,
}

impl StagingDir {
    /// Create a fresh staging directory next to `output_dir`, removing
    /// leftovers from earlier runs that were interrupted.
    pub fn create(output_dir: &Path, run_id: &str) -> Result<Self> {
        let parent = output_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let name = output_dir
            .file_name()
            .with_context(|| format!("bad output directory {}", output_dir.display()))?
            .to_string_lossy()
            .into_owned();
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;

        let prefix = format!(".{name}.inprogress-");
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                warn!(path = %entry.path().display(), "removing stale staging directory");
                fs::remove_dir_all(entry.path())?;
            }
        }

        let path = parent.join(format!("{prefix}{run_id}"));
        fs::create_dir_all(&path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        Ok(Self {
            path,
            output_dir: output_dir.to_owned(),
        })
    }

    /// Where task shards are written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the completion marker and swap the staged shards into the
    /// output directory.
    pub fn promote(self, marker: &CompletionMarker) -> Result<()> {
        for shard in &marker.shards {
            let shard_path = self.path.join(&shard.file);
            if !shard_path.is_file() {
                return Err(anyhow!(
                    "shard {} was never closed",
                    shard_path.display()
                ));
            }
        }
        marker.write(&self.path)?;
        if self.output_dir.exists() {
            fs::remove_dir_all(&self.output_dir).with_context(|| {
                format!("cannot replace {}", self.output_dir.display())
            })?;
        }
        fs::rename(&self.path, &self.output_dir).with_context(|| {
            format!(
                "cannot move {} to {}",
                self.path.display(),
                self.output_dir.display()
            )
        })?;
        info!(
            path = %self.output_dir.display(),
            records = marker.total_records(),
            "stage output complete"
        );
        Ok(())
    }

    /// Throw away staged output after a failure. Nothing is promoted.
    pub fn discard(self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), "cannot remove staging directory: {err}");
        }
    }
}
