//! Checking whether a stage's output directory is complete.

use std::{
    fs::{self, File},
    io::{BufRead as _, BufReader, Read},
};

use flate2::read::MultiGzDecoder;

use super::{COMPLETION_MARKER, CompletionMarker, Compression, PARTIAL_SUFFIX};
use crate::prelude::*;

/// The state of a stage output directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutputStatus {
    /// The directory does not exist.
    Missing,
    /// No completion marker, or leftover `.partial` shards.
    Incomplete { reason: String },
    /// The marker exists but shards are missing or unreadable.
    Corrupt { reason: String },
    /// Everything checks out.
    Valid { records: usize },
}

impl StageOutputStatus {
    /// Is this output safe to read?
    pub fn is_valid(&self) -> bool {
        matches!(self, StageOutputStatus::Valid { .. })
    }
}

/// Check a stage output directory. A shallow check looks at the marker, file
/// names and shard sizes. A deep check also decompresses every shard and
/// compares record counts against the marker.
pub fn check_stage_output(dir: &Path, deep: bool) -> Result<StageOutputStatus> {
    if !dir.exists() {
        return Ok(StageOutputStatus::Missing);
    }

    let mut partials = vec![];
    for entry in fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(PARTIAL_SUFFIX) {
            partials.push(name);
        }
    }
    if !partials.is_empty() {
        partials.sort();
        return Ok(StageOutputStatus::Incomplete {
            reason: format!("unfinished shards: {}", partials.join(", ")),
        });
    }

    if !dir.join(COMPLETION_MARKER).exists() {
        return Ok(StageOutputStatus::Incomplete {
            reason: format!("no {COMPLETION_MARKER}"),
        });
    }
    let marker = match CompletionMarker::read(dir) {
        Ok(marker) => marker,
        Err(err) => {
            return Ok(StageOutputStatus::Corrupt {
                reason: format!("{err:#}"),
            });
        }
    };

    for shard in &marker.shards {
        let path = dir.join(&shard.file);
        let size = match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => {
                return Ok(StageOutputStatus::Corrupt {
                    reason: format!("missing shard {}", shard.file),
                });
            }
        };
        if size != shard.bytes {
            return Ok(StageOutputStatus::Corrupt {
                reason: format!(
                    "shard {} is {} bytes, but the marker says {}",
                    shard.file, size, shard.bytes
                ),
            });
        }
        if deep {
            match count_shard_records(&path) {
                Ok(records) if records == shard.records => {}
                Ok(records) => {
                    return Ok(StageOutputStatus::Corrupt {
                        reason: format!(
                            "shard {} has {} records, but the marker says {}",
                            shard.file, records, shard.records
                        ),
                    });
                }
                Err(err) => {
                    return Ok(StageOutputStatus::Corrupt {
                        reason: format!("shard {}: {err:#}", shard.file),
                    });
                }
            }
        }
    }
    Ok(StageOutputStatus::Valid {
        records: marker.total_records(),
    })
}

/// Open a shard for reading, decompressing if needed.
pub(crate) fn open_shard(path: &Path) -> Result<Box<dyn Read + Send>> {
    let compression = Compression::from_shard_path(path)
        .with_context(|| format!("not a shard: {}", path.display()))?;
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(match compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
        Compression::None => Box::new(file),
    })
}

/// Decompress a shard and count its records, checking that every line is
/// valid JSON.
pub fn count_shard_records(path: &Path) -> Result<usize> {
    let reader = BufReader::new(open_shard(path)?);
    let mut records = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("cannot read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        serde_json::from_str::<Value>(&line).with_context(|| {
            format!("invalid JSON on line {} of {}", idx + 1, path.display())
        })?;
        records += 1;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        document::Document,
        writer::{JsonlWriter, ShardSummary, StagingDir, WriterConfig},
    };

    async fn completed_stage(root: &Path, docs: usize) -> PathBuf {
        let output_dir = root.join("stage");
        let staging = StagingDir::create(&output_dir, "run").unwrap();
        let mut session = JsonlWriter::new(WriterConfig::default(), false)
            .open(staging.path(), 0)
            .unwrap();
        for i in 0..docs {
            session.write(&Document::new(format!("doc{i}"))).await.unwrap();
        }
        session.close().await.unwrap();
        staging
            .promote(&CompletionMarker {
                stage: "stage".to_owned(),
                run_id: "run".to_owned(),
                compression: Compression::Gzip,
                shards: vec![ShardSummary {
                    file: "00000.jsonl.gz".to_owned(),
                    records: docs,
                    bytes: session.bytes(),
                }],
            })
            .unwrap();
        output_dir
    }

    #[test]
    fn missing_and_unmarked_output() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("nothing");
        assert_eq!(
            check_stage_output(&dir, false).unwrap(),
            StageOutputStatus::Missing
        );
        fs::create_dir(&dir).unwrap();
        assert!(matches!(
            check_stage_output(&dir, false).unwrap(),
            StageOutputStatus::Incomplete { .. }
        ));
    }

    #[tokio::test]
    async fn leftover_partial_is_incomplete() {
        let root = tempfile::tempdir().unwrap();
        let dir = completed_stage(root.path(), 2).await;
        assert!(check_stage_output(&dir, true).unwrap().is_valid());
        fs::write(dir.join("00001.jsonl.gz.partial"), b"").unwrap();
        assert!(matches!(
            check_stage_output(&dir, false).unwrap(),
            StageOutputStatus::Incomplete { .. }
        ));
    }

    #[tokio::test]
    async fn truncated_shard_is_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let dir = completed_stage(root.path(), 50).await;
        let shard = dir.join("00000.jsonl.gz");
        let bytes = fs::read(&shard).unwrap();
        fs::write(&shard, &bytes[..bytes.len() / 2]).unwrap();

        for deep in [false, true] {
            assert!(matches!(
                check_stage_output(&dir, deep).unwrap(),
                StageOutputStatus::Corrupt { .. }
            ));
        }
    }

    #[tokio::test]
    async fn damaged_shard_of_the_same_size_is_corrupt_on_deep_check() {
        let root = tempfile::tempdir().unwrap();
        let dir = completed_stage(root.path(), 50).await;
        let shard = dir.join("00000.jsonl.gz");
        let mut bytes = fs::read(&shard).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        fs::write(&shard, &bytes).unwrap();

        // Sizes still match, so only decompressing finds the damage.
        assert!(check_stage_output(&dir, false).unwrap().is_valid());
        assert!(matches!(
            check_stage_output(&dir, true).unwrap(),
            StageOutputStatus::Corrupt { .. }
        ));
    }

    #[tokio::test]
    async fn missing_shard_is_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let dir = completed_stage(root.path(), 1).await;
        fs::remove_file(dir.join("00000.jsonl.gz")).unwrap();
        assert!(matches!(
            check_stage_output(&dir, false).unwrap(),
            StageOutputStatus::Corrupt { .. }
        ));
    }
}
