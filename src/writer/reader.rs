//! Reading finished stage output back as documents.

use std::{
    collections::VecDeque,
    io::{BufRead as _, BufReader, Lines, Read},
};

use futures::StreamExt as _;

use super::{CompletionMarker, validate::open_shard, validate::check_stage_output};
use crate::{
    async_utils::{BoxedStream, blocking_iter_streams::BlockingIterStream},
    document::Document,
    prelude::*,
};

/// The finished output of an earlier stage.
#[derive(Clone, Debug)]
pub struct StageOutput {
    dir: PathBuf,
    marker: CompletionMarker,
}

impl StageOutput {
    /// Open a stage output directory. Fails unless the output is finalized.
    pub fn open(dir: &Path) -> Result<Self> {
        let status = check_stage_output(dir, false)?;
        if !status.is_valid() {
            return Err(anyhow!(
                "stage output {} is not finalized: {:?}",
                dir.display(),
                status
            ));
        }
        Ok(Self {
            dir: dir.to_owned(),
            marker: CompletionMarker::read(dir)?,
        })
    }

    /// The completion marker.
    pub fn marker(&self) -> &CompletionMarker {
        &self.marker
    }

    /// Shard paths, in rank order.
    pub fn shard_paths(&self) -> Vec<PathBuf> {
        self.marker
            .shards
            .iter()
            .map(|shard| self.dir.join(&shard.file))
            .collect()
    }

    /// Read the documents assigned to `rank` out of `world_size` tasks.
    /// Shards are assigned round-robin, so every document goes to exactly one
    /// task.
    pub fn read_for_rank(
        &self,
        rank: usize,
        world_size: usize,
    ) -> BoxedStream<Result<Document>> {
        let shards = self
            .shard_paths()
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| idx % world_size == rank)
            .map(|(_, path)| path)
            .collect();
        BlockingIterStream::new(ShardIter::new(shards)).boxed()
    }

    /// Read every document.
    pub fn read_all(&self) -> BoxedStream<Result<Document>> {
        self.read_for_rank(0, 1)
    }
}

/// Blocking iterator over the documents in a list of shards.
struct ShardIter {
    pending: VecDeque<PathBuf>,
    current: Option<(PathBuf, Lines<BufReader<Box<dyn Read + Send>>>)>,
}

impl ShardIter {
    fn new(pending: VecDeque<PathBuf>) -> Self {
        Self {
            pending,
            current: None,
        }
    }
}

impl Iterator for ShardIter {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((path, lines)) = &mut self.current {
                match lines.next() {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => {
                        return Some(serde_json::from_str(&line).with_context(|| {
                            format!("cannot parse record in {}", path.display())
                        }));
                    }
                    Some(Err(err)) => {
                        let err = anyhow::Error::new(err)
                            .context(format!("cannot read {}", path.display()));
                        // Don't keep reading a broken shard.
                        self.current = None;
                        self.pending.clear();
                        return Some(Err(err));
                    }
                    None => self.current = None,
                }
            }
            let path = self.pending.pop_front()?;
            match open_shard(&path) {
                Ok(reader) => self.current = Some((path, BufReader::new(reader).lines())),
                Err(err) => {
                    self.pending.clear();
                    return Some(Err(err));
                }
            }
        }
    }
}
