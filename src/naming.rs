//! Path conventions for temp and committed artifacts (spec §4.4).
//!
//! Committed files are named `<topic>+<partitionId>+<start>+<end>.<ext>`.
//! `+` is used as the separator both when constructing and when parsing a
//! name back apart, resolving the ambiguity the source left open (§9).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable identity of a partition within the process (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub topic: String,
    pub partition_id: u32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_id: u32) -> Self {
        Self {
            topic: topic.into(),
            partition_id,
        }
    }

    /// Directory holding this partition's temp and committed artifacts.
    pub fn dir(&self, root: &Path, topics_dir: &str) -> PathBuf {
        root.join(topics_dir)
            .join(&self.topic)
            .join(self.partition_id.to_string())
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh, collision-unlikely temp artifact path. Uniqueness is derived
/// from the process id and a monotonic in-process counter, which is
/// deterministic enough to test and needs no RNG dependency.
pub fn temp_path(root: &Path, topics_dir: &str, partition: &Partition) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    partition
        .dir(root, topics_dir)
        .join(format!("{pid}-{n}.tmp"))
}

/// Deterministic committed-file path for an offset range.
pub fn committed_path(
    root: &Path,
    topics_dir: &str,
    partition: &Partition,
    start: u64,
    end: u64,
    ext: &str,
) -> PathBuf {
    partition.dir(root, topics_dir).join(format!(
        "{}+{}+{}+{}.{}",
        partition.topic, partition.partition_id, start, end, ext
    ))
}

/// Parse a committed file's name into its `(start, end)` offset range.
/// Returns `None` if `name` is not a committed artifact name.
///
/// Topic names may themselves contain `+`, so parsing anchors on the last
/// three `+`-delimited fields from the right rather than splitting from the
/// left.
pub fn parse_committed(name: &str) -> Option<(u64, u64)> {
    let stem = name.rsplit_once('.')?.0;
    let mut parts: Vec<&str> = stem.rsplit('+').collect();
    if parts.len() < 4 {
        return None;
    }
    parts.truncate(4);
    // parts is [end, start, partition_id, topic..] in reverse order.
    let end: u64 = parts[0].parse().ok()?;
    let start: u64 = parts[1].parse().ok()?;
    parts[2].parse::<u32>().ok()?;
    if start > end {
        return None;
    }
    Some((start, end))
}

/// Predicate over a directory entry's file name, true iff it names a
/// committed artifact.
pub fn committed_filter(name: &str) -> bool {
    parse_committed(name).is_some()
}
