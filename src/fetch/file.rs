use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{ByteSource, SegmentFetcher};
use crate::errors::Result;
use crate::segment::Segment;

/// Serves segments stored as local part files.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl FileFetcher {
    /// Builds the segment list for `paths`, in the given order, sized by
    /// the files' current lengths.
    pub fn segments<P: AsRef<Path>>(
        paths: &[P],
    ) -> Result<Vec<Segment<PathBuf>>> {
        paths
            .iter()
            .map(|path| {
                let size = fs::metadata(path.as_ref())?.len();
                Ok(Segment::new(size, path.as_ref().to_path_buf()))
            })
            .collect()
    }
}

impl SegmentFetcher<PathBuf> for FileFetcher {
    fn fetch(
        &self,
        local_start: u64,
        local_end: u64,
        segment: &Segment<PathBuf>,
    ) -> anyhow::Result<ByteSource> {
        let path = &segment.handle;
        log::trace!(
            "file/{}: reading bytes {}-{}",
            path.display(),
            local_start,
            local_end
        );

        let mut file = File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.seek(SeekFrom::Start(local_start))
            .with_context(|| {
                format!("Failed to seek {} to {}", path.display(), local_start)
            })?;

        Ok(Box::new(file.take(local_end - local_start + 1)))
    }
}
