use std::path::{Path, PathBuf};

use crate::models::job::JobOutputs;

/// Clipped first image, written by the worker into the job's output directory.
pub const IMAGE_A_ARTIFACT: &str = "A_clipped.tif";

/// Clipped and aligned second image.
pub const IMAGE_B_ARTIFACT: &str = "B_clipped_aligned.tif";

/// Where job outputs live on disk and under which URL they are served.
///
/// Resolution is purely derived from the job id; the filesystem is never
/// consulted here.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    url_prefix: String,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    /// Output directory owned by a single job.
    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn resolve(&self, job_id: &str) -> JobOutputs {
        let dir = self.job_dir(job_id);
        JobOutputs {
            image_a_url: format!("{}/{}/{}", self.url_prefix, job_id, IMAGE_A_ARTIFACT),
            image_b_url: format!("{}/{}/{}", self.url_prefix, job_id, IMAGE_B_ARTIFACT),
            image_a_path: dir.join(IMAGE_A_ARTIFACT),
            image_b_path: dir.join(IMAGE_B_ARTIFACT),
        }
    }
}
