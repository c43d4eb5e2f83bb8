use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle of an alignment job.
///
/// Transitions only move forward: PENDING -> RUNNING -> DONE | ERROR, with
/// PENDING -> ERROR allowed when the worker cannot be launched or the job is
/// cancelled before launch.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Error)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

/// Area of interest in degrees (or pixel coordinates, as the worker sees fit).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Aoi {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Aoi {
    /// `north=<f>;south=<f>;east=<f>;west=<f>`, the form the worker parses.
    pub fn to_worker_arg(&self) -> String {
        format!(
            "north={};south={};east={};west={}",
            self.north, self.south, self.east, self.west
        )
    }
}

/// Artifact locations of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobOutputs {
    pub image_a_url: String,
    pub image_b_url: String,
    pub image_a_path: PathBuf,
    pub image_b_path: PathBuf,
}

/// A raster alignment job as persisted in the job document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub image_a_id: String,
    pub image_b_id: String,
    pub aoi: Aoi,
    pub outputs: Option<JobOutputs>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A fresh PENDING record with a newly allocated id.
    pub fn new(inputs: JobInputs) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            image_a_id: inputs.image_a_id,
            image_b_id: inputs.image_b_id,
            aoi: inputs.aoi,
            outputs: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `patch` into this record, refusing anything that breaks the state machine.
    pub fn apply(&mut self, patch: JobPatch) -> Result<(), TransitionError> {
        let next = patch.status.unwrap_or(self.status);

        if next != self.status && !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }
        if next == self.status && self.status.is_terminal() {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }

        let outputs = patch.outputs.or_else(|| self.outputs.clone());
        let error = patch.error.or_else(|| self.error.clone());

        match next {
            JobStatus::Done if outputs.is_none() || error.is_some() => {
                return Err(TransitionError::Incomplete(next));
            }
            JobStatus::Error if error.is_none() || outputs.is_some() => {
                return Err(TransitionError::Incomplete(next));
            }
            JobStatus::Pending | JobStatus::Running if outputs.is_some() || error.is_some() => {
                return Err(TransitionError::Incomplete(next));
            }
            _ => {}
        }

        self.status = next;
        self.outputs = outputs;
        self.error = error;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update merged into a job by the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub outputs: Option<JobOutputs>,
    pub error: Option<String>,
}

impl JobPatch {
    pub fn running() -> Self {
        Self {
            status: Some(JobStatus::Running),
            ..Default::default()
        }
    }

    pub fn done(outputs: JobOutputs) -> Self {
        Self {
            status: Some(JobStatus::Done),
            outputs: Some(outputs),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            outputs: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition from {from} to {to}")]
    Illegal { from: JobStatus, to: JobStatus },

    #[error("{0} requires exactly one of outputs or error")]
    Incomplete(JobStatus),
}

/// Body of `POST /api/jobs`. Every field is optional on the wire so that a
/// missing one surfaces as a validation failure rather than a parse error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[garde(required, length(min = 1, max = 255))]
    pub image_a_id: Option<String>,

    #[garde(required, length(min = 1, max = 255))]
    pub image_b_id: Option<String>,

    #[garde(required, dive)]
    pub aoi: Option<AoiRequest>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Validate)]
pub struct AoiRequest {
    #[garde(required)]
    pub north: Option<f64>,
    #[garde(required)]
    pub south: Option<f64>,
    #[garde(required)]
    pub east: Option<f64>,
    #[garde(required)]
    pub west: Option<f64>,
}

impl From<Aoi> for AoiRequest {
    fn from(aoi: Aoi) -> Self {
        Self {
            north: Some(aoi.north),
            south: Some(aoi.south),
            east: Some(aoi.east),
            west: Some(aoi.west),
        }
    }
}

impl CreateJobRequest {
    pub fn new(image_a_id: impl Into<String>, image_b_id: impl Into<String>, aoi: Aoi) -> Self {
        Self {
            image_a_id: Some(image_a_id.into()),
            image_b_id: Some(image_b_id.into()),
            aoi: Some(aoi.into()),
        }
    }

    /// Validate and unwrap into the immutable inputs of a job.
    pub fn into_inputs(self) -> Result<JobInputs, String> {
        self.validate().map_err(|report| report.to_string())?;

        let (Some(image_a_id), Some(image_b_id), Some(aoi)) =
            (self.image_a_id, self.image_b_id, self.aoi)
        else {
            return Err("image references and aoi are required".to_string());
        };
        let (Some(north), Some(south), Some(east), Some(west)) =
            (aoi.north, aoi.south, aoi.east, aoi.west)
        else {
            return Err("aoi requires north, south, east and west".to_string());
        };

        for (field, value) in [("imageAId", &image_a_id), ("imageBId", &image_b_id)] {
            if !is_plain_file_name(value) {
                return Err(format!("{field} must be a plain file name"));
            }
        }

        Ok(JobInputs {
            image_a_id,
            image_b_id,
            aoi: Aoi {
                north,
                south,
                east,
                west,
            },
        })
    }
}

/// Upload identifiers resolve under the uploads directory; anything that
/// could escape it is refused.
fn is_plain_file_name(value: &str) -> bool {
    !value.trim().is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

/// Validated inputs of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInputs {
    pub image_a_id: String,
    pub image_b_id: String,
    pub aoi: Aoi,
}
