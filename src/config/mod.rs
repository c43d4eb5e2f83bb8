use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root directory holding uploads, job outputs and the job document.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Executable launched once per job.
    #[serde(default = "default_worker_program")]
    pub worker_program: String,

    /// Script passed as the first argument to the worker program.
    /// An empty value launches the program with the contract flags only.
    #[serde(default = "default_worker_script")]
    pub worker_script: String,

    /// URL prefix under which job output directories are served.
    #[serde(default = "default_output_url_prefix")]
    pub output_url_prefix: String,

    /// Check that both artifacts exist before marking a job DONE.
    #[serde(default)]
    pub verify_artifacts: bool,

    /// Move an unreadable job document aside and start empty instead of halting.
    #[serde(default)]
    pub reinitialize_corrupt_store: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_worker_program() -> String {
    "python3".to_string()
}

fn default_worker_script() -> String {
    "./worker/worker.py".to_string()
}

fn default_output_url_prefix() -> String {
    "/data/outputs".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.data_dir.join("outputs")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir.join("jobs.json")
    }

    /// Arguments placed before the contract flags on every worker invocation.
    pub fn worker_leading_args(&self) -> Vec<String> {
        if self.worker_script.trim().is_empty() {
            Vec::new()
        } else {
            vec![self.worker_script.clone()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AppConfig {
        AppConfig {
            bind_addr: default_bind_addr(),
            data_dir: PathBuf::from("/srv/raster"),
            worker_program: default_worker_program(),
            worker_script: default_worker_script(),
            output_url_prefix: default_output_url_prefix(),
            verify_artifacts: false,
            reinitialize_corrupt_store: false,
        }
    }

    #[test]
    fn test_derived_paths() {
        let config = sample_config();
        assert_eq!(config.uploads_dir(), PathBuf::from("/srv/raster/uploads"));
        assert_eq!(config.outputs_dir(), PathBuf::from("/srv/raster/outputs"));
        assert_eq!(config.jobs_file(), PathBuf::from("/srv/raster/jobs.json"));
    }

    #[test]
    fn test_empty_worker_script_is_omitted() {
        let mut config = sample_config();
        assert_eq!(config.worker_leading_args(), vec!["./worker/worker.py".to_string()]);
        config.worker_script = "  ".to_string();
        assert!(config.worker_leading_args().is_empty());
    }
}
