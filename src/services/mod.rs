pub mod jobs;
pub mod outputs;
pub mod polling;
pub mod supervisor;
