use std::path::{Path, PathBuf};

use nbexec_shared::JobManifest;

use crate::workspace::Workspace;

/// Everything one execution needs, built once by staging and only read afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: String,
    pub manifest: JobManifest,
    pub workdir: PathBuf,
    /// declared resources that could not be fetched
    pub missing_resources: Vec<String>,
}

impl JobContext {
    pub fn new(job_id: &str, manifest: JobManifest, workdir: &Path) -> Self {
        Self {
            job_id: job_id.to_string(),
            manifest,
            workdir: workdir.to_path_buf(),
            missing_resources: Vec::new(),
        }
    }

    pub fn entry_script(&self) -> &str {
        &self.manifest.entry_script
    }

    /// full local path of the staged entry script
    pub fn entry_path(&self) -> PathBuf {
        self.workdir.join(&self.manifest.entry_script)
    }

    /// positional arguments handed to a script: the parameters, then the
    /// comma separated resource names if there are any
    pub fn script_arguments(&self) -> Vec<String> {
        let mut arguments = vec![self.manifest.parameters.clone()];
        if !self.manifest.resources.is_empty() {
            arguments.push(self.manifest.resources.join(","));
        }
        arguments
    }
}

/// A staged job: its context plus the workspace guard owning the files.
#[derive(Debug)]
pub struct StagedJob {
    pub context: JobContext,
    pub workspace: Workspace,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_script_arguments_without_resources() {
        let manifest = JobManifest::new("job-42", "run.sh", "--fast", &[]);
        let context = JobContext::new("job-42", manifest, Path::new("/tmp/job-42"));
        assert_eq!(vec!["--fast".to_string()], context.script_arguments());
        assert_eq!(PathBuf::from("/tmp/job-42/run.sh"), context.entry_path());
    }

    #[test]
    fn test_script_arguments_with_resources() {
        let manifest = JobManifest::new("job-1", "run.sh", "", &["a.csv", "b.csv"]);
        let context = JobContext::new("job-1", manifest, Path::new("/tmp/job-1"));
        assert_eq!(
            vec!["".to_string(), "a.csv,b.csv".to_string()],
            context.script_arguments()
        );
    }
}
