//! Job definition discovery and instantiation.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::jobs::sql::{SqlJob, is_inline};
use crate::jobs::{DataJob, JobRegistry};

const DEFINITION_EXTENSION: &str = "sql";

/// Length of the `YYYY_MM_DD_HHMMSS_` name prefix.
const TIMESTAMP_PREFIX_LEN: usize = 18;

/// Finds job definition files and turns them into runnable jobs.
#[derive(Debug, Clone)]
pub struct JobResolver {
    path: PathBuf,
    registry: JobRegistry,
}

impl JobResolver {
    pub fn new(path: impl Into<PathBuf>, registry: JobRegistry) -> Self {
        Self {
            path: path.into(),
            registry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Every `*_*.sql` file in the job directory, sorted by file name.
    ///
    /// A missing directory yields an empty list.
    pub fn list_job_files(&self) -> AppResult<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Job directory {} does not exist", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(AppError::FileSystem(format!(
                    "Failed to read job directory {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| AppError::FileSystem(format!("Failed to read job entry: {}", e)))?
                .path();

            let is_definition = path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(DEFINITION_EXTENSION)
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|s| s.contains('_'));

            if is_definition {
                files.push(path);
            }
        }

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// The definition file whose derived name is `name`.
    pub fn find_job_file(&self, name: &str) -> AppResult<Option<PathBuf>> {
        Ok(self
            .list_job_files()?
            .into_iter()
            .find(|path| Self::derive_name(path) == name))
    }

    /// Persisted job name: the file name without extension.
    pub fn derive_name(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Registry key for named definitions: timestamp prefix stripped, StudlyCase.
    pub fn derive_class_identity(path: &Path) -> String {
        let name = Self::derive_name(path);
        let stripped = strip_timestamp_prefix(&name).unwrap_or(&name);
        studly_case(stripped)
    }

    /// Build a fresh job instance for a definition file.
    pub fn instantiate(&self, path: &Path) -> AppResult<Box<dyn DataJob>> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::FileSystem(format!("Failed to read {}: {}", path.display(), e))
        })?;

        if is_inline(&content) {
            let job = SqlJob::parse(&path.display().to_string(), &content)?;
            return Ok(Box::new(job));
        }

        let identity = Self::derive_class_identity(path);
        self.registry.create(&identity).ok_or_else(|| {
            AppError::NotFound(format!(
                "Job type '{}' for {}",
                identity,
                path.display()
            ))
        })
    }
}

/// Strip a leading `YYYY_MM_DD_HHMMSS_`.
fn strip_timestamp_prefix(name: &str) -> Option<&str> {
    let prefix = name.as_bytes().get(..TIMESTAMP_PREFIX_LEN)?;
    let matches = prefix.iter().enumerate().all(|(i, b)| match i {
        4 | 7 | 10 | 17 => *b == b'_',
        _ => b.is_ascii_digit(),
    });

    if matches {
        name.get(TIMESTAMP_PREFIX_LEN..)
    } else {
        None
    }
}

fn studly_case(value: &str) -> String {
    value
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
