use std::collections::BTreeMap;
use std::sync::LazyLock;

use log::{debug, info, warn};
use regex::Regex;

use crate::error::IngestError;
use crate::types::{DownloadTask, FileFormat, ResourceDescriptor};

static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}").expect("valid year regex"));

/// First run of four digits in a resource name.
pub fn extract_year(name: &str) -> Option<i32> {
    YEAR_RE.find(name).and_then(|m| m.as_str().parse().ok())
}

/// Resolved selection parameters for one run.
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub start_year: i32,
    pub end_year: i32,
    pub preferences: &'a [FileFormat],
    pub package: &'a str,
    pub bucket: Option<&'a str>,
    pub current_year: i32,
}

struct Candidate<'r> {
    rank: usize,
    format: FileFormat,
    resource: &'r ResourceDescriptor,
}

impl Selection<'_> {
    fn rank(&self, resource: &ResourceDescriptor) -> Option<(usize, FileFormat)> {
        if resource.url.trim().is_empty() {
            return None;
        }
        let format = resource.format.parse::<FileFormat>().ok()?;
        self.preferences
            .iter()
            .position(|p| *p == format)
            .map(|rank| (rank, format))
    }

    fn task(&self, candidate: &Candidate<'_>, year: i32) -> DownloadTask {
        DownloadTask {
            url: candidate.resource.url.clone(),
            year,
            package: self.package.to_string(),
            format: candidate.format,
            bucket: self.bucket.map(str::to_string),
        }
    }

    /// Picks one resource per year in range, best format first. Falls back to the
    /// best undated resource when no dated resource matched.
    pub fn select_tasks(
        &self,
        resources: &[ResourceDescriptor],
    ) -> Result<Vec<DownloadTask>, IngestError> {
        info!(
            "Selecting from {} resources for {} in {}..={}",
            resources.len(),
            self.package,
            self.start_year,
            self.end_year
        );

        let mut by_year: BTreeMap<i32, Candidate<'_>> = BTreeMap::new();
        let mut undated: Option<Candidate<'_>> = None;

        for resource in resources {
            let Some((rank, format)) = self.rank(resource) else {
                debug!("Skipping resource {:?}: unsupported format or empty URL", resource.name);
                continue;
            };
            let candidate = Candidate {
                rank,
                format,
                resource,
            };

            match extract_year(&resource.name) {
                Some(year) if (self.start_year..=self.end_year).contains(&year) => {
                    match by_year.get(&year) {
                        Some(best) if best.rank <= rank => {}
                        _ => {
                            by_year.insert(year, candidate);
                        }
                    }
                }
                Some(year) => debug!("Skipping resource {:?}: year {} out of range", resource.name, year),
                None => {
                    if undated.as_ref().map_or(true, |best| rank < best.rank) {
                        undated = Some(candidate);
                    }
                }
            }
        }

        let mut tasks: Vec<DownloadTask> = by_year
            .iter()
            .map(|(year, candidate)| self.task(candidate, *year))
            .collect();

        if tasks.is_empty() {
            if let Some(candidate) = undated {
                warn!(
                    "No dated resource in range, falling back to undated {:?} tagged as {}",
                    candidate.resource.name, self.current_year
                );
                tasks.push(self.task(&candidate, self.current_year));
            }
        }

        if tasks.is_empty() {
            return Err(IngestError::NoResourcesSelected {
                package: self.package.to_string(),
                start: self.start_year,
                end: self.end_year,
            });
        }

        info!("Selected {} download tasks", tasks.len());
        for task in &tasks {
            info!("Download task: {} ({}, {})", task.url, task.year, task.format);
        }
        Ok(tasks)
    }
}
