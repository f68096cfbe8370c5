//! Completion notifications.

use crate::job::JobRecord;

/// Told once about every finished job that has a notification target.
///
/// Called on the job's execution thread after the terminal state is
/// durable. Implementations should not block for long.
pub trait Notifier: Send + Sync {
    fn job_finished(&self, record: &JobRecord) -> Result<(), String>;
}

/// Writes a one-line summary to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn job_finished(&self, record: &JobRecord) -> Result<(), String> {
        log::info!("{}", summary(record));
        Ok(())
    }
}

/// Human-readable outcome line for a finished job.
pub fn summary(record: &JobRecord) -> String {
    let target = record.notification_target.as_deref().unwrap_or("-");
    let mut line = format!(
        "[notify {}] job {} for '{}' ended {}: {} found of {} checked",
        target, record.id, record.params.keyword, record.state, record.found, record.checked
    );
    if let Some(ms) = record.duration_ms {
        line.push_str(&format!(" in {:.1}s", ms as f64 / 1000.0));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(" ({})", error));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobParams, JobSource, JobState, Priority};

    #[test]
    fn test_summary() {
        let mut record =
            JobRecord::new(JobParams::new("cats", 10), Priority::INTERACTIVE, JobSource::Interactive);
        record.notification_target = Some("ops@example.com".to_string());
        record.state = JobState::Error;
        record.checked = 12;
        record.found = 3;
        record.duration_ms = Some(2500);
        record.error = Some("Job timed out".to_string());

        let line = summary(&record);
        assert!(line.contains("ops@example.com"));
        assert!(line.contains("'cats' ended error: 3 found of 12 checked in 2.5s"));
        assert!(line.ends_with("(Job timed out)"));
        assert!(LogNotifier.job_finished(&record).is_ok());
    }
}
