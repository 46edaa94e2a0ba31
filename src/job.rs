//! Print jobs: the source of commands the engine drains
//! while in the `Processing` state, decoupled from where they actually come
//! from (an in-memory list here; a streamed SD-card transfer or GUI queue
//! for a real host).

use async_trait::async_trait;

/// A sequence of lines to print, polled once per admission cycle while the
/// protocol is in `Processing`; `None` signals the job is exhausted and the
/// engine should move on to `Finishing`.
#[async_trait]
pub trait Job: Send + Sync {
    async fn get_next(&mut self) -> Option<String>;

    /// Current read position, in lines, for progress reporting.
    fn pos(&self) -> u64 {
        0
    }

    fn read_lines(&self) -> u64 {
        0
    }

    /// Total line count, if known.
    fn actual_lines(&self) -> Option<u64> {
        None
    }

    /// Whether the job still has more to give; used to decide whether
    /// admission should keep polling it.
    fn active(&self) -> bool;

    /// Whether user commands may be admitted alongside this job's own
    /// lines. `true` for most file jobs; a job that demands exclusive
    /// access to the line sets this `false`.
    fn runs_parallel(&self) -> bool {
        true
    }

    /// Whether this job's data already lives on the printer's SD card, so
    /// the engine drives it by sending `M24`/watching `M27` reports rather
    /// than streaming lines itself.
    fn is_sd_streamed(&self) -> bool {
        false
    }

    /// Called once firmware reports the job complete (`SD_DONE_PRINTING` or
    /// the in-memory job running dry). No-op for jobs that track completion
    /// purely through `active()`.
    fn mark_finished(&mut self) {}
}

/// A job that streams lines out of an in-memory string buffer, splitting on
/// `\n`, skipping blank lines and full-line comments (`;`), the way a host
/// reads a `.gcode` file off disk.
pub struct LinesJob {
    lines: std::vec::IntoIter<String>,
    total: u64,
    sent: u64,
}

impl LinesJob {
    pub fn from_text(text: &str) -> Self {
        let lines: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with(';'))
            .map(str::to_string)
            .collect();
        Self::from_lines(lines)
    }

    pub fn from_lines(lines: Vec<String>) -> Self {
        let total = lines.len() as u64;
        Self { lines: lines.into_iter(), total, sent: 0 }
    }
}

#[async_trait]
impl Job for LinesJob {
    async fn get_next(&mut self) -> Option<String> {
        let line = self.lines.next();
        if line.is_some() {
            self.sent += 1;
        }
        line
    }

    fn pos(&self) -> u64 {
        self.sent
    }

    fn read_lines(&self) -> u64 {
        self.sent
    }

    fn actual_lines(&self) -> Option<u64> {
        Some(self.total)
    }

    fn active(&self) -> bool {
        self.sent < self.total
    }
}

/// Marker for a job whose data is already resident on the printer's SD
/// card: the engine drives it by sending `M24`/watching `M27` reports
/// rather than streaming lines itself.
pub struct SdFilePrintjob {
    pub filename: String,
    started: bool,
    done: bool,
}

impl SdFilePrintjob {
    pub fn new(filename: impl Into<String>) -> Self {
        Self { filename: filename.into(), started: false, done: false }
    }

    /// Marks the print as finished once firmware reports it has completed
    /// the file.
    pub fn mark_done(&mut self) {
        self.done = true;
    }
}

#[async_trait]
impl Job for SdFilePrintjob {
    async fn get_next(&mut self) -> Option<String> {
        if self.started {
            return None;
        }
        self.started = true;
        Some(format!("M23 {}", self.filename))
    }

    fn active(&self) -> bool {
        !self.done
    }

    fn runs_parallel(&self) -> bool {
        false
    }

    fn is_sd_streamed(&self) -> bool {
        true
    }

    fn mark_finished(&mut self) {
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_job_skips_blank_and_comment_lines() {
        let mut job = LinesJob::from_text("G28\n; a comment\n\nG1 X1\n");
        assert_eq!(job.get_next().await.as_deref(), Some("G28"));
        assert_eq!(job.get_next().await.as_deref(), Some("G1 X1"));
        assert_eq!(job.get_next().await, None);
        assert_eq!(job.actual_lines(), Some(2));
        assert!(!job.active());
    }

    #[tokio::test]
    async fn lines_job_reports_progress() {
        let mut job = LinesJob::from_lines(vec!["G28".into(), "G1 X1".into()]);
        assert!(job.active());
        job.get_next().await;
        assert_eq!(job.pos(), 1);
        assert!(job.active());
        job.get_next().await;
        assert!(!job.active());
    }

    #[tokio::test]
    async fn sd_job_yields_select_command_once() {
        let mut job = SdFilePrintjob::new("print.gco");
        assert!(job.is_sd_streamed());
        assert!(!job.runs_parallel());
        assert_eq!(job.get_next().await.as_deref(), Some("M23 print.gco"));
        assert_eq!(job.get_next().await, None);
        assert!(job.active());
        job.mark_done();
        assert!(!job.active());
    }
}
