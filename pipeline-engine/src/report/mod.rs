// Result Reporter
// Aggregates run results into a report and renders it as JSON, JUnit XML or terminal text

use crate::definition::TriggerEvent;
use crate::error::ExecutionError;
use crate::execution::result::{JobResult, JobStatus, RunResult, StepResult, StepStatus, Verdict};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Output format for run reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    /// Machine-readable JSON
    #[default]
    Json,
    /// JUnit XML: one test suite per job, one test case per step
    JUnit,
    /// Human-readable summary
    Terminal,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::JUnit => write!(f, "junit"),
            ReportFormat::Terminal => write!(f, "terminal"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "junit" | "junit-xml" | "xml" => Ok(ReportFormat::JUnit),
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: json, junit, terminal",
                s
            )),
        }
    }
}

/// Everything known about one pipeline invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pipeline: String,
    pub event: TriggerEvent,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub verdict: Verdict,
    /// Jobs in declaration order
    pub jobs: Vec<JobReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    pub status: JobStatus,
    pub optional: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub kind: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ExecutionError>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl RunReport {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|j| j.status == status).count()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl From<&StepResult> for StepReport {
    fn from(step: &StepResult) -> Self {
        Self {
            name: step.step_name.clone(),
            kind: step.kind.to_string(),
            status: step.status,
            exit_code: step.exit_code,
            duration_ms: millis(step.duration),
            error: step.error.clone(),
            warnings: step.warnings.clone(),
            stdout: step.stdout.clone(),
            stderr: step.stderr.clone(),
        }
    }
}

impl From<&JobResult> for JobReport {
    fn from(job: &JobResult) -> Self {
        Self {
            name: job.job_name.clone(),
            status: job.status,
            optional: job.optional,
            duration_ms: millis(job.duration),
            error: job.error.clone(),
            steps: job.steps.iter().map(StepReport::from).collect(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Builds, renders and persists run reports
pub struct ResultReporter;

impl ResultReporter {
    /// Aggregate a run result into a report
    pub fn build(
        run: &RunResult,
        event: &TriggerEvent,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> RunReport {
        RunReport {
            pipeline: run.pipeline_name.clone(),
            event: event.clone(),
            started_at,
            completed_at,
            duration_ms: millis(run.duration),
            verdict: run.verdict,
            jobs: run.jobs.iter().map(JobReport::from).collect(),
        }
    }

    /// Render a report in the specified format
    pub fn render(report: &RunReport, format: ReportFormat) -> Result<String, ReportError> {
        match format {
            ReportFormat::Json => Self::to_json(report),
            ReportFormat::JUnit => Ok(Self::to_junit_xml(report)),
            ReportFormat::Terminal => Ok(Self::to_terminal(report)),
        }
    }

    /// Write a rendered report, creating parent directories
    pub fn write_report(
        report: &RunReport,
        path: &Path,
        format: ReportFormat,
    ) -> Result<(), ReportError> {
        let rendered = Self::render(report, format)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, rendered)?;

        tracing::debug!(path = %path.display(), %format, "wrote run report");
        Ok(())
    }

    pub fn to_json(report: &RunReport) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(report)?)
    }

    /// Generate JUnit XML output
    ///
    /// Failed steps become `<failure>`, skipped steps `<skipped>`.
    pub fn to_junit_xml(report: &RunReport) -> String {
        let total: usize = report.jobs.iter().map(|j| j.steps.len()).sum();
        let failures = count_steps(report, StepStatus::Failed);
        let skipped = count_steps(report, StepStatus::Skipped);

        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(&format!(
            "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" errors=\"0\" time=\"{:.3}\" timestamp=\"{}\">\n",
            xml_escape(&report.pipeline),
            total,
            failures,
            skipped,
            report.duration().as_secs_f64(),
            report.started_at.to_rfc3339()
        ));

        for job in &report.jobs {
            let job_failures = job
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .count();
            let job_skipped = job
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Skipped)
                .count();

            xml.push_str(&format!(
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" errors=\"0\" time=\"{:.3}\">\n",
                xml_escape(&job.name),
                job.steps.len(),
                job_failures,
                job_skipped,
                job.duration_ms as f64 / 1000.0
            ));

            for step in &job.steps {
                xml.push_str(&format!(
                    "    <testcase classname=\"{}\" name=\"{}\" time=\"{:.3}\"",
                    xml_escape(&job.name),
                    xml_escape(&step.name),
                    step.duration_ms as f64 / 1000.0
                ));

                match step.status {
                    StepStatus::Succeeded => xml.push_str(" />\n"),
                    StepStatus::Skipped => {
                        xml.push_str(">\n");
                        xml.push_str("      <skipped />\n");
                        xml.push_str("    </testcase>\n");
                    }
                    StepStatus::Failed => {
                        let message = step
                            .error
                            .as_ref()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "Step failed".to_string());

                        xml.push_str(">\n");
                        xml.push_str(&format!(
                            "      <failure message=\"{}\">",
                            xml_escape(&message)
                        ));
                        xml.push_str(&xml_escape(&step.stderr));
                        xml.push_str("</failure>\n");
                        if !step.stdout.is_empty() {
                            xml.push_str(&format!(
                                "      <system-out>{}</system-out>\n",
                                xml_escape(&step.stdout)
                            ));
                        }
                        xml.push_str("    </testcase>\n");
                    }
                }
            }

            xml.push_str("  </testsuite>\n");
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    /// Generate human-readable terminal output
    pub fn to_terminal(report: &RunReport) -> String {
        let mut out = String::new();

        // Header
        out.push_str(&format!(
            "\nPipeline: {} ({} on {})\n",
            report.pipeline, report.event.kind, report.event.branch
        ));
        out.push_str(&"=".repeat(60));
        out.push('\n');

        for job in &report.jobs {
            let symbol = match job.status {
                JobStatus::Succeeded => "+",
                JobStatus::Skipped => "-",
                _ => "x",
            };
            let optional = if job.optional { " (optional)" } else { "" };

            out.push_str(&format!(
                "  [{}] {:<9} ({:.2}s) {}{}\n",
                symbol,
                job.status.to_string().to_uppercase(),
                job.duration_ms as f64 / 1000.0,
                job.name,
                optional,
            ));

            if let Some(error) = &job.error {
                out.push_str(&format!("       {}\n", error));
            }

            for step in job.steps.iter().filter(|s| s.status == StepStatus::Failed) {
                out.push_str(&format!("       FAIL: {}\n", step.name));
                if let Some(line) = step.stderr.lines().last() {
                    out.push_str(&format!("             {}\n", line));
                }
            }

            for warning in job.steps.iter().flat_map(|s| &s.warnings) {
                out.push_str(&format!("       WARN: {}\n", warning));
            }
        }

        // Summary
        out.push_str(&"-".repeat(60));
        out.push('\n');

        let total = report.jobs.len();
        let failed = report.count(JobStatus::Failed);
        let skipped = report.count(JobStatus::Skipped);
        let seconds = report.duration().as_secs_f64();

        let status_line = match report.verdict {
            Verdict::Succeeded if failed == 0 => {
                format!("  All {} jobs succeeded ({:.2}s)", total, seconds)
            }
            Verdict::Succeeded => format!(
                "  Succeeded with {} optional job(s) failing ({:.2}s)",
                failed, seconds
            ),
            Verdict::Failed => format!("  {} of {} jobs failed ({:.2}s)", failed, total, seconds),
        };
        out.push_str(&status_line);
        out.push('\n');

        if skipped > 0 {
            out.push_str(&format!("  {} jobs skipped\n", skipped));
        }

        out.push('\n');
        out
    }
}

fn count_steps(report: &RunReport, status: StepStatus) -> usize {
    report
        .jobs
        .iter()
        .flat_map(|j| &j.steps)
        .filter(|s| s.status == status)
        .count()
}

/// Escape special XML characters
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::EventKind;

    fn make_step(name: &str, status: StepStatus) -> StepResult {
        let mut step = StepResult::new(name, "command");
        step.status = status;
        step.duration = Duration::from_millis(250);
        if status == StepStatus::Failed {
            step.exit_code = Some(1);
            step.stderr = "warning: unused\nerror: could not compile `app`".to_string();
            step.error = Some(ExecutionError::Command { exit_code: 1 });
        }
        step
    }

    fn make_job(name: &str, status: JobStatus, steps: Vec<StepResult>) -> JobResult {
        JobResult {
            status,
            steps,
            duration: Duration::from_secs(2),
            error: (status == JobStatus::Failed).then_some(ExecutionError::Command { exit_code: 1 }),
            ..JobResult::new(name, false)
        }
    }

    fn make_report() -> RunReport {
        let run = RunResult {
            pipeline_name: "ci".to_string(),
            jobs: vec![
                make_job(
                    "format",
                    JobStatus::Succeeded,
                    vec![make_step("Run cargo fmt", StepStatus::Succeeded)],
                ),
                make_job(
                    "lint",
                    JobStatus::Failed,
                    vec![
                        make_step("Run cargo clippy", StepStatus::Failed),
                        make_step("Save cache <deps>", StepStatus::Skipped),
                    ],
                ),
                make_job(
                    "deploy",
                    JobStatus::Skipped,
                    vec![make_step("Run deploy", StepStatus::Skipped)],
                ),
            ],
            duration: Duration::from_secs(5),
            verdict: Verdict::Failed,
        };

        let started = Utc::now();
        ResultReporter::build(
            &run,
            &TriggerEvent::new(EventKind::Push, "refs/heads/main", "abc123"),
            started,
            started + chrono::Duration::seconds(5),
        )
    }

    #[test]
    fn test_build_report() {
        let report = make_report();
        assert_eq!(report.pipeline, "ci");
        assert_eq!(report.event.branch, "main");
        assert_eq!(report.duration_ms, 5000);
        assert_eq!(report.verdict, Verdict::Failed);
        assert_eq!(report.jobs.len(), 3);
        assert_eq!(report.job("lint").unwrap().steps[0].exit_code, Some(1));
        assert_eq!(report.count(JobStatus::Skipped), 1);
    }

    #[test]
    fn test_json_output() {
        let report = make_report();
        let json = ResultReporter::to_json(&report).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["verdict"], "failed");
        assert_eq!(value["event"]["kind"], "push");
        assert_eq!(value["jobs"][1]["status"], "failed");
        assert_eq!(value["jobs"][1]["error"]["kind"], "command");
        assert_eq!(value["jobs"][1]["steps"][0]["exit_code"], 1);
        assert!(value["jobs"][0].get("error").is_none());

        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_junit_xml_output() {
        let xml = ResultReporter::to_junit_xml(&make_report());

        assert!(xml.starts_with("<?xml version=\"1.0\""));
        assert!(xml.contains("<testsuites name=\"ci\" tests=\"4\" failures=\"1\" skipped=\"2\""));
        assert!(xml.contains("<testsuite name=\"lint\""));
        assert!(xml.contains("<failure message=\"command exited with code 1\">"));
        assert!(xml.contains("could not compile `app`"));
        assert!(xml.contains("name=\"Save cache &lt;deps&gt;\""));
        assert!(xml.contains("<skipped />"));
    }

    #[test]
    fn test_terminal_output() {
        let terminal = ResultReporter::to_terminal(&make_report());

        assert!(terminal.contains("Pipeline: ci (push on main)"));
        assert!(terminal.contains("[+] SUCCEEDED"));
        assert!(terminal.contains("[x] FAILED"));
        assert!(terminal.contains("[-] SKIPPED"));
        assert!(terminal.contains("FAIL: Run cargo clippy"));
        assert!(terminal.contains("error: could not compile `app`"));
        assert!(terminal.contains("1 of 3 jobs failed"));
        assert!(terminal.contains("1 jobs skipped"));
    }

    #[test]
    fn test_write_report_creates_parents() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("reports/nested/run.json");
        let report = make_report();

        ResultReporter::write_report(&report, &path, ReportFormat::Json).unwrap();
        let parsed: RunReport =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.pipeline, "ci");
    }

    #[test]
    fn test_write_report_failure() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("file");
        fs::write(&blocker, "").unwrap();

        let result =
            ResultReporter::write_report(&make_report(), &blocker.join("run.xml"), ReportFormat::JUnit);
        assert!(matches!(result, Err(ReportError::Io(_))));
    }

    #[test]
    fn test_xml_escaping() {
        assert_eq!(xml_escape("<test>"), "&lt;test&gt;");
        assert_eq!(xml_escape("a & b"), "a &amp; b");
        assert_eq!(xml_escape("\"quoted\""), "&quot;quoted&quot;");
    }

    #[test]
    fn test_report_format_parsing() {
        assert_eq!("json".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("xml".parse::<ReportFormat>().unwrap(), ReportFormat::JUnit);
        assert_eq!(
            "terminal".parse::<ReportFormat>().unwrap(),
            ReportFormat::Terminal
        );
        assert!("tap".parse::<ReportFormat>().is_err());
    }
}
