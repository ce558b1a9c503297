//! Pipeline orchestration: per-window task graph, run reports, backfill and
//! the monthly scheduler.

pub mod config;
pub mod extract;
pub mod graph;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use docpipe_core::{monthly_windows, QueryWindow};
use docpipe_storage::{init_output_table, init_raw_store, HttpClientConfig, SearchClient};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use config::{PipelineConfig, SettingsFile};
pub use extract::{extract, ExtractError, SearchApi, EXTRACTED, NOTHING_EXTRACTED};
pub use graph::{GraphError, GraphRun, TaskGraph, TaskOutput, TaskState, Upstream};

pub const INIT_RAW_STORE: &str = "init_raw_store";
pub const INIT_OUTPUT_TABLE: &str = "init_output_table";
pub const EXTRACT: &str = "extract";
pub const TRANSFORM: &str = "transform";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub state: TaskState,
}

/// Written next to the staging files after every run, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub window: QueryWindow,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub tasks: Vec<TaskReport>,
    pub extract_flag: Option<u8>,
    pub rows: Option<usize>,
    pub raw_store: PathBuf,
    pub output_table: PathBuf,
    pub error: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Turn a failed report into an error carrying its message.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(anyhow!(
                "run {} for {} ended {:?}: {}",
                self.run_id,
                self.window,
                self.status,
                self.error.as_deref().unwrap_or("no error recorded")
            ))
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    api: Arc<dyn SearchApi>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let client = SearchClient::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })
        .context("building search client")?;
        Ok(Self::with_api(config, Arc::new(client)))
    }

    pub fn with_api(config: PipelineConfig, api: Arc<dyn SearchApi>) -> Self {
        Self { config, api }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn window_for(&self, start: NaiveDate, end: NaiveDate) -> QueryWindow {
        QueryWindow::new(start, end, self.config.search_terms.clone())
    }

    /// init_raw_store + init_output_table -> extract -> transform
    pub fn build_graph(&self, window: &QueryWindow) -> Result<TaskGraph> {
        let raw_store = window.raw_store_path(&self.config.data_dir);
        let output_table = window.output_table_path(&self.config.data_dir);
        let mut graph = TaskGraph::new();

        let path = raw_store.clone();
        graph.add_task(INIT_RAW_STORE, &[], move |_| {
            let path = path.clone();
            async move {
                init_raw_store(&path)
                    .await
                    .with_context(|| format!("initialising {}", path.display()))?;
                Ok(TaskOutput::Path(path))
            }
        })?;

        let path = output_table.clone();
        graph.add_task(INIT_OUTPUT_TABLE, &[], move |_| {
            let path = path.clone();
            async move {
                init_output_table(&path)
                    .await
                    .with_context(|| format!("initialising {}", path.display()))?;
                Ok(TaskOutput::Path(path))
            }
        })?;

        let api = self.api.clone();
        let settings = self.config.api.clone();
        let extract_window = window.clone();
        graph.add_task(
            EXTRACT,
            &[INIT_RAW_STORE, INIT_OUTPUT_TABLE],
            move |upstream: Upstream| {
                let api = api.clone();
                let settings = settings.clone();
                let window = extract_window.clone();
                async move {
                    let raw_store = upstream.path(INIT_RAW_STORE)?;
                    let flag = extract(&window, &raw_store, &settings, api.as_ref())
                        .await
                        .with_context(|| format!("extracting {window}"))?;
                    Ok(TaskOutput::Flag(flag))
                }
            },
        )?;

        graph.add_task(TRANSFORM, &[EXTRACT], move |_| {
            let source = raw_store.clone();
            let dest = output_table.clone();
            async move {
                let rows = tokio::task::spawn_blocking(move || {
                    docpipe_transform::transform(&source, &dest)
                })
                .await
                .context("transform task panicked")?
                .context("transforming raw store")?;
                Ok(TaskOutput::Rows(rows))
            }
        })?;

        Ok(graph)
    }

    /// Run the whole graph for one window under the configured timeout and
    /// record the outcome. Task failures are reported, not returned as `Err`.
    pub async fn run_window(&self, window: QueryWindow) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %window, "starting run");

        let graph = self.build_graph(&window)?;
        let outcome = tokio::time::timeout(self.config.run_timeout, graph.run()).await;

        let mut report = RunReport {
            run_id,
            window: window.clone(),
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Success,
            tasks: Vec::new(),
            extract_flag: None,
            rows: None,
            raw_store: window.raw_store_path(&self.config.data_dir),
            output_table: window.output_table_path(&self.config.data_dir),
            error: None,
        };

        match outcome {
            Err(_) => {
                report.status = RunStatus::TimedOut;
                report.error = Some(format!(
                    "run exceeded {}s",
                    self.config.run_timeout.as_secs()
                ));
                // A transform already on the blocking pool cannot be cancelled
                // and may still write the output table after this report.
                report.tasks = graph
                    .snapshot()
                    .into_iter()
                    .map(|(task, state)| TaskReport { task, state })
                    .collect();
            }
            Ok(run) => {
                let run = run?;
                report.tasks = run
                    .states
                    .iter()
                    .map(|(task, state)| TaskReport {
                        task: task.clone(),
                        state: *state,
                    })
                    .collect();
                if let Some(TaskOutput::Flag(flag)) = run.output(EXTRACT) {
                    report.extract_flag = Some(*flag);
                }
                if let Some(TaskOutput::Rows(rows)) = run.output(TRANSFORM) {
                    report.rows = Some(*rows);
                }
                if let Some(failure) = run.failures.first() {
                    report.status = RunStatus::Failed;
                    report.error = Some(format!("{}: {:#}", failure.task, failure.error));
                }
            }
        }

        self.write_report(&report).await?;
        match report.status {
            RunStatus::Success => info!(
                %run_id,
                rows = report.rows.unwrap_or_default(),
                extract_flag = report.extract_flag.unwrap_or_default(),
                "run finished"
            ),
            _ => error!(%run_id, error = report.error.as_deref().unwrap_or_default(), "run failed"),
        }
        Ok(report)
    }

    async fn write_report(&self, report: &RunReport) -> Result<PathBuf> {
        let path = report.window.report_path(&self.config.data_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub async fn last_report(&self, window: &QueryWindow) -> Option<RunReport> {
        load_report(&window.report_path(&self.config.data_dir)).await
    }

    /// Windows a catch-up pass would cover on `today`.
    pub fn backfill_windows(&self, today: NaiveDate) -> Vec<QueryWindow> {
        let mut windows = monthly_windows(self.config.start_date, today, &self.config.search_terms);
        if !self.config.catchup {
            windows = windows.pop().into_iter().collect();
        }
        windows
    }

    /// Run every elapsed monthly window in order. Windows whose last report is
    /// a success are skipped unless `force` is set. One failed window does not
    /// stop the others.
    pub async fn backfill(&self, today: NaiveDate, force: bool) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for window in self.backfill_windows(today) {
            if !force {
                if let Some(previous) = self.last_report(&window).await {
                    if previous.is_success() {
                        info!(%window, run_id = %previous.run_id, "window already complete, skipping");
                        continue;
                    }
                }
            }
            reports.push(self.run_window(window).await?);
        }
        Ok(reports)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(self.config.cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let window = QueryWindow::previous_month(
                    Utc::now().date_naive(),
                    pipeline.config.search_terms.clone(),
                );
                match pipeline.run_window(window).await {
                    Ok(report) if report.is_success() => {}
                    Ok(report) => warn!(run_id = %report.run_id, "scheduled run did not succeed"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run could not start"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    /// Catch up (when enabled), then run the monthly job until ctrl-c.
    pub async fn serve_schedule(self: Arc<Self>) -> Result<()> {
        if self.config.catchup {
            let today = Utc::now().date_naive();
            for report in self.backfill(today, false).await? {
                if !report.is_success() {
                    warn!(window = %report.window, "backfill window failed");
                }
            }
        }

        let Some(mut sched) = self.maybe_build_scheduler().await? else {
            warn!("scheduler disabled; set DOCPIPE_SCHEDULER_ENABLED=true to run monthly");
            return Ok(());
        };
        sched.start().await.context("starting scheduler")?;
        info!(cron = %self.config.cron, "scheduler running");

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

async fn load_report(path: &Path) -> Option<RunReport> {
    let bytes = fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes)
        .map_err(|err| warn!(path = %path.display(), error = %err, "ignoring unreadable run report"))
        .ok()
}

pub async fn run_once_from_env(start: NaiveDate, end: NaiveDate) -> Result<RunReport> {
    let config = PipelineConfig::from_env()?;
    let pipeline = Pipeline::new(config)?;
    let window = pipeline.window_for(start, end);
    pipeline.run_window(window).await?.into_result()
}
