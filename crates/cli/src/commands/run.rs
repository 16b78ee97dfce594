//! Run Command

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use snapgrid_core::{
    AppOutput, BrowserInfo, CheckSettings, FrameData, Scheduler, SchedulerConfig, SimulatedConnector,
    TestDescriptor, TestResultContainer, TestResultsSummary, TestState,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::output::{print_info, print_list, OutputFormat, TableDisplay};
use crate::suite::{StepSpec, Suite};

#[derive(Args)]
pub struct RunArgs {
    /// Suite file (YAML)
    pub suite: PathBuf,

    /// Sessions open at once; overrides the suite and the config file
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

/// Result row for one test run
#[derive(Serialize)]
pub struct ResultDisplay {
    pub test: String,
    pub browser: String,
    pub state: TestState,
    pub status: Option<String>,
    pub steps: u32,
    pub matches: u32,
    pub mismatches: u32,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl From<&TestResultContainer> for ResultDisplay {
    fn from(container: &TestResultContainer) -> Self {
        let results = container.results.as_ref();
        Self {
            test: container.descriptor.test_name.clone(),
            browser: container.descriptor.browser.to_string(),
            state: container.state,
            status: container.status().map(|s| s.to_string()),
            steps: results.map_or(0, |r| r.steps),
            matches: results.map_or(0, |r| r.matches),
            mismatches: results.map_or(0, |r| r.mismatches),
            url: results.map(|r| r.url.clone()).filter(|u| !u.is_empty()),
            error: container.failure_reason(),
        }
    }
}

impl TableDisplay for ResultDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Test", "Browser", "State", "Status", "Steps", "Matches", "Mismatches", "Error"]
    }

    fn row(&self) -> Vec<String> {
        let state = match self.state {
            TestState::Closed if self.error.is_none() => self.state.to_string().green().to_string(),
            TestState::Aborted => self.state.to_string().yellow().to_string(),
            _ => self.state.to_string().red().to_string(),
        };
        vec![
            self.test.clone(),
            self.browser.clone(),
            state,
            self.status.clone().unwrap_or_else(|| "-".to_string()),
            self.steps.to_string(),
            self.matches.to_string(),
            self.mismatches.to_string(),
            self.error.clone().unwrap_or_default(),
        ]
    }
}

/// Placeholder capture: distinct bytes per test, step and browser
fn screenshot(test: &str, step: &str, browser: &BrowserInfo) -> AppOutput {
    AppOutput::from_screenshot(format!("{}/{}/{}", test, step, browser).into_bytes())
}

fn submit(scheduler: &Scheduler, suite: &Suite) -> Result<()> {
    for test in &suite.tests {
        for browser in &suite.browsers {
            let mut descriptor = TestDescriptor::new(suite.app_name.clone(), test.name.clone())
                .with_browser(browser.clone());
            descriptor.batch_id = suite.batch_id.clone();
            descriptor.properties = test.properties.clone();

            let test_id = scheduler.open(descriptor)?;
            debug!("Submitted {} on {} as {}", test.name, browser, test_id);

            for step in &test.steps {
                debug!("Step {} of {} on {}", step.name(), test.name, browser);
                match step {
                    StepSpec::Screenshot(name) => {
                        scheduler.check(test_id, CheckSettings::named(name), screenshot(&test.name, name, browser))?;
                    }
                    StepSpec::Page { name, url, resources } => {
                        let frame = FrameData::new(url.clone()).with_resources(resources.iter().cloned());
                        scheduler.check_dom(frame, vec![(test_id, CheckSettings::named(name))])?;
                    }
                }
            }

            if test.abort {
                scheduler.abort(test_id)?;
            } else {
                scheduler.close(test_id)?;
            }
        }
    }
    Ok(())
}

fn progress_bar(total: usize, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} tests finished ({elapsed})") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

fn print_summary(summary: &TestResultsSummary, format: OutputFormat) {
    let rows: Vec<ResultDisplay> = summary.results.iter().map(ResultDisplay::from).collect();
    print_list(&rows, format);

    if matches!(format, OutputFormat::Table | OutputFormat::Plain) {
        println!();
        println!(
            "{} passed, {} unresolved, {} failed, {} exceptions ({} matches, {} mismatches)",
            summary.passed.to_string().green(),
            summary.unresolved.to_string().yellow(),
            summary.failed.to_string().red(),
            summary.exceptions.to_string().red(),
            summary.matches,
            summary.mismatches,
        );
    }
}

/// Run a suite; returns whether every test passed
pub async fn execute(args: RunArgs, mut config: SchedulerConfig, format: OutputFormat) -> Result<bool> {
    let suite = Suite::load(&args.suite)?;
    if let Some(concurrency) = args.concurrency.or(suite.concurrency) {
        config.test_concurrency = concurrency;
    }
    config.validate()?;

    let total = suite.run_count();
    info!(
        "Running {} tests on {} browsers with concurrency {}",
        suite.tests.len(),
        suite.browsers.len(),
        config.test_concurrency
    );

    let connector = Arc::new(SimulatedConnector::new(suite.server.clone()));
    let scheduler = Scheduler::builder(connector.clone())
        .with_config(config)
        .with_fetcher(Arc::new(suite.fetcher()))
        .start()?;

    submit(&scheduler, &suite)?;

    let progress = progress_bar(total, args.no_progress || !matches!(format, OutputFormat::Table));
    let watcher = {
        let scheduler = scheduler.clone();
        let progress = progress.clone();
        tokio::spawn(async move {
            while let Ok(summary) = scheduler.get_all_results(false, false).await {
                progress.set_position(summary.len() as u64);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let outcome = scheduler.get_all_results(true, false).await;
    watcher.abort();
    progress.finish_and_clear();
    scheduler.shutdown().await;
    let summary = outcome?;

    print_summary(&summary, format);
    let stats = connector.stats();
    if matches!(format, OutputFormat::Table) {
        print_info(&format!(
            "Server saw at most {} concurrent sessions ({} capacity rejections)",
            stats.max_concurrent_sessions, stats.concurrency_full_responses
        ));
    }
    Ok(summary.all_passed())
}
