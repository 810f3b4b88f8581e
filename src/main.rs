//! `laforge`: the control binary.
//!
//! Subcommands: `init` (create a project), `step` (run one agent step),
//! `steps` (list history), `step info`, `step rollback`, and `serve`
//! (host the projection service).
//!
//! Exit codes: 0 success, 1 user error, 2 operational error, 3 invariant
//! violation.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use laforge::agent::ExtractorRegistry;
use laforge::api::{self, ApiState};
use laforge::config::HarnessConfig;
use laforge::container::DockerRuntime;
use laforge::error::{CoreError, CoreResult};
use laforge::project::{ProjectRegistry, ProjectStore};
use laforge::repo::{GitRepository, Repository};
use laforge::step::{rollback, StepOptions, StepRunner};
use laforge::store::StepFilter;

#[derive(Debug, Parser)]
#[command(name = "laforge", version, about = "Coding-agent harness control")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new project with empty stores and a fresh repository.
    Init {
        /// Project identifier.
        project_id: String,
        /// Display name (defaults to the id).
        #[arg(long)]
        name: Option<String>,
        /// Free-form description.
        #[arg(long)]
        description: Option<String>,
    },
    /// Run one agent step, or inspect/rewind the step history.
    Step(StepArgs),
    /// List a project's steps.
    Steps {
        /// Project identifier.
        project_id: String,
    },
    /// Host the HTTP/WebSocket projection service.
    Serve,
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct StepArgs {
    #[command(subcommand)]
    action: Option<StepAction>,
    /// Project identifier.
    project_id: Option<String>,
    /// Agent profile name.
    #[arg(long = "agent-config", default_value = "default")]
    agent_config: String,
    /// Container deadline override (e.g. `90s`, `15m`, `2h`).
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,
}

#[derive(Debug, Subcommand)]
enum StepAction {
    /// Show the full record of one step.
    Info {
        /// Project identifier.
        project_id: String,
        /// Step id.
        step_id: i64,
    },
    /// Deactivate history from a step on and reset the repository.
    Rollback {
        /// Project identifier.
        project_id: String,
        /// Rollback target; this step and everything after it deactivate.
        step_id: i64,
        /// Skip the interactive confirmation.
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

/// Parse `90`, `90s`, `15m`, or `2h` into a duration.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let secs = match unit {
        "s" | "" => value,
        "m" => value.saturating_mul(60),
        "h" => value.saturating_mul(3600),
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    if secs == 0 {
        return Err("duration must be positive".to_owned());
    }
    Ok(Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(2))
        }
    }
}

async fn run(cli: Cli) -> CoreResult<()> {
    let config = HarnessConfig::load().map_err(|e| CoreError::Host(e.to_string()))?;

    match cli.command {
        Command::Init {
            project_id,
            name,
            description,
        } => {
            laforge::logging::init_quiet();
            let store = ProjectStore::new(config.state_root.clone());
            let repo = GitRepository::new(config.timeouts.merge());
            let project = store
                .create(
                    &project_id,
                    name.as_deref().unwrap_or(""),
                    description.as_deref().unwrap_or(""),
                    &repo,
                )
                .await?;
            println!("created project {} ({})", project.id, project.name);
            Ok(())
        }

        Command::Step(args) => match args.action {
            Some(StepAction::Info {
                project_id,
                step_id,
            }) => {
                laforge::logging::init_quiet();
                let registry = registry(&config);
                let handle = registry.open(&project_id).await?;
                let step = handle.steps.get(step_id).await?;
                if step.project_id != project_id {
                    return Err(CoreError::not_found("step", step_id));
                }
                let rendered = serde_json::to_string_pretty(&step)
                    .map_err(|e| CoreError::Host(e.to_string()))?;
                println!("{rendered}");
                Ok(())
            }
            Some(StepAction::Rollback {
                project_id,
                step_id,
                yes,
            }) => {
                laforge::logging::init_quiet();
                let registry = registry(&config);
                let handle = registry.open(&project_id).await?;
                let target = handle.steps.get(step_id).await?;
                if !yes && !confirm(&format!(
                    "Roll back {project_id} to before step S{step_id} (HEAD -> {})? [y/N] ",
                    target.commit_before
                ))? {
                    println!("aborted");
                    return Ok(());
                }
                let repo = GitRepository::new(config.timeouts.merge());
                let deactivated = rollback(&handle, &repo, step_id).await?;
                println!(
                    "rolled back: deactivated {} step(s): {}",
                    deactivated.len(),
                    deactivated
                        .iter()
                        .map(|id| format!("S{id}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Ok(())
            }
            None => {
                let project_id = args.project_id.ok_or_else(|| {
                    CoreError::Validation("step requires a project id".into())
                })?;
                let _guard = laforge::logging::init_step(&config.state_root.join("logs"))
                    .map_err(|e| CoreError::Host(e.to_string()))?;
                run_step(&config, &project_id, &args.agent_config, args.timeout).await
            }
        },

        Command::Steps { project_id } => {
            laforge::logging::init_quiet();
            let registry = registry(&config);
            let handle = registry.open(&project_id).await?;
            let steps = handle
                .steps
                .list(&project_id, &StepFilter::default())
                .await?;
            if steps.is_empty() {
                println!("no steps recorded for {project_id}");
                return Ok(());
            }
            for step in steps {
                let state = if step.is_running() {
                    "running".to_owned()
                } else if !step.active {
                    "inactive".to_owned()
                } else {
                    format!("exit {}", step.exit_code.unwrap_or(-1))
                };
                println!(
                    "{:>6}  {}  {} -> {}  {}",
                    step.display_id(),
                    step.started_at.format("%Y-%m-%d %H:%M:%S"),
                    &step.commit_before[..step.commit_before.len().min(8)],
                    step.commit_after
                        .as_deref()
                        .map(|sha| &sha[..sha.len().min(8)])
                        .unwrap_or("-"),
                    state,
                );
            }
            Ok(())
        }

        Command::Serve => {
            let _guard = laforge::logging::init_service(&config.state_root.join("logs"))
                .map_err(|e| CoreError::Host(e.to_string()))?;
            info!("laforge projection service starting");
            let state = ApiState::new(registry(&config), &config);
            let request_timeout = Duration::from_secs(config.timeouts.api_request_secs);
            api::serve(state, &config.api.bind_addr, request_timeout)
                .await
                .map_err(|e| CoreError::Host(e.to_string()))
        }
    }
}

fn registry(config: &HarnessConfig) -> Arc<ProjectRegistry> {
    Arc::new(ProjectRegistry::new(ProjectStore::new(
        config.state_root.clone(),
    )))
}

async fn run_step(
    config: &HarnessConfig,
    project_id: &str,
    profile: &str,
    timeout: Option<Duration>,
) -> CoreResult<()> {
    let registry = registry(config);
    let handle = registry.open(project_id).await?;

    let repo: Arc<dyn Repository> = Arc::new(GitRepository::new(config.timeouts.merge()));
    let runtime = DockerRuntime::new(
        config.timeouts.container_pull(),
        config.capture.max_output_bytes,
    )?;
    let runner = StepRunner::new(
        repo,
        Arc::new(runtime),
        Arc::new(ExtractorRegistry::new()),
        config.timeouts.clone(),
    );

    let collected = runner.gc_stale(&handle).await?;
    if collected > 0 {
        info!(collected, "garbage-collected stale step branches");
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let options = StepOptions {
        profile: profile.to_owned(),
        deadline_override: timeout,
    };
    let outcome = runner.run_step(&handle, &options, &cancel).await?;

    println!(
        "step {} finished: exit {}, {}{}",
        outcome.step.display_id(),
        outcome.step.exit_code.unwrap_or(-1),
        if outcome.merged { "merged" } else { "not merged" },
        outcome
            .step
            .commit_after
            .as_deref()
            .map(|sha| format!(", commit {}", &sha[..sha.len().min(8)]))
            .unwrap_or_default(),
    );
    Ok(())
}

fn confirm(prompt: &str) -> CoreResult<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
