//! `laforge-task`: task operations for scriptable agent use.
//!
//! Operates directly on a tasks database: the one mounted into the agent
//! container (`$LAFORGE_TASKS_DB`), an explicit `--db` path, or a
//! project's canonical store via `--project`. Mirrors the projection
//! service one-for-one: `next`, `add`, `view`, `list`, `update`, `log`,
//! `review`, `delete`.
//!
//! Exit codes: 0 success, 1 user error, 2 operational error, 3 invariant
//! violation.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use laforge::config::HarnessConfig;
use laforge::error::{CoreError, CoreResult};
use laforge::plan;
use laforge::project::ProjectPaths;
use laforge::store::{
    NewTask, ReviewStatus, Task, TaskFilter, TaskStatus, TaskStore, TaskType, UpdateTaskFields,
};

#[derive(Debug, Parser)]
#[command(name = "laforge-task", version, about = "Task operations for agents")]
struct Cli {
    /// Tasks database path (falls back to $LAFORGE_TASKS_DB).
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Project id; resolves the canonical tasks database.
    #[arg(long, global = true)]
    project: Option<String>,
    /// Emit JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the next ready task from the work queue.
    Next,
    /// Add a task.
    Add(AddArgs),
    /// Show one task with its logs and reviews.
    View {
        /// Task id.
        id: i64,
    },
    /// List tasks.
    List {
        /// Comma list of statuses to match.
        #[arg(long)]
        status: Option<String>,
        /// Filter by parent task.
        #[arg(long)]
        parent: Option<i64>,
        /// 1-based page.
        #[arg(long)]
        page: Option<u32>,
        /// Page size.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Update a task's status, fields, or queue membership.
    Update(UpdateArgs),
    /// Append a log line to a task.
    Log {
        /// Task id.
        id: i64,
        /// Log message.
        message: String,
    },
    /// Create a review or record review feedback.
    Review {
        #[command(subcommand)]
        action: ReviewAction,
    },
    /// Delete a task (logs, reviews, and queue entries cascade).
    Delete {
        /// Task id.
        id: i64,
    },
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Task title.
    title: String,
    /// Longer description.
    #[arg(long)]
    description: Option<String>,
    /// Acceptance criteria.
    #[arg(long)]
    criteria: Option<String>,
    /// Type tag (EPIC, FEAT, BUG, PLAN, DOC, ARCH, DESIGN, TEST).
    #[arg(long = "type")]
    task_type: Option<String>,
    /// Parent task id.
    #[arg(long)]
    parent: Option<i64>,
    /// Upstream dependency id.
    #[arg(long)]
    upstream: Option<i64>,
    /// Require an approved review before completion.
    #[arg(long)]
    review_required: bool,
    /// Also put the task on the work queue.
    #[arg(long)]
    enqueue: bool,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    /// Task id.
    id: i64,
    /// New status (todo, in-progress, in-review, completed).
    #[arg(long)]
    status: Option<String>,
    /// New title.
    #[arg(long)]
    title: Option<String>,
    /// New description.
    #[arg(long)]
    description: Option<String>,
    /// New acceptance criteria.
    #[arg(long)]
    criteria: Option<String>,
    /// Put the task on the work queue.
    #[arg(long, conflicts_with = "dequeue")]
    enqueue: bool,
    /// Remove the task from the work queue.
    #[arg(long)]
    dequeue: bool,
}

#[derive(Debug, Subcommand)]
enum ReviewAction {
    /// Create a pending review (moves the task to in-review).
    Create {
        /// Task id.
        task_id: i64,
        /// What the reviewer should look at.
        message: String,
        /// Artifact path relative to the source root.
        #[arg(long)]
        attachment: Option<String>,
    },
    /// Record approved/rejected feedback on a review.
    Feedback {
        /// Review id.
        review_id: i64,
        /// Verdict: approved or rejected.
        verdict: String,
        /// Feedback text (required for rejections).
        #[arg(long)]
        feedback: Option<String>,
        /// Source root for plan-document attachments.
        #[arg(long)]
        source_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    laforge::logging::init_quiet();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(2))
        }
    }
}

/// Resolve the tasks database path from flags, environment, or project.
fn resolve_db(cli: &Cli) -> CoreResult<PathBuf> {
    if let Some(db) = &cli.db {
        return Ok(db.clone());
    }
    if let Ok(db) = std::env::var("LAFORGE_TASKS_DB") {
        return Ok(PathBuf::from(db));
    }
    if let Some(project) = &cli.project {
        let config = HarnessConfig::load().map_err(|e| CoreError::Host(e.to_string()))?;
        return Ok(ProjectPaths::new(&config.state_root, project).tasks_db);
    }
    Err(CoreError::Validation(
        "no tasks database: pass --db, --project, or set LAFORGE_TASKS_DB".into(),
    ))
}

fn resolve_source_root(cli: &Cli, flag: Option<PathBuf>) -> CoreResult<Option<PathBuf>> {
    if let Some(path) = flag {
        return Ok(Some(path));
    }
    if let Ok(path) = std::env::var("LAFORGE_SOURCE_ROOT") {
        return Ok(Some(PathBuf::from(path)));
    }
    if let Some(project) = &cli.project {
        let config = HarnessConfig::load().map_err(|e| CoreError::Host(e.to_string()))?;
        return Ok(Some(
            ProjectPaths::new(&config.state_root, project).source_root,
        ));
    }
    Ok(None)
}

async fn run(cli: Cli) -> CoreResult<()> {
    let db = resolve_db(&cli)?;
    if !db.exists() {
        return Err(CoreError::not_found("tasks database", db.display()));
    }
    let store = TaskStore::open(&db).await?;

    match &cli.command {
        Command::Next => {
            let task = store.next_ready().await?;
            match task {
                Some(task) => print_task(&cli, &task)?,
                None if cli.json => println!("null"),
                None => println!("no ready task"),
            }
            Ok(())
        }

        Command::Add(args) => {
            let task_type = args
                .task_type
                .as_deref()
                .map(|raw| TaskType::parse(&raw.to_uppercase()))
                .transpose()?;
            let id = store
                .add_with_details(NewTask {
                    title: args.title.clone(),
                    description: args.description.clone().unwrap_or_default(),
                    acceptance_criteria: args.criteria.clone().unwrap_or_default(),
                    task_type,
                    parent_id: args.parent,
                    upstream_id: args.upstream,
                    review_required: args.review_required,
                })
                .await?;
            if args.enqueue {
                store.enqueue(id).await?;
            }
            let task = store.get_required(id).await?;
            print_task(&cli, &task)?;
            Ok(())
        }

        Command::View { id } => {
            let mut task = store.get_required(*id).await?;
            task.logs = Some(store.logs(*id).await?);
            task.reviews = Some(store.reviews(*id).await?);
            task.children = Some(store.children(*id).await?);
            print_task(&cli, &task)?;
            Ok(())
        }

        Command::List {
            status,
            parent,
            page,
            limit,
        } => {
            let statuses = match status.as_deref() {
                None => Vec::new(),
                Some(raw) => raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(TaskStatus::parse)
                    .collect::<Result<Vec<_>, _>>()?,
            };
            let tasks = store
                .list(&TaskFilter {
                    statuses,
                    parent_id: *parent,
                    task_type: None,
                    page: *page,
                    limit: *limit,
                })
                .await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&tasks)
                        .map_err(|e| CoreError::Host(e.to_string()))?
                );
            } else if tasks.is_empty() {
                println!("no tasks");
            } else {
                for task in tasks {
                    println!(
                        "{:>5}  {:<12} {:<6} {}",
                        task.display_id(),
                        task.status.as_str(),
                        task.task_type.as_str(),
                        task.title,
                    );
                }
            }
            Ok(())
        }

        Command::Update(args) => {
            let fields = UpdateTaskFields {
                title: args.title.clone(),
                description: args.description.clone(),
                acceptance_criteria: args.criteria.clone(),
                task_type: None,
                review_required: None,
            };
            let has_field_edits = fields.title.is_some()
                || fields.description.is_some()
                || fields.acceptance_criteria.is_some();
            if has_field_edits {
                store.update_fields(args.id, &fields).await?;
            }
            if let Some(raw) = &args.status {
                store
                    .update_status(args.id, TaskStatus::parse(raw)?)
                    .await?;
            }
            if args.enqueue {
                store.enqueue(args.id).await?;
            }
            if args.dequeue {
                store.dequeue(args.id).await?;
            }
            let task = store.get_required(args.id).await?;
            print_task(&cli, &task)?;
            Ok(())
        }

        Command::Log { id, message } => {
            store.append_log(*id, message).await?;
            if !cli.json {
                println!("logged to T{id}");
            }
            Ok(())
        }

        Command::Review { action } => match action {
            ReviewAction::Create {
                task_id,
                message,
                attachment,
            } => {
                let review = store
                    .create_review(*task_id, message, attachment.as_deref())
                    .await?;
                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&review)
                            .map_err(|e| CoreError::Host(e.to_string()))?
                    );
                } else {
                    println!(
                        "review {} created on T{task_id} (task now in-review)",
                        review.id
                    );
                }
                Ok(())
            }
            ReviewAction::Feedback {
                review_id,
                verdict,
                feedback,
                source_root,
            } => {
                let verdict = ReviewStatus::parse(verdict)?;
                let outcome = store
                    .set_review_feedback(*review_id, verdict, feedback.as_deref())
                    .await?;

                if outcome.newly_approved {
                    let attachment_is_plan = outcome
                        .review
                        .attachment_path
                        .as_deref()
                        .is_some_and(plan::is_plan_document);
                    if attachment_is_plan {
                        let root = resolve_source_root(&cli, source_root.clone())?.ok_or_else(
                            || {
                                CoreError::Validation(
                                    "plan attachment needs a source root: pass --source-root, \
                                     --project, or set LAFORGE_SOURCE_ROOT"
                                        .into(),
                                )
                            },
                        )?;
                        let applied =
                            plan::apply_review_plan(&store, &root, &outcome.review).await?;
                        if let Some(ids) = applied {
                            if !cli.json {
                                println!("plan applied: {} task(s)", ids.len());
                            }
                        }
                    }
                }

                if cli.json {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&outcome.review)
                            .map_err(|e| CoreError::Host(e.to_string()))?
                    );
                } else {
                    println!(
                        "review {} is now {}",
                        outcome.review.id,
                        outcome.review.status.as_str()
                    );
                }
                Ok(())
            }
        },

        Command::Delete { id } => {
            store.delete(*id).await?;
            if !cli.json {
                println!("deleted T{id}");
            }
            Ok(())
        }
    }
}

fn print_task(cli: &Cli, task: &Task) -> CoreResult<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(task).map_err(|e| CoreError::Host(e.to_string()))?
        );
        return Ok(());
    }

    println!("{}  {}", task.display_id(), task.title);
    println!("  status: {}  type: {}", task.status.as_str(), task.task_type.as_str());
    if let Some(parent) = task.parent_id {
        println!("  parent: T{parent}");
    }
    if let Some(upstream) = task.upstream_id {
        println!("  upstream: T{upstream}");
    }
    if task.review_required {
        println!("  review required");
    }
    if !task.description.is_empty() {
        println!("  {}", task.description);
    }
    if !task.acceptance_criteria.is_empty() {
        println!("  acceptance: {}", task.acceptance_criteria);
    }
    if let Some(logs) = &task.logs {
        for log in logs {
            println!("  log[{}]: {}", log.created_at.format("%H:%M:%S"), log.message);
        }
    }
    if let Some(reviews) = &task.reviews {
        for review in reviews {
            println!(
                "  review {}: {}: {}",
                review.id,
                review.status.as_str(),
                review.message
            );
        }
    }
    Ok(())
}
