use clap::{Args, Parser, Subcommand};
use std::{
    env,
    path::{Path, PathBuf},
    process::exit,
    time::Instant,
};
use thiserror::Error;
use tilejob_runner::{
    config::{find_task, ConfigErrors, JobDir, JobSettings, Size, TaskKind},
    create::create_job,
    executors::{
        local::CollectionOrder,
        run_batch,
        task::TaskRunner,
        BatchRequest, ExecutorError, EXIT_GENERIC_FAILURE, EXIT_SUCCESS,
    },
    plan::{plan_job, PlanError, PlanOptions, PlanOutcome, DEFAULT_SCRATCH_DIR, DEFAULT_WALLTIME},
    progress::{job_summary, UsageRecord},
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tilejob", version)]
#[command(about = "Tiled image segmentation jobs for SGE, PBS and SLURM clusters")]
struct Cli {
    /// Log level or filter directive, RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "warn")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tile a directory of images into a new job
    Create(CreateArgs),
    /// Batch incomplete tasks and write a submit script
    Plan {
        jobdir: PathBuf,
        #[arg(long)]
        cluster: String,
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value = DEFAULT_WALLTIME)]
        walltime: String,
        /// Memory per node in GB
        #[arg(long)]
        mem: Option<u32>,
        #[arg(long, default_value = DEFAULT_SCRATCH_DIR)]
        scratchdir: PathBuf,
        /// Plan the merge tasks instead of the segmentation tasks
        #[arg(long)]
        merge: bool,
    },
    /// Run every task of a batch in parallel on this node
    Run {
        batch: u32,
        jobdir: PathBuf,
        #[arg(long, default_value = DEFAULT_SCRATCH_DIR)]
        scratchdir: PathBuf,
        #[arg(long)]
        merge: bool,
        /// Report tasks as they finish instead of in start order
        #[arg(long)]
        completion_order: bool,
    },
    /// Run a single task, invoked by `run`
    #[command(hide = true)]
    RunTask {
        jobdir: PathBuf,
        taskid: String,
        #[arg(long, default_value = DEFAULT_SCRATCH_DIR)]
        scratchdir: PathBuf,
        #[arg(long)]
        merge: bool,
    },
    /// Show the progress of a job
    Status {
        jobdir: PathBuf,
        /// Add runtime and remaining compute estimates
        #[arg(long)]
        detailed: bool,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// Directory with the input images
    images: PathBuf,
    /// Trained model directory
    model: PathBuf,
    /// Output job directory
    jobdir: PathBuf,
    /// Segmentation binary
    #[arg(long)]
    binary: PathBuf,
    /// Tile merging binary
    #[arg(long)]
    merge_binary: Option<PathBuf>,
    #[arg(long, default_value = "512x512")]
    tile_size: Size,
    #[arg(long, default_value = "0x0")]
    overlap_size: Size,
    #[arg(long, default_value_t = 50)]
    tiles_per_task: usize,
    #[arg(long, default_value_t = 11)]
    tasks_per_node: usize,
    /// Let the binary equalize histograms
    #[arg(long)]
    enable_histeq: bool,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Failed to locate the tilejob executable: {0}")]
    CurrentExe(std::io::Error),
}

fn kind(merge: bool) -> TaskKind {
    if merge {
        TaskKind::Merge
    } else {
        TaskKind::Segmentation
    }
}

fn current_exe() -> Result<PathBuf, CliError> {
    env::current_exe().map_err(CliError::CurrentExe)
}

fn create(args: CreateArgs) -> Result<i32, CliError> {
    let settings = JobSettings {
        images: args.images,
        model: args.model,
        binary: args.binary,
        tile_size: args.tile_size,
        overlap_size: args.overlap_size,
        tiles_per_task: args.tiles_per_task,
        tasks_per_node: args.tasks_per_node,
        disable_histeq: !args.enable_histeq,
        merge_binary: args.merge_binary,
    };

    if settings.preflight_checks() {
        return Ok(EXIT_GENERIC_FAILURE);
    }

    let created = create_job(settings, &JobDir::new(args.jobdir))?;
    println!(
        "Created {} tasks and {} merge tasks for {} images",
        created.tasks, created.merge_tasks, created.images
    );

    Ok(EXIT_SUCCESS)
}

fn run_task(
    jobdir: &Path,
    taskid: &str,
    scratchdir: PathBuf,
    kind: TaskKind,
) -> Result<i32, CliError> {
    let job_dir = JobDir::new(jobdir);
    let config = job_dir.load_job_config()?;
    let tasks = job_dir.load_tasks(kind)?;
    let task = find_task(&tasks, taskid)?;
    let runner = TaskRunner::load(&config, kind, scratchdir, job_dir.path().to_path_buf())?;

    let start = Instant::now();
    let outcome = runner.run(task)?;

    let usage = UsageRecord::children(taskid, outcome.exit_code(), start.elapsed())
        .map_err(ExecutorError::from)?;
    // picked up from the scheduler stdout file by `status --detailed`
    println!("{usage}");
    info!(task = taskid, "Finished with {outcome:?}");

    Ok(outcome.exit_code())
}

fn execute(command: Commands, log: &str) -> Result<i32, CliError> {
    match command {
        Commands::Create(args) => create(args),
        Commands::Plan {
            jobdir,
            cluster,
            account,
            walltime,
            mem,
            scratchdir,
            merge,
        } => {
            let options = PlanOptions {
                kind: kind(merge),
                cluster,
                account,
                walltime,
                required_mem_gb: mem,
                scratch_root: scratchdir,
            };

            match plan_job(&JobDir::new(jobdir), &options, &current_exe()?)? {
                PlanOutcome::Complete { hint } => print!("{hint}"),
                PlanOutcome::Submit { instructions, .. } => {
                    print!("Run this:\n\n {instructions}\n\n")
                }
            }

            Ok(EXIT_SUCCESS)
        }
        Commands::Run {
            batch,
            jobdir,
            scratchdir,
            merge,
            completion_order,
        } => {
            let request = BatchRequest {
                job_dir: JobDir::new(jobdir),
                batch,
                kind: kind(merge),
                scratch_root: scratchdir,
                order: if completion_order {
                    CollectionOrder::Completion
                } else {
                    CollectionOrder::Spawn
                },
                log_level: Some(log.to_string()),
            };

            Ok(run_batch(&request, &current_exe()?)?.exit_code())
        }
        Commands::RunTask {
            jobdir,
            taskid,
            scratchdir,
            merge,
        } => run_task(&jobdir, &taskid, scratchdir, kind(merge)),
        Commands::Status { jobdir, detailed } => {
            let summary = job_summary(&JobDir::new(jobdir), detailed)?;

            if detailed {
                print!("{}", summary.detailed_summary());
            } else {
                print!("{}", summary.summary());
            }

            Ok(EXIT_SUCCESS)
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // stdout carries usage lines and instructions, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match execute(cli.command, &cli.log) {
        Ok(code) => code,
        Err(error) => {
            error!("{error}");
            match error {
                CliError::Executor(error) => error.exit_code(),
                _ => EXIT_GENERIC_FAILURE,
            }
        }
    };

    exit(code)
}
