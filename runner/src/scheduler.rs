mod pbs;
mod sge;
mod slurm;

pub use pbs::{PbsScheduler, PBS_MAX_ARRAY_TASKS};
pub use sge::SgeScheduler;
pub use slurm::SlurmScheduler;

use crate::config::ConfigErrors;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// suffix of every scheduler stdout file
pub const OUT_SUFFIX: &str = ".out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Sge,
    Pbs,
    Slurm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Everything about a cluster a submit script needs to know
pub struct ClusterProfile {
    pub name: String,
    pub kind: SchedulerKind,
    pub queue: Option<String>,
    pub account: Option<String>,
    // e.g. loading a module before the runner is invoked
    pub preamble: Option<String>,
    // None means the scheduler accepts arrays of any size
    pub max_array_tasks: Option<usize>,
}

impl ClusterProfile {
    /// Built-in profiles for the clusters this tool knows about
    pub fn by_name(name: &str) -> Result<Self, ConfigErrors> {
        let profile = |kind, queue: &str, preamble: Option<&str>, max_array_tasks| Self {
            name: name.to_lowercase(),
            kind,
            queue: Some(queue.to_string()),
            account: None,
            preamble: preamble.map(String::from),
            max_array_tasks,
        };

        match name.to_lowercase().as_str() {
            "rocce" => Ok(profile(SchedulerKind::Sge, "all.q", None, None)),
            "gordon" => Ok(profile(
                SchedulerKind::Pbs,
                "normal",
                Some("module load singularity/2.3.2"),
                Some(PBS_MAX_ARRAY_TASKS),
            )),
            "comet" => Ok(profile(
                SchedulerKind::Slurm,
                "compute",
                Some("module load singularity/2.3.2"),
                None,
            )),
            _ => Err(ConfigErrors::UnsupportedCluster(name.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Scheduler specific names, the only thing apart from the header that differs
pub struct Tokens {
    pub submit: &'static str,
    // flag to request an array of N tasks on submit, None if the header carries it
    pub array_flag: Option<&'static str>,
    // values visible to the running job
    pub jobid: &'static str,
    pub jobid_for_arrayjob: &'static str,
    pub taskid: &'static str,
    // values usable in output file naming patterns
    pub jobid_for_filepath: &'static str,
    pub array_jobid_for_filepath: &'static str,
    pub taskid_for_filepath: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderParams<'a> {
    pub working_dir: &'a Path,
    pub stdout_path: &'a str,
    pub job_name: &'a str,
    pub walltime: &'a str,
    pub required_mem_gb: Option<u32>,
    pub task_count: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct JobScript<'a> {
    // file name of the script inside `working_dir`
    pub name: Option<&'a str>,
    pub working_dir: Option<&'a Path>,
    pub stdout_path: String,
    pub job_name: &'a str,
    pub walltime: &'a str,
    pub command: String,
    // named in the exit code echo of the script
    pub runner: &'a str,
    pub required_mem_gb: Option<u32>,
    pub task_count: Option<usize>,
}

#[derive(Debug, Clone)]
/// All supported scheduler variants, see `Schedulers::from_cluster`
pub enum Schedulers {
    Sge(SgeScheduler),
    Pbs(PbsScheduler),
    Slurm(SlurmScheduler),
}

/// Appended to every script so its exit status is the runner's
fn exit_propagation(runner: &str) -> String {
    format!("exitcode=$?\necho \"{runner} exited with code: $exitcode\"\nexit $exitcode\n")
}

impl Schedulers {
    pub fn new(profile: ClusterProfile) -> Self {
        match profile.kind {
            SchedulerKind::Sge => Self::Sge(SgeScheduler::new(profile)),
            SchedulerKind::Pbs => Self::Pbs(PbsScheduler::new(profile)),
            SchedulerKind::Slurm => Self::Slurm(SlurmScheduler::new(profile)),
        }
    }

    pub fn from_cluster(name: &str) -> Result<Self, ConfigErrors> {
        ClusterProfile::by_name(name).map(Self::new)
    }

    pub fn profile(&self) -> &ClusterProfile {
        match self {
            Self::Sge(scheduler) => &scheduler.profile,
            Self::Pbs(scheduler) => &scheduler.profile,
            Self::Slurm(scheduler) => &scheduler.profile,
        }
    }

    fn profile_mut(&mut self) -> &mut ClusterProfile {
        match self {
            Self::Sge(scheduler) => &mut scheduler.profile,
            Self::Pbs(scheduler) => &mut scheduler.profile,
            Self::Slurm(scheduler) => &mut scheduler.profile,
        }
    }

    pub fn set_account(&mut self, account: Option<String>) {
        self.profile_mut().account = account;
    }

    pub fn cluster_name(&self) -> &str {
        &self.profile().name
    }

    pub fn tokens(&self) -> &'static Tokens {
        match self {
            Self::Sge(_) => &sge::TOKENS,
            Self::Pbs(_) => &pbs::TOKENS,
            Self::Slurm(_) => &slurm::TOKENS,
        }
    }

    pub fn build_header(&self, params: &HeaderParams) -> String {
        match self {
            Self::Sge(scheduler) => scheduler.build_header(params),
            Self::Pbs(scheduler) => scheduler.build_header(params),
            Self::Slurm(scheduler) => scheduler.build_header(params),
        }
    }

    pub fn array_submit_flag(&self) -> Option<&'static str> {
        self.tokens().array_flag
    }

    pub fn jobid_variable(&self) -> &'static str {
        self.tokens().jobid
    }

    pub fn jobid_for_arrayjob_variable(&self) -> &'static str {
        self.tokens().jobid_for_arrayjob
    }

    pub fn taskid_variable(&self) -> &'static str {
        self.tokens().taskid
    }

    pub fn job_out_file_name(&self) -> String {
        format!("{}{OUT_SUFFIX}", self.tokens().jobid_for_filepath)
    }

    pub fn array_job_out_file_name(&self) -> String {
        let tokens = self.tokens();

        format!(
            "{}.{}{OUT_SUFFIX}",
            tokens.array_jobid_for_filepath, tokens.taskid_for_filepath
        )
    }

    /// The command an operator runs to submit the script
    pub fn submit_command(
        &self,
        script: &Path,
        working_dir: &Path,
        task_count: Option<usize>,
    ) -> String {
        let tokens = self.tokens();
        let array = match (tokens.array_flag, task_count) {
            (Some(flag), Some(count)) => format!(" {flag} 1-{count}"),
            _ => String::new(),
        };

        format!(
            "cd \"{}\";{}{array} {}",
            working_dir.display(),
            tokens.submit,
            script.display()
        )
    }

    /// Cap an array size at the scheduler limit, the warning tells the operator what to do
    fn cap_task_count(&self, task_count: Option<usize>) -> (Option<usize>, Option<String>) {
        match (task_count, self.profile().max_array_tasks) {
            (Some(count), Some(max)) if count > max => {
                warn!(
                    requested = count,
                    limit = max,
                    "Array job exceeds the scheduler limit, capping it"
                );

                (
                    Some(max),
                    Some(format!(
                        "\n\nWARNING: {count} tasks are needed but {} only allows {max} \
                         tasks per array job. The script only runs tasks 1-{max}, once \
                         those complete re-run the planning step and submit again to \
                         process the remainder.",
                        self.cluster_name()
                    )),
                )
            }
            (count, _) => (count, None),
        }
    }

    /// Write an executable submit script and return (submit instructions, script path)
    pub fn write_submit_script(
        &self,
        script: &JobScript,
    ) -> Result<(String, PathBuf), ConfigErrors> {
        let name = script.name.ok_or(ConfigErrors::InvalidScriptName)?;
        let working_dir = script.working_dir.ok_or(ConfigErrors::InvalidWorkingDir)?;
        let (task_count, warning) = self.cap_task_count(script.task_count);
        let tokens = self.tokens();

        let mut content = self.build_header(&HeaderParams {
            working_dir,
            stdout_path: &script.stdout_path,
            job_name: script.job_name,
            walltime: script.walltime,
            required_mem_gb: script.required_mem_gb,
            task_count,
        });

        content.push_str("\necho \"HOST: $HOSTNAME\"\n");
        content.push_str("echo \"DATE: `date`\"\n");
        if task_count.is_some() {
            content.push_str(&format!("echo \"JOBID: {}\"\n", tokens.jobid_for_arrayjob));
            content.push_str(&format!("echo \"TASKID: {}\"\n\n", tokens.taskid));
        } else {
            content.push_str(&format!("echo \"JOBID: {}\"\n\n", tokens.jobid));
        }

        if let Some(preamble) = &self.profile().preamble {
            content.push_str(preamble);
            content.push('\n');
        }

        content.push_str(script.command.trim_end());
        content.push('\n');
        content.push_str(&exit_propagation(script.runner));

        let path = working_dir.join(name);
        debug!(path = ?path, "Writing submit script");
        fs::write(&path, content)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

        let mut instructions = self.submit_command(Path::new(name), working_dir, task_count);
        if let Some(warning) = warning {
            instructions.push_str(&warning);
        }

        Ok((instructions, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script<'a>(dir: &'a Path, task_count: Option<usize>) -> JobScript<'a> {
        JobScript {
            name: Some("runjobs.sh"),
            working_dir: Some(dir),
            stdout_path: "/out/stdout/x.out".to_string(),
            job_name: "segment",
            walltime: "12:00:00",
            command: "/usr/bin/time -v tilejob run $TASK 1\n".to_string(),
            runner: "tilejob",
            required_mem_gb: None,
            task_count,
        }
    }

    #[test]
    fn factory_by_cluster_name() {
        assert!(matches!(Schedulers::from_cluster("rocce"), Ok(Schedulers::Sge(_))));
        assert!(matches!(Schedulers::from_cluster("Gordon"), Ok(Schedulers::Pbs(_))));
        assert!(matches!(Schedulers::from_cluster("comet"), Ok(Schedulers::Slurm(_))));

        match Schedulers::from_cluster("foo") {
            Err(error @ ConfigErrors::UnsupportedCluster(_)) => {
                assert_eq!(error.to_string(), "Cluster not supported: foo")
            }
            other => panic!("expected UnsupportedCluster, got {other:?}"),
        }
    }

    #[test]
    fn out_file_names() {
        let sge = Schedulers::from_cluster("rocce").unwrap();
        assert_eq!(sge.job_out_file_name(), "$JOB_ID.out");
        assert_eq!(sge.array_job_out_file_name(), "$JOB_ID.$TASK_ID.out");

        let slurm = Schedulers::from_cluster("comet").unwrap();
        assert_eq!(slurm.job_out_file_name(), "%j.out");
        assert_eq!(slurm.array_job_out_file_name(), "%A.%a.out");
    }

    #[test]
    fn submit_commands() {
        let out = Path::new("out");
        let script = Path::new("runjobs.sh");

        assert_eq!(
            Schedulers::from_cluster("rocce")
                .unwrap()
                .submit_command(script, out, Some(5)),
            "cd \"out\";qsub -t 1-5 runjobs.sh"
        );
        assert_eq!(
            Schedulers::from_cluster("comet")
                .unwrap()
                .submit_command(script, out, Some(100)),
            "cd \"out\";sbatch -a 1-100 runjobs.sh"
        );
        // PBS arrays live in the header
        assert_eq!(
            Schedulers::from_cluster("gordon")
                .unwrap()
                .submit_command(script, out, Some(5)),
            "cd \"out\";qsub runjobs.sh"
        );
        assert_eq!(
            Schedulers::from_cluster("rocce")
                .unwrap()
                .submit_command(script, out, None),
            "cd \"out\";qsub runjobs.sh"
        );
    }

    #[test]
    fn unset_name_or_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Schedulers::from_cluster("rocce").unwrap();

        let mut unnamed = script(dir.path(), None);
        unnamed.name = None;
        match scheduler.write_submit_script(&unnamed) {
            Err(error @ ConfigErrors::InvalidScriptName) => {
                assert_eq!(error.to_string(), "Script name cannot be None")
            }
            other => panic!("expected InvalidScriptName, got {other:?}"),
        }

        let mut no_dir = script(dir.path(), None);
        no_dir.working_dir = None;
        match scheduler.write_submit_script(&no_dir) {
            Err(error @ ConfigErrors::InvalidWorkingDir) => {
                assert_eq!(error.to_string(), "Working dir cannot be None")
            }
            other => panic!("expected InvalidWorkingDir, got {other:?}"),
        }
    }

    #[test]
    fn unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nonexistantdir");
        let scheduler = Schedulers::from_cluster("rocce").unwrap();

        assert!(matches!(
            scheduler.write_submit_script(&script(&missing, None)),
            Err(ConfigErrors::Io(_))
        ));
    }

    #[test]
    fn written_script_propagates_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Schedulers::from_cluster("comet").unwrap();

        let (instructions, path) = scheduler
            .write_submit_script(&script(dir.path(), Some(3)))
            .unwrap();

        assert_eq!(path, dir.path().join("runjobs.sh"));
        assert_eq!(
            instructions,
            format!("cd \"{}\";sbatch -a 1-3 runjobs.sh", dir.path().display())
        );

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_ne!(mode & 0o100, 0);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#!/bin/sh\n"));
        assert!(content.contains("echo \"TASKID: $SLURM_ARRAY_TASK_ID\"\n"));
        assert!(content.contains("module load singularity/2.3.2\n"));
        assert!(content.ends_with(
            "/usr/bin/time -v tilejob run $TASK 1\n\
             exitcode=$?\n\
             echo \"tilejob exited with code: $exitcode\"\n\
             exit $exitcode\n"
        ));
    }

    #[test]
    fn pbs_caps_array_size() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Schedulers::from_cluster("gordon").unwrap();

        let (instructions, path) = scheduler
            .write_submit_script(&script(dir.path(), Some(1500)))
            .unwrap();
        let content = fs::read_to_string(path).unwrap();

        assert!(content.contains("#PBS -t 1-1000\n"));
        assert!(!content.contains("1-1500"));
        assert!(instructions.starts_with(&format!(
            "cd \"{}\";qsub runjobs.sh",
            dir.path().display()
        )));
        assert!(instructions.contains("WARNING: 1500 tasks"));
        assert!(instructions.contains("re-run"));

        let (instructions, path) = scheduler
            .write_submit_script(&script(dir.path(), Some(1000)))
            .unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("#PBS -t 1-1000\n"));
        assert!(!instructions.contains("WARNING"));
    }

    #[test]
    fn unlimited_arrays_are_not_capped() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Schedulers::from_cluster("rocce").unwrap();

        let (instructions, _) = scheduler
            .write_submit_script(&script(dir.path(), Some(5000)))
            .unwrap();

        assert!(instructions.ends_with("qsub -t 1-5000 runjobs.sh"));
    }

    #[test]
    fn account_override() {
        let mut scheduler = Schedulers::from_cluster("comet").unwrap();
        scheduler.set_account(Some("abc123".to_string()));

        let header = scheduler.build_header(&HeaderParams {
            working_dir: Path::new("/job"),
            stdout_path: "/job/out",
            job_name: "segment",
            walltime: "01:00:00",
            required_mem_gb: None,
            task_count: None,
        });

        assert!(header.contains("#SBATCH -A abc123\n"));
    }
}
