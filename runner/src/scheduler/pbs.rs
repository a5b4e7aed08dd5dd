use super::{ClusterProfile, HeaderParams, Tokens};

/// Torque refuses larger job arrays in a single submission
pub const PBS_MAX_ARRAY_TASKS: usize = 1000;

pub(super) const TOKENS: Tokens = Tokens {
    submit: "qsub",
    array_flag: None,
    jobid: "$PBS_JOBID",
    jobid_for_arrayjob: "$PBS_JOBID",
    taskid: "$PBS_ARRAYID",
    jobid_for_filepath: "$PBS_JOBID",
    array_jobid_for_filepath: "$PBS_JOBID",
    taskid_for_filepath: "$PBS_ARRAYID",
};

#[derive(Debug, Clone)]
/// PBS/Torque, the array range is part of the script header
pub struct PbsScheduler {
    pub(super) profile: ClusterProfile,
}

impl PbsScheduler {
    pub fn new(profile: ClusterProfile) -> Self {
        Self { profile }
    }

    pub fn build_header(&self, params: &HeaderParams) -> String {
        let mut header = format!(
            "#!/bin/sh\n#\n#PBS -m n\n#PBS -V\n#PBS -N {}\n#PBS -d {}\n#PBS -o {}\n#PBS -j oe\n",
            params.job_name,
            params.working_dir.display(),
            params.stdout_path
        );

        if let Some(queue) = &self.profile.queue {
            header.push_str(&format!("#PBS -q {queue}\n"));
        }
        if let Some(account) = &self.profile.account {
            header.push_str(&format!("#PBS -A {account}\n"));
        }

        header.push_str(&format!(
            "#PBS -l nodes=1:ppn=16:native,walltime={}",
            params.walltime
        ));
        if let Some(memory) = params.required_mem_gb {
            header.push_str(&format!(",mem={memory}gb"));
        }
        header.push('\n');

        if let Some(count) = params.task_count {
            header.push_str(&format!("#PBS -t 1-{count}\n"));
        }

        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn params(task_count: Option<usize>) -> HeaderParams<'static> {
        HeaderParams {
            working_dir: Path::new("/job"),
            stdout_path: "/job/out",
            job_name: "merge",
            walltime: "01:00:00",
            required_mem_gb: None,
            task_count,
        }
    }

    #[test]
    fn array_range_in_header() {
        let mut profile = ClusterProfile::by_name("gordon").unwrap();
        profile.account = Some("acct".to_string());
        let scheduler = PbsScheduler::new(profile);

        let header = scheduler.build_header(&params(Some(12)));

        assert!(header.contains("#PBS -q normal\n#PBS -A acct\n"));
        assert!(header.contains("walltime=01:00:00\n"));
        assert!(header.ends_with("#PBS -t 1-12\n"));
    }

    #[test]
    fn single_job_has_no_range() {
        let scheduler = PbsScheduler::new(ClusterProfile::by_name("gordon").unwrap());

        assert!(!scheduler.build_header(&params(None)).contains("#PBS -t"));
    }
}
