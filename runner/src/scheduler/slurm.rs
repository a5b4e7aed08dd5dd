use super::{ClusterProfile, HeaderParams, Tokens};

pub(super) const TOKENS: Tokens = Tokens {
    submit: "sbatch",
    array_flag: Some("-a"),
    jobid: "$SLURM_JOB_ID",
    jobid_for_arrayjob: "$SLURM_ARRAY_JOB_ID",
    taskid: "$SLURM_ARRAY_TASK_ID",
    jobid_for_filepath: "%j",
    array_jobid_for_filepath: "%A",
    taskid_for_filepath: "%a",
};

#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    pub(super) profile: ClusterProfile,
}

impl SlurmScheduler {
    pub fn new(profile: ClusterProfile) -> Self {
        Self { profile }
    }

    pub fn build_header(&self, params: &HeaderParams) -> String {
        let mut header = String::from("#!/bin/sh\n#\n#SBATCH --nodes=1\n");

        if let Some(account) = &self.profile.account {
            header.push_str(&format!("#SBATCH -A {account}\n"));
        }
        if let Some(partition) = &self.profile.queue {
            header.push_str(&format!("#SBATCH -p {partition}\n"));
        }

        header.push_str(&format!(
            "#SBATCH -D {}\n#SBATCH -o {}\n#SBATCH -J {}\n#SBATCH -t {}\n",
            params.working_dir.display(),
            params.stdout_path,
            params.job_name,
            params.walltime
        ));

        if let Some(memory) = params.required_mem_gb {
            header.push_str(&format!("#SBATCH --mem={memory}G\n"));
        }

        header
    }
}
