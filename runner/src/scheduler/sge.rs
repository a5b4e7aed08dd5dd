use super::{ClusterProfile, HeaderParams, Tokens};

pub(super) const TOKENS: Tokens = Tokens {
    submit: "qsub",
    array_flag: Some("-t"),
    jobid: "$JOB_ID",
    jobid_for_arrayjob: "$JOB_ID",
    taskid: "$SGE_TASK_ID",
    jobid_for_filepath: "$JOB_ID",
    array_jobid_for_filepath: "$JOB_ID",
    taskid_for_filepath: "$TASK_ID",
};

#[derive(Debug, Clone)]
/// Sun/Univa Grid Engine, arrays are requested on `qsub`
pub struct SgeScheduler {
    pub(super) profile: ClusterProfile,
}

impl SgeScheduler {
    pub fn new(profile: ClusterProfile) -> Self {
        Self { profile }
    }

    pub fn build_header(&self, params: &HeaderParams) -> String {
        let mut header = format!(
            "#!/bin/sh\n#\n#$ -V\n#$ -S /bin/sh\n#$ -wd {}\n#$ -o {}\n#$ -j y\n#$ -N {}\n",
            params.working_dir.display(),
            params.stdout_path,
            params.job_name
        );

        header.push_str(&format!("#$ -l h_rt={}", params.walltime));
        if let Some(memory) = params.required_mem_gb {
            header.push_str(&format!(",h_vmem={memory}G"));
        }
        header.push('\n');

        if let Some(queue) = &self.profile.queue {
            header.push_str(&format!("#$ -q {queue}\n"));
        }
        if let Some(account) = &self.profile.account {
            header.push_str(&format!("#$ -A {account}\n"));
        }
        header.push_str("#$ -m n\n");

        header
    }
}
