//! Progress reporting for tiled segmentation jobs.
//!
//! Everything in here is pure formatting over numbers gathered elsewhere; the
//! runner collects completion counts and resource usage and hands them over as
//! [`TaskStats`].

mod format;

pub use format::{group_thousands, group_thousands_f64};

/// hours in a (non leap) year, used to make large CPU figures readable
pub const HOURS_PER_YEAR: f64 = 8760.0;

const SECONDS_PER_HOUR: f64 = 3600.0;
const KB_PER_GB: f64 = 1024.0 * 1024.0;

/// placeholder for any value that can't be computed (yet)
pub const NOT_AVAILABLE: &str = "NA";

#[derive(Debug, Clone, Default, PartialEq)]
/// completion and resource usage figures for one task population
pub struct TaskStats {
    pub completed: i64,
    pub total: i64,
    /// number of tasks that reported usage, the divisor for all averages
    pub tasks_with_usage: u64,
    pub cpu_seconds: f64,
    pub wall_seconds: f64,
    /// sum of the peak memory of every task with usage
    pub total_rss_kb: f64,
}

impl TaskStats {
    pub fn new(completed: i64, total: i64) -> Self {
        Self {
            completed,
            total,
            ..Default::default()
        }
    }

    /// fold a single task's usage report into the aggregate
    pub fn add_usage(&mut self, cpu_seconds: f64, wall_seconds: f64, peak_rss_kb: f64) {
        self.tasks_with_usage += 1;
        self.cpu_seconds += cpu_seconds;
        self.wall_seconds += wall_seconds;
        self.total_rss_kb += peak_rss_kb;
    }

    pub fn remaining(&self) -> i64 {
        (self.total - self.completed).max(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// job wide settings echoed at the top of a summary
pub struct JobOverview {
    pub version: String,
    pub tile_size: String,
    pub overlap_size: String,
    pub disable_histeq: bool,
    pub tiles_per_task: usize,
    pub tasks_per_node: usize,
    pub model: String,
    pub binary: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskSummary {
    overview: Option<JobOverview>,
    segmentation: Option<TaskStats>,
    merge: Option<TaskStats>,
}

impl TaskSummary {
    pub fn new(
        overview: Option<JobOverview>,
        segmentation: Option<TaskStats>,
        merge: Option<TaskStats>,
    ) -> Self {
        Self {
            overview,
            segmentation,
            merge,
        }
    }

    pub fn segmentation_stats(&self) -> Option<&TaskStats> {
        self.segmentation.as_ref()
    }

    pub fn merge_stats(&self) -> Option<&TaskStats> {
        self.merge.as_ref()
    }

    /// Human readable summary of the job configuration and task completion
    pub fn summary(&self) -> String {
        let mut out = String::new();

        if let Some(overview) = &self.overview {
            out.push_str(&format!(
                "tilejob version: {}\n\
                 Tiles: {} with {} overlap\n\
                 Disable histogram equalization: {}\n\
                 Tasks: {} tiles per task, {} tasks(s) per node\n\
                 Trained model: {}\n\
                 Segmentation binary: {}\n\n",
                overview.version,
                overview.tile_size,
                overview.overlap_size,
                overview.disable_histeq,
                overview.tiles_per_task,
                overview.tasks_per_node,
                overview.model,
                overview.binary,
            ));
        }

        out.push_str(&format!(
            "Segmentation tasks: {}\n",
            completion_summary(self.segmentation.as_ref())
        ));
        out.push_str(&format!(
            "Merge tasks: {}\n",
            completion_summary(self.merge.as_ref())
        ));

        out
    }

    /// [`Self::summary`] followed by compute projections for both populations
    pub fn detailed_summary(&self) -> String {
        let mut out = self.summary();

        out.push_str(&compute_summary("Segmentation", self.segmentation.as_ref()));
        out.push_str(&compute_summary("Merge", self.merge.as_ref()));

        out
    }
}

/// `N% complete (a of b completed)` or `NA` if no stats were gathered
pub fn completion_summary(stats: Option<&TaskStats>) -> String {
    let Some(stats) = stats else {
        return NOT_AVAILABLE.to_string();
    };

    if stats.total <= 0 {
        return "Total number of tasks is <= 0".to_string();
    }

    let percent = (stats.completed as f64 / stats.total as f64) * 100.0;

    format!(
        "{percent:.0}% complete ({} of {} completed)",
        group_thousands(stats.completed),
        group_thousands(stats.total)
    )
}

/// Runtime, memory and remaining compute estimates for a population.
///
/// Returns an empty string without stats. Every figure that depends on usage
/// reports degrades to `NA` until at least one task reported usage.
pub fn compute_summary(prefix: &str, stats: Option<&TaskStats>) -> String {
    let Some(stats) = stats else {
        return String::new();
    };

    let (runtime, memory, consumed, consumed_years, remaining, remaining_years) =
        if stats.tasks_with_usage == 0 {
            let na = || NOT_AVAILABLE.to_string();
            (na(), na(), na(), na(), na(), na())
        } else {
            let tasks = stats.tasks_with_usage as f64;
            let cpu_hours = stats.cpu_seconds / SECONDS_PER_HOUR;
            let remaining_hours = (cpu_hours / tasks) * stats.remaining() as f64;

            (
                group_thousands_f64(stats.wall_seconds / tasks / SECONDS_PER_HOUR),
                group_thousands_f64(stats.total_rss_kb / tasks / KB_PER_GB),
                group_thousands_f64(cpu_hours),
                group_thousands_f64(cpu_hours / HOURS_PER_YEAR),
                group_thousands_f64(remaining_hours),
                group_thousands_f64(remaining_hours / HOURS_PER_YEAR),
            )
        };

    format!(
        "\n{prefix} runtime: {runtime} hours per task ({memory}GB ram)\n\
         {prefix} CPU consumption so far: {consumed} CPU hours (~{consumed_years} years)\n\
         {prefix} estimated remaining compute: {remaining} CPU hours (~{remaining_years} years)\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overview() -> JobOverview {
        JobOverview {
            version: "0.1.0".to_string(),
            tile_size: "500x500".to_string(),
            overlap_size: "20x20".to_string(),
            disable_histeq: true,
            tiles_per_task: 1,
            tasks_per_node: 1,
            model: "./model".to_string(),
            binary: "./chm".to_string(),
        }
    }

    #[test]
    fn completion_without_stats() {
        assert_eq!(completion_summary(None), "NA");
    }

    #[test]
    fn completion_with_zero_total() {
        assert_eq!(
            completion_summary(Some(&TaskStats::new(0, 0))),
            "Total number of tasks is <= 0"
        );
        assert_eq!(
            completion_summary(Some(&TaskStats::new(3, -1))),
            "Total number of tasks is <= 0"
        );
    }

    #[test]
    fn completion_percentages() {
        assert_eq!(
            completion_summary(Some(&TaskStats::new(0, 2))),
            "0% complete (0 of 2 completed)"
        );
        assert_eq!(
            completion_summary(Some(&TaskStats::new(1, 2))),
            "50% complete (1 of 2 completed)"
        );
        assert_eq!(
            completion_summary(Some(&TaskStats::new(2, 2))),
            "100% complete (2 of 2 completed)"
        );
        assert_eq!(
            completion_summary(Some(&TaskStats::new(3490, 10000))),
            "35% complete (3,490 of 10,000 completed)"
        );
    }

    #[test]
    fn summary_without_anything() {
        let summary = TaskSummary::default();

        assert_eq!(summary.summary(), "Segmentation tasks: NA\nMerge tasks: NA\n");
    }

    #[test]
    fn summary_with_both_populations() {
        let summary = TaskSummary::new(
            None,
            Some(TaskStats::new(1, 2)),
            Some(TaskStats::new(3, 4)),
        );

        assert_eq!(summary.segmentation_stats().unwrap().completed, 1);
        assert_eq!(summary.merge_stats().unwrap().total, 4);
        assert_eq!(
            summary.summary(),
            "Segmentation tasks: 50% complete (1 of 2 completed)\n\
             Merge tasks: 75% complete (3 of 4 completed)\n"
        );
    }

    #[test]
    fn summary_with_overview() {
        let summary = TaskSummary::new(Some(overview()), None, Some(TaskStats::new(1, 2)));

        assert_eq!(
            summary.summary(),
            "tilejob version: 0.1.0\n\
             Tiles: 500x500 with 20x20 overlap\n\
             Disable histogram equalization: true\n\
             Tasks: 1 tiles per task, 1 tasks(s) per node\n\
             Trained model: ./model\n\
             Segmentation binary: ./chm\n\n\
             Segmentation tasks: NA\n\
             Merge tasks: 50% complete (1 of 2 completed)\n"
        );
    }

    #[test]
    fn compute_summary_without_stats() {
        assert_eq!(compute_summary("foo", None), "");
    }

    #[test]
    fn compute_summary_without_usage_is_na() {
        let result = compute_summary("foo", Some(&TaskStats::new(0, 10)));

        assert!(result.contains("\nfoo runtime: NA hours per task (NAGB ram)\n"));
        assert!(result.contains("foo CPU consumption so far: NA CPU hours (~NA years)\n"));
        assert!(result.contains("foo estimated remaining compute: NA CPU hours (~NA years)\n"));
    }

    #[test]
    fn compute_summary_single_task() {
        let mut stats = TaskStats::new(1, 3);
        stats.add_usage(10800.0, 3600.0, 1024.0 * 1024.0);

        let result = compute_summary("foo", Some(&stats));

        assert!(result.contains("\nfoo runtime: 1.0 hours per task (1.0GB ram)\n"));
        assert!(result.contains("foo CPU consumption so far: 3.0 CPU hours (~0.0 years)\n"));
        assert!(result.contains("foo estimated remaining compute: 6.0 CPU hours (~0.0 years)\n"));
    }

    #[test]
    fn compute_summary_years_of_compute() {
        let stats = TaskStats {
            completed: 10000,
            total: 20000,
            tasks_with_usage: 10000,
            cpu_seconds: 31_536_000.0,
            wall_seconds: 7_200_000.0,
            total_rss_kb: 10000.0 * 5.0 * 1024.0 * 1024.0,
        };

        let result = compute_summary("foo", Some(&stats));

        assert!(result.contains("\nfoo runtime: 0.2 hours per task (5.0GB ram)\n"));
        assert!(result.contains("foo CPU consumption so far: 8,760.0 CPU hours (~1.0 years)\n"));
        assert!(
            result.contains("foo estimated remaining compute: 8,760.0 CPU hours (~1.0 years)\n")
        );
    }

    #[test]
    fn memory_is_averaged_over_tasks() {
        let mut stats = TaskStats::new(2, 2);
        stats.add_usage(3600.0, 3600.0, 1024.0 * 1024.0);
        stats.add_usage(3600.0, 3600.0, 3.0 * 1024.0 * 1024.0);

        assert_eq!(stats.total_rss_kb, 4.0 * 1024.0 * 1024.0);
        assert!(compute_summary("foo", Some(&stats)).contains("(2.0GB ram)"));
    }

    #[test]
    fn remaining_never_negative() {
        assert_eq!(TaskStats::new(5, 3).remaining(), 0);
    }
}
