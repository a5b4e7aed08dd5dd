use super::{EXIT_GENERIC_FAILURE, EXIT_SUCCESS};
use std::{
    io,
    process::{Child, Command, ExitStatus},
    sync::mpsc,
    thread,
};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Order in which finished children are reported
pub enum CollectionOrder {
    // wait on children in the order they were started, a slow first task
    // delays reporting of the others
    #[default]
    Spawn,
    Completion,
}

#[derive(Debug)]
pub struct PendingTask {
    pub id: String,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub id: String,
    // None if the child could not be waited on
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub exits: Vec<TaskExit>,
}

impl BatchReport {
    /// first non-zero exit code in collection order
    pub fn exit_code(&self) -> i32 {
        self.exits
            .iter()
            .filter_map(|exit| exit.exit_code)
            .find(|code| *code != EXIT_SUCCESS)
            .unwrap_or(EXIT_SUCCESS)
    }

    pub fn failed(&self) -> usize {
        self.exits
            .iter()
            .filter(|exit| matches!(exit.exit_code, Some(code) if code != EXIT_SUCCESS))
            .count()
    }
}

/// Fans out one child process per task and waits for all of them
#[derive(Debug, Clone)]
pub struct ProcessPool {
    order: CollectionOrder,
}

fn exit_code(status: ExitStatus) -> i32 {
    // killed by a signal
    status.code().unwrap_or(EXIT_GENERIC_FAILURE)
}

impl ProcessPool {
    pub fn new(order: CollectionOrder) -> Self {
        Self { order }
    }

    /// Start every task without waiting on the previous ones, then collect
    pub fn run(&self, tasks: Vec<PendingTask>) -> BatchReport {
        let children = tasks
            .into_iter()
            .map(|PendingTask { id, mut command }| {
                debug!(task = %id, command = ?command, "Spawning task");
                let child = command.spawn();
                (id, child)
            })
            .collect::<Vec<_>>();

        let exits = match self.order {
            CollectionOrder::Spawn => collect_in_spawn_order(children),
            CollectionOrder::Completion => collect_in_completion_order(children),
        };

        let report = BatchReport { exits };
        info!(
            "Batch finished, {} of {} tasks failed",
            report.failed(),
            report.exits.len()
        );

        report
    }
}

/// One blocking waiter per child, exits are reported as the waiters return.
///
/// Each waiter only waits on its own child, children started elsewhere in the
/// process are never reaped here.
fn collect_in_completion_order(children: Vec<(String, io::Result<Child>)>) -> Vec<TaskExit> {
    let mut exits = Vec::with_capacity(children.len());
    let (sender, receiver) = mpsc::channel();

    thread::scope(|scope| {
        for (id, child) in children {
            match child {
                Ok(mut child) => {
                    let sender = sender.clone();
                    scope.spawn(move || {
                        let exit = match child.wait() {
                            Ok(status) => finished(id, status),
                            Err(error) => lost(id, &error),
                        };
                        // the receiver outlives the scope
                        let _ = sender.send(exit);
                    });
                }
                Err(error) => exits.push(spawn_failure(id, &error)),
            }
        }

        // closes the channel once the last waiter is done
        drop(sender);
        exits.extend(receiver.iter());
    });

    exits
}

fn collect_in_spawn_order(children: Vec<(String, io::Result<Child>)>) -> Vec<TaskExit> {
    children
        .into_iter()
        .map(|(id, child)| match child {
            Ok(mut child) => match child.wait() {
                Ok(status) => finished(id, status),
                Err(error) => lost(id, &error),
            },
            Err(error) => spawn_failure(id, &error),
        })
        .collect()
}

fn finished(id: String, status: ExitStatus) -> TaskExit {
    let code = exit_code(status);

    if code == EXIT_SUCCESS {
        debug!(task = %id, "Task finished");
    } else {
        warn!(task = %id, "Task exited with code {code}");
    }

    TaskExit {
        id,
        exit_code: Some(code),
    }
}

fn lost(id: String, error: &io::Error) -> TaskExit {
    error!(task = %id, error = ?error, "Failed to wait for task, continuing with the others");

    TaskExit {
        id,
        exit_code: None,
    }
}

fn spawn_failure(id: String, error: &io::Error) -> TaskExit {
    error!(task = %id, error = ?error, "Failed to start task");

    TaskExit {
        id,
        exit_code: Some(EXIT_GENERIC_FAILURE),
    }
}
