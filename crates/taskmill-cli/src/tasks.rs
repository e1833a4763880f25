use std::process::{Command, Output};
use std::sync::Arc;

use anyhow::Context;
use taskmill_core::TaskConfig;
use taskmill_scheduler::{Message, Runner, Scheduler, Task, TaskDefinition};
use tracing::debug;

/// Longest stdout/stderr excerpt kept in a record's message.
const MAX_OUTPUT_CHARS: usize = 2000;

/// A configured shell command run as a scheduled task.
///
/// Exit status 0 is SUCCESS, anything else FAILURE. A command that cannot be
/// spawned at all is reported as an error and also recorded as FAILURE.
pub struct CommandTask {
    definition: TaskDefinition,
    program: String,
    args: Vec<String>,
}

impl CommandTask {
    pub fn from_config(config: &TaskConfig) -> taskmill_scheduler::Result<Self> {
        let mut definition =
            TaskDefinition::from_spec(&config.identity, config.display_name(), &config.interval)?
                .with_force_run_in_progress(config.force_run_in_progress);
        if let Some(secs) = config.stale_after_secs {
            definition = definition.with_stale_after(secs);
        }
        Ok(Self {
            definition,
            program: config.command.clone(),
            args: config.args.clone(),
        })
    }

    fn command(&self) -> Command {
        if self.args.is_empty() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.program);
            cmd
        } else {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args);
            cmd
        }
    }
}

impl Task for CommandTask {
    fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    fn start(&self, runner: &Runner) -> anyhow::Result<Message> {
        debug!(identity = %runner.identity(), run_id = %runner.run_id(), program = %self.program, "spawning command");
        let output = self
            .command()
            .env("TASKMILL_TASK", runner.identity().as_str())
            .env("TASKMILL_RUN_ID", runner.run_id().to_string())
            .output()
            .with_context(|| format!("failed to spawn {:?}", self.program))?;
        Ok(to_message(&output))
    }

    fn type_name(&self) -> &str {
        "CommandTask"
    }
}

fn to_message(output: &Output) -> Message {
    let stdout = excerpt(&output.stdout);
    if output.status.success() {
        return Message::success(stdout);
    }
    let stderr = excerpt(&output.stderr);
    let detail = if stderr.is_empty() { stdout } else { stderr };
    let status = match output.status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    };
    if detail.is_empty() {
        Message::failure(status)
    } else {
        Message::failure(format!("{status}: {detail}"))
    }
}

/// Trimmed output, keeping the tail when it is too long.
fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let count = text.chars().count();
    if count <= MAX_OUTPUT_CHARS {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - MAX_OUTPUT_CHARS).collect();
    format!("...{tail}")
}

/// Register every configured task, in declaration order.
pub fn build_scheduler(
    scheduler: Scheduler,
    tasks: &[TaskConfig],
) -> taskmill_scheduler::Result<Scheduler> {
    let mut scheduler = scheduler;
    for config in tasks {
        let task = CommandTask::from_config(config)?;
        scheduler.add_task(Arc::new(task))?;
    }
    Ok(scheduler)
}
