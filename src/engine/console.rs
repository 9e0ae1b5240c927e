//! Line-oriented console transport for the control facade.
//!
//! ```text
//! status
//! id <name>
//! start <app-id> <job>
//! stop <app-id> <job>
//! process <app-id> <data>
//! help | quit
//! ```

use super::facade::{ControlFacade, JobRef};
use crate::error::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Id(String),
    Start { app_id: u64, job: JobRef },
    Stop { app_id: u64, job: JobRef },
    Process { app_id: u64, data: String },
    Help,
    Quit,
}

const USAGE: &str = "commands: status | id <name> | start <app-id> <job> | \
                     stop <app-id> <job> | process <app-id> <data> | help | quit";

impl ControlCommand {
    /// Parse one line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Ok(None);
        };
        let mut arg = |what: &str| {
            parts
                .next()
                .map(str::to_string)
                .ok_or_else(|| format!("{verb}: missing {what}"))
        };
        let app_id = |raw: String| {
            raw.parse::<u64>()
                .map_err(|_| format!("app id must be a number, got '{raw}'"))
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "status" => ControlCommand::Status,
            "id" => ControlCommand::Id(arg("name")?),
            "start" => ControlCommand::Start {
                app_id: app_id(arg("app id")?)?,
                job: job_ref(&arg("job")?),
            },
            "stop" => ControlCommand::Stop {
                app_id: app_id(arg("app id")?)?,
                job: job_ref(&arg("job")?),
            },
            "process" => ControlCommand::Process {
                app_id: app_id(arg("app id")?)?,
                data: arg("data")?,
            },
            "help" | "?" => ControlCommand::Help,
            "quit" | "exit" => ControlCommand::Quit,
            other => return Err(format!("unknown command '{other}'")),
        };
        Ok(Some(command))
    }
}

fn job_ref(raw: &str) -> JobRef {
    match raw.parse() {
        Ok(job) => job,
        Err(never) => match never {},
    }
}

/// Run one command against the facade and render the reply.
pub async fn execute(facade: &ControlFacade, command: &ControlCommand) -> String {
    match command {
        ControlCommand::Status => facade.view_status_info().await,
        ControlCommand::Id(name) => facade.get_app_id(name).await.to_string(),
        ControlCommand::Start { app_id, job } => facade.start_job(*app_id, job).await.to_string(),
        ControlCommand::Stop { app_id, job } => facade.stop_job(*app_id, job).await.to_string(),
        ControlCommand::Process { app_id, data } => {
            facade.process_data(*app_id, data).await.to_string()
        }
        ControlCommand::Help => USAGE.to_string(),
        ControlCommand::Quit => "bye".to_string(),
    }
}

/// Serve commands from `input` until EOF or `quit`.
pub async fn run_console<R, W>(facade: &ControlFacade, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match ControlCommand::parse(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => {
                debug!(?command, "console command");
                let reply = execute(facade, &command).await;
                if command == ControlCommand::Quit {
                    write_reply(&mut output, &reply).await?;
                    break;
                }
                reply
            }
            Err(message) => format!("error: {message}\n{USAGE}"),
        };
        write_reply(&mut output, &reply).await?;
    }
    Ok(())
}

async fn write_reply<W: AsyncWrite + Unpin>(output: &mut W, reply: &str) -> Result<()> {
    output.write_all(reply.trim_end().as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkerId;

    #[test]
    fn parses_commands() {
        assert_eq!(ControlCommand::parse("  ").unwrap(), None);
        assert_eq!(
            ControlCommand::parse("start 0 fax-out").unwrap(),
            Some(ControlCommand::Start {
                app_id: 0,
                job: JobRef::Name("fax-out".to_string())
            })
        );
        assert_eq!(
            ControlCommand::parse("STOP 2 2").unwrap(),
            Some(ControlCommand::Stop {
                app_id: 2,
                job: JobRef::Id(WorkerId(2))
            })
        );
        assert!(ControlCommand::parse("start x y").is_err());
        assert!(ControlCommand::parse("process 1").is_err());
        assert!(ControlCommand::parse("reboot").is_err());
    }
}
