// Textual command channel
//
// The debugger controls the debuggee over a line-oriented pipe. Commands
// are colon-delimited tokens; the debuggee answers every command with the
// readiness token. Any other reply is a protocol violation.

use crate::error::{HarnessError, HarnessResult};
use crate::event::EventTag;
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Reply the debuggee sends after completing a command.
pub const READY: &str = "READY";

/// Reply prefix the debuggee sends when it cannot execute a command.
pub const ERROR_PREFIX: &str = "ERROR:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebuggeeCommand {
    /// `createActionsExecutors:<eventsCount>:<space-separated event type names>`
    CreateActionsExecutors {
        events_count: u32,
        tags: Vec<EventTag>,
    },
    StartExecution,
    WaitExecutionCompletion,
    StopExecution,
    Quit,
}

impl DebuggeeCommand {
    pub fn parse(line: &str) -> HarnessResult<Self> {
        let line = line.trim();
        let mut parts = line.splitn(3, ':');
        let name = parts.next().unwrap_or_default();

        match name {
            "createActionsExecutors" => {
                let count_token = parts
                    .next()
                    .ok_or_else(|| bad_command(line, "missing events count"))?;
                let events_count: u32 = count_token
                    .parse()
                    .map_err(|_| bad_command(line, "events count is not a number"))?;
                let tag_tokens = parts
                    .next()
                    .ok_or_else(|| bad_command(line, "missing event type list"))?;
                let mut tags = Vec::new();
                for token in tag_tokens.split_whitespace() {
                    tags.push(token.parse::<EventTag>().map_err(|_| {
                        bad_command(line, &format!("unknown event type {:?}", token))
                    })?);
                }
                if tags.is_empty() {
                    return Err(bad_command(line, "empty event type list"));
                }
                Ok(DebuggeeCommand::CreateActionsExecutors { events_count, tags })
            }
            "startExecution" => Ok(DebuggeeCommand::StartExecution),
            "waitExecutionCompletion" => Ok(DebuggeeCommand::WaitExecutionCompletion),
            "stopExecution" => Ok(DebuggeeCommand::StopExecution),
            "quit" => Ok(DebuggeeCommand::Quit),
            other => Err(HarnessError::Protocol(format!(
                "unknown debuggee command: {:?}",
                other
            ))),
        }
    }
}

fn bad_command(line: &str, reason: &str) -> HarnessError {
    HarnessError::Protocol(format!("malformed command {:?}: {}", line, reason))
}

impl fmt::Display for DebuggeeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebuggeeCommand::CreateActionsExecutors { events_count, tags } => {
                let names: Vec<&str> = tags.iter().map(|t| t.name()).collect();
                write!(f, "createActionsExecutors:{}:{}", events_count, names.join(" "))
            }
            DebuggeeCommand::StartExecution => f.write_str("startExecution"),
            DebuggeeCommand::WaitExecutionCompletion => f.write_str("waitExecutionCompletion"),
            DebuggeeCommand::StopExecution => f.write_str("stopExecution"),
            DebuggeeCommand::Quit => f.write_str("quit"),
        }
    }
}

/// Debugger-side end of the command channel. Each `execute` writes one
/// command line and blocks until the readiness token comes back.
pub struct CommandChannel {
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
}

impl CommandChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(reader)),
            writer: Box::new(writer),
        }
    }

    pub async fn execute(&mut self, command: &DebuggeeCommand) -> HarnessResult<()> {
        let line = command.to_string();
        debug!(command = %line, "sending debuggee command");

        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        let read = self.reader.read_line(&mut reply).await?;
        if read == 0 {
            return Err(HarnessError::Disconnected);
        }
        let reply = reply.trim();
        if reply != READY {
            return Err(HarnessError::Protocol(format!(
                "debuggee replied {:?} to {:?}, expected {:?}",
                reply, line, READY
            )));
        }
        debug!(command = %line, "debuggee ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_executors_round_trips() {
        let command = DebuggeeCommand::CreateActionsExecutors {
            events_count: 3,
            tags: vec![
                EventTag::MonitorContendedEnter,
                EventTag::MonitorContendedEntered,
            ],
        };
        let line = command.to_string();
        assert_eq!(
            line,
            "createActionsExecutors:3:monitor-contended-enter monitor-contended-entered"
        );
        assert_eq!(DebuggeeCommand::parse(&line).unwrap(), command);
    }

    #[test]
    fn bare_commands_parse() {
        assert_eq!(
            DebuggeeCommand::parse("startExecution").unwrap(),
            DebuggeeCommand::StartExecution
        );
        assert_eq!(
            DebuggeeCommand::parse("waitExecutionCompletion\n").unwrap(),
            DebuggeeCommand::WaitExecutionCompletion
        );
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(DebuggeeCommand::parse("createActionsExecutors").is_err());
        assert!(DebuggeeCommand::parse("createActionsExecutors:x:thread-start").is_err());
        assert!(DebuggeeCommand::parse("createActionsExecutors:1:").is_err());
        assert!(DebuggeeCommand::parse("createActionsExecutors:1:not-a-tag").is_err());
        assert!(DebuggeeCommand::parse("resumeAll").is_err());
    }

    #[tokio::test]
    async fn execute_rejects_non_ready_reply() {
        let (debugger_io, mut debuggee_io) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(debugger_io);
        let mut channel = CommandChannel::new(read_half, write_half);

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 256];
            let _ = debuggee_io.read(&mut buf).await.unwrap();
            debuggee_io.write_all(b"ERROR: nope\n").await.unwrap();
        });

        let err = channel
            .execute(&DebuggeeCommand::StartExecution)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
        server.await.unwrap();
    }
}
