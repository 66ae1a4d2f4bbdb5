//! Reads JSON-line commands from an async reader (spec.md §4.5).

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

use super::Command;

/// Reads newline-delimited JSON commands, skipping blank lines and logging
/// (never failing on) malformed ones — a bad line from the editor should
/// never take the whole daemon down.
pub struct CommandReader<R> {
    lines: tokio::io::Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> CommandReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Returns `Ok(None)` on EOF — callers treat that the same as a clean
    /// stop signal (spec.md §6 "Exit behaviour").
    pub async fn next_command(&mut self) -> anyhow::Result<Option<Command>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Command>(&line) {
                Ok(cmd) => return Ok(Some(cmd)),
                Err(e) => {
                    warn!(error = %e, line, "discarding malformed command line");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::CommandPayload;

    #[tokio::test]
    async fn reads_commands_and_skips_malformed_lines() {
        let input = b"not json\n{\"streamId\":\"s1\",\"removeStream\":{}}\n\n".to_vec();
        let mut reader = CommandReader::new(&input[..]);
        let cmd = reader.next_command().await.unwrap().unwrap();
        assert_eq!(cmd.stream_id, "s1");
        assert!(matches!(cmd.payload, CommandPayload::RemoveStream(_)));
        assert!(reader.next_command().await.unwrap().is_none());
    }
}
