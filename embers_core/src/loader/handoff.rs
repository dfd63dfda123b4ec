use std::path::PathBuf;

use async_trait::async_trait;

use crate::loader::models::LoadRun;
use crate::loader::traits::Handoff;
use crate::{Error, Result};

/// Runs an external command after each committed load (e.g. `dbt build --select stg_fire_incidents`).
///
/// The command receives `EMBERS_RUN_ID`, `EMBERS_WATERMARK` (empty when none)
/// and `EMBERS_ROWS_WRITTEN` in its environment. A non-zero exit fails the run.
#[derive(Debug, Clone)]
pub struct CommandHandoff {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandHandoff {
    pub fn new(argv: Vec<String>, working_dir: Option<PathBuf>) -> Result<Self> {
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput("handoff command is empty".to_string()))?;
        Ok(Self {
            program,
            args: argv.collect(),
            working_dir,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Handoff for CommandHandoff {
    #[tracing::instrument(level = "info", skip_all, fields(program = %self.program, run_id = %run.run_id))]
    async fn notify(&self, run: &LoadRun) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .env("EMBERS_RUN_ID", run.run_id.to_string())
            .env(
                "EMBERS_WATERMARK",
                run.watermark_after
                    .map(|w| w.to_storage_string())
                    .unwrap_or_default(),
            )
            .env("EMBERS_ROWS_WRITTEN", run.rows_written.to_string())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let status = cmd
            .status()
            .await
            .map_err(|e| Error::backend(format!("spawn handoff '{}'", self.program), e))?;
        if !status.success() {
            return Err(Error::BackendMessage(format!(
                "handoff '{}' exited with {status}",
                self.program
            )));
        }
        tracing::info!("handoff completed");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::loader::models::RunTrigger;
    use chrono::Utc;

    fn run() -> LoadRun {
        LoadRun::new_running("latest_data", RunTrigger::Incremental, Utc::now()).unwrap()
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandHandoff::new(vec![], None).is_err());
        assert!(CommandHandoff::new(vec!["  ".into()], None).is_err());
    }

    #[tokio::test]
    async fn exit_status_decides_outcome() {
        let ok = CommandHandoff::new(vec!["sh".into(), "-c".into(), "exit 0".into()], None).unwrap();
        ok.notify(&run()).await.unwrap();

        let failing =
            CommandHandoff::new(vec!["sh".into(), "-c".into(), "exit 3".into()], None).unwrap();
        let err = failing.notify(&run()).await.unwrap_err();
        assert!(matches!(err, Error::BackendMessage(_)));
    }

    #[tokio::test]
    async fn run_details_are_exported() {
        let mut r = run();
        r.rows_written = 7;
        let check = format!(
            "test \"$EMBERS_RUN_ID\" = \"{}\" && test \"$EMBERS_ROWS_WRITTEN\" = 7",
            r.run_id
        );
        let h = CommandHandoff::new(vec!["sh".into(), "-c".into(), check], None).unwrap();
        h.notify(&r).await.unwrap();
    }
}
