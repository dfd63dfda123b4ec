use clap::Parser;
use embers_cli::backends::{Stores, build_pipeline, target_schema};
use embers_cli::cli::{Cli, Commands, RunArgs, WatermarkAction};
use embers_core::config::EmbersConfig;
use embers_core::loader::models::LoadRunQuery;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // JSON logs on stderr; stdout carries command output only.
    embers_core::o11y::init_tracing_from_env()?;
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Run(RunArgs::default()));
    let cfg = EmbersConfig::from_env()?;

    match cmd {
        Commands::Run(args) => {
            let stores = Stores::connect(&cfg).await?;
            let pipeline = build_pipeline(&cfg, &stores, args.from_file.as_deref()).await?;
            let run = match pipeline.run(args.trigger()).await {
                Ok(run) => run,
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!("failure looks transient; rerunning is safe");
                    }
                    return Err(e.into());
                }
            };
            println!("{}", serde_json::to_string(&run)?);
        }
        Commands::Migrate => {
            let stores = Stores::connect(&cfg).await?;
            let schema = target_schema(&cfg)?;
            stores.target.ensure_table(&schema).await?;
            tracing::info!(table = %schema.qualified_table(), "migrations applied");
        }
        Commands::Watermark { action } => {
            let state = Stores::state_only(&cfg).await?;
            let key = cfg.loader.watermark_key.as_str();
            match action {
                WatermarkAction::Show => {}
                WatermarkAction::Set { value } => {
                    let previous = state.get_watermark(key).await.ok().flatten();
                    state.put_watermark(key, value).await?;
                    tracing::info!(
                        key,
                        previous = ?previous,
                        watermark = %value,
                        "watermark overridden"
                    );
                }
                WatermarkAction::Clear => {
                    state.delete_watermark(key).await?;
                    tracing::info!(key, "watermark cleared");
                }
            }
            let current = state.get_watermark(key).await?;
            println!(
                "{}",
                serde_json::json!({ "key": key, "watermark": current })
            );
        }
        Commands::Runs {
            limit,
            offset,
            status,
        } => {
            let state = Stores::state_only(&cfg).await?;
            let runs = state
                .list_load_runs(LoadRunQuery {
                    pipeline: Some(cfg.loader.watermark_key.clone()),
                    status,
                    limit,
                    offset,
                })
                .await?;
            for run in runs {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg.redacted())?);
        }
    }
    Ok(())
}
