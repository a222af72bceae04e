use std::fs;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;

use runbox::config::CliArgs;
use runbox::{Scheduler, Submission};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;
    let stdin = cli
        .stdin_path
        .as_ref()
        .map(fs::read_to_string)
        .transpose()
        .context("Failed to read stdin file")?;

    let scheduler = Scheduler::start(&config)?;

    // ======= PREPARATION END, EXECUTION START =======

    let mut pending = JoinSet::new();
    for (idx, path) in cli.sources.iter().enumerate() {
        let id = idx as u64 + 1;
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read source {}", path.display()))?;

        let mut submission = Submission::new(id, source, &cli.language);
        if let Some(input) = &stdin {
            submission = submission.with_stdin(input.clone());
        }

        match scheduler.submit(submission) {
            Ok(handle) => {
                log::info!("Submission {id} ({}) accepted", path.display());
                pending.spawn(handle.wait());
            }
            Err(e) => log::error!("Submission {id} ({}) rejected: {e}", path.display()),
        }
    }

    // ===== EXECUTION END, WAITING FOR RESULTS ======

    let collect = async {
        while let Some(res) = pending.join_next().await {
            match res {
                Ok(Ok(result)) => match serde_json::to_string_pretty(&result) {
                    Ok(json) => println!("{json}"),
                    Err(e) => log::error!("Failed to serialize result: {e}"),
                },
                Ok(Err(e)) => log::error!("Submission abandoned: {e}"),
                Err(e) => log::error!("Result task failed: {e:?}"),
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        _ = collect => {}
    }

    scheduler.shutdown().await;
    Ok(())
}
