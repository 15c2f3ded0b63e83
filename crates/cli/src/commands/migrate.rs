use salesguard_db::migrations::MIGRATOR;

use crate::commands::{open_warehouse, prepare, CommandResult, StepFailure};

pub fn run() -> CommandResult {
    let outcome = prepare().and_then(|(config, runtime)| {
        runtime.block_on(async {
            let pool = open_warehouse(&config).await?;
            pool.close().await;
            Ok::<usize, StepFailure>(MIGRATOR.iter().count())
        })
    });

    match outcome {
        Ok(known) => CommandResult::success(
            "migrate",
            format!("applied pending migrations ({known} known to this build)"),
        ),
        Err(failure) => failure.into_result("migrate"),
    }
}
