use salesguard_db::{seed_demo_dataset, SeedResult};

use crate::commands::{open_warehouse, prepare, CommandResult, StepFailure};

pub fn run() -> CommandResult {
    let outcome = prepare().and_then(|(config, runtime)| {
        runtime.block_on(async {
            let pool = open_warehouse(&config).await?;
            let seeded = seed_demo_dataset(&pool)
                .await
                .map_err(|error| StepFailure::new("seed_execution", error.to_string(), 6));
            pool.close().await;
            seeded
        })
    });

    match outcome {
        Ok(seeded) => CommandResult::success("seed", seed_summary(&seeded)),
        Err(failure) => failure.into_result("seed"),
    }
}

fn seed_summary(seeded: &SeedResult) -> String {
    format!(
        "demo warehouse loaded: {} sales conversations, {} sales metrics",
        seeded.conversations, seeded.metrics
    )
}

#[cfg(test)]
mod tests {
    use salesguard_db::SeedResult;

    use super::seed_summary;

    #[test]
    fn summary_counts_both_tables() {
        let seeded = SeedResult { conversations: 3, metrics: 3 };

        assert_eq!(
            seed_summary(&seeded),
            "demo warehouse loaded: 3 sales conversations, 3 sales metrics"
        );
    }
}
