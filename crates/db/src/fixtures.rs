use serde::Serialize;

use crate::DbPool;

struct ConversationSeed {
    conversation_id: &'static str,
    customer_name: &'static str,
    deal_stage: &'static str,
    sales_rep: &'static str,
    conversation_date: &'static str,
    deal_value: f64,
    product_line: &'static str,
    transcript_text: &'static str,
}

struct MetricSeed {
    deal_id: &'static str,
    customer_name: &'static str,
    deal_value: f64,
    close_date: &'static str,
    sales_stage: &'static str,
    win_status: bool,
    sales_rep: &'static str,
    product_line: &'static str,
}

/// Demo sales conversations used by `salesguard seed` and the test suites.
const CONVERSATIONS: &[ConversationSeed] = &[
    ConversationSeed {
        conversation_id: "CONV-001",
        customer_name: "TechCorp Inc",
        deal_stage: "Negotiation",
        sales_rep: "Sarah Johnson",
        conversation_date: "2024-01-15",
        deal_value: 75_000.0,
        product_line: "Enterprise Suite",
        transcript_text: "Client wants discount on the three-year term before signing. \
            Security review is complete and procurement is engaged.",
    },
    ConversationSeed {
        conversation_id: "CONV-002",
        customer_name: "Northwind Retail",
        deal_stage: "Discovery",
        sales_rep: "Mike Chen",
        conversation_date: "2024-02-02",
        deal_value: 32_000.0,
        product_line: "Basic Package",
        transcript_text: "Prospect is evaluating two vendors and asked for references \
            in retail. Budget approval expected next quarter.",
    },
    ConversationSeed {
        conversation_id: "CONV-003",
        customer_name: "Globex Health",
        deal_stage: "Closed Won",
        sales_rep: "Sarah Johnson",
        conversation_date: "2024-03-11",
        deal_value: 120_000.0,
        product_line: "Premium Package",
        transcript_text: "Contract signed after the compliance workshop. Customer \
            requested onboarding to start within two weeks.",
    },
];

const METRICS: &[MetricSeed] = &[
    MetricSeed {
        deal_id: "DEAL-001",
        customer_name: "TechCorp Inc",
        deal_value: 75_000.0,
        close_date: "2024-02-15",
        sales_stage: "Negotiation",
        win_status: false,
        sales_rep: "Sarah Johnson",
        product_line: "Enterprise Suite",
    },
    MetricSeed {
        deal_id: "DEAL-002",
        customer_name: "Northwind Retail",
        deal_value: 32_000.0,
        close_date: "2024-03-30",
        sales_stage: "Discovery",
        win_status: false,
        sales_rep: "Mike Chen",
        product_line: "Basic Package",
    },
    MetricSeed {
        deal_id: "DEAL-003",
        customer_name: "Globex Health",
        deal_value: 120_000.0,
        close_date: "2024-03-11",
        sales_stage: "Closed",
        win_status: true,
        sales_rep: "Sarah Johnson",
        product_line: "Premium Package",
    },
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SeedResult {
    pub conversations: usize,
    pub metrics: usize,
}

/// Loads the demo dataset. Re-running replaces the same rows.
pub async fn seed_demo_dataset(pool: &DbPool) -> Result<SeedResult, sqlx::Error> {
    let mut transaction = pool.begin().await?;

    for seed in CONVERSATIONS {
        sqlx::query(
            "INSERT OR REPLACE INTO sales_conversations \
             (conversation_id, transcript_text, customer_name, deal_stage, sales_rep, \
              conversation_date, deal_value, product_line) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(seed.conversation_id)
        .bind(seed.transcript_text)
        .bind(seed.customer_name)
        .bind(seed.deal_stage)
        .bind(seed.sales_rep)
        .bind(seed.conversation_date)
        .bind(seed.deal_value)
        .bind(seed.product_line)
        .execute(&mut *transaction)
        .await?;
    }

    for seed in METRICS {
        sqlx::query(
            "INSERT OR REPLACE INTO sales_metrics \
             (deal_id, customer_name, deal_value, close_date, sales_stage, win_status, \
              sales_rep, product_line) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(seed.deal_id)
        .bind(seed.customer_name)
        .bind(seed.deal_value)
        .bind(seed.close_date)
        .bind(seed.sales_stage)
        .bind(seed.win_status)
        .bind(seed.sales_rep)
        .bind(seed.product_line)
        .execute(&mut *transaction)
        .await?;
    }

    transaction.commit().await?;
    Ok(SeedResult { conversations: CONVERSATIONS.len(), metrics: METRICS.len() })
}

#[cfg(test)]
mod tests {
    use super::seed_demo_dataset;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn seeding_is_repeatable() {
        let pool =
            connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations should apply");

        let first = seed_demo_dataset(&pool).await.expect("first seed");
        let second = seed_demo_dataset(&pool).await.expect("second seed");
        assert_eq!(first, second);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sales_conversations")
            .fetch_one(&pool)
            .await
            .expect("count conversations");
        assert_eq!(count as usize, first.conversations);

        pool.close().await;
    }
}
