//! One governed conversation turn from the terminal.

use std::sync::Arc;

use salesguard_agent::{
    ConversationOrchestrator, ConversationSession, DisplayItem, HttpAgentDispatcher,
    HttpShieldClient, NoticeLevel, OrchestratorParts, ShieldApplication, TurnReport, TurnStatus,
};
use salesguard_core::config::AppConfig;
use salesguard_core::{ResultSet, TracingAuditSink, UserIdentity};
use salesguard_db::{DbPool, SqlQueryExecutor};

use crate::commands::{open_warehouse, prepare, CommandResult, StepFailure};

const ABORTED_EXIT_CODE: u8 = 7;

#[derive(Clone, Debug)]
pub struct AskArgs {
    pub message: String,
    pub username: String,
    pub role: String,
    pub json: bool,
}

pub fn run(args: AskArgs) -> CommandResult {
    let (config, runtime) = match prepare() {
        Ok(prepared) => prepared,
        Err(failure) => return failure.into_result("ask"),
    };
    init_logging(&config);

    let identity = UserIdentity::new(args.username.trim(), args.role.trim());
    let outcome = runtime.block_on(async {
        let pool = open_warehouse(&config).await?;
        let orchestrator = match build_orchestrator(&config, &pool) {
            Ok(orchestrator) => orchestrator,
            Err(failure) => {
                pool.close().await;
                return Err(failure);
            }
        };

        // One-shot session: history does not outlive the command
        let session = ConversationSession::new();
        let report = orchestrator.run_turn(&session, &identity, &args.message).await;
        pool.close().await;
        report.map_err(|error| StepFailure::new("invalid_input", error.to_string(), 8))
    });

    match outcome {
        Ok(report) => {
            let exit_code = if report.is_completed() { 0 } else { ABORTED_EXIT_CODE };
            let output = if args.json {
                serde_json::to_string_pretty(&report)
                    .unwrap_or_else(|error| format!("failed to serialize turn report: {error}"))
            } else {
                render_report(&report)
            };
            CommandResult::report(exit_code, output)
        }
        Err(failure) => failure.into_result("ask"),
    }
}

fn build_orchestrator(
    config: &AppConfig,
    pool: &DbPool,
) -> Result<ConversationOrchestrator, StepFailure> {
    let shield = HttpShieldClient::new(ShieldApplication::from_config(&config.shield))
        .map_err(|error| StepFailure::new("client_setup", error.to_string(), 6))?;
    let dispatcher = HttpAgentDispatcher::from_config(&config.agent)
        .map_err(|error| StepFailure::new("client_setup", error.to_string(), 6))?;

    Ok(ConversationOrchestrator::new(OrchestratorParts {
        shield: Arc::new(shield),
        dispatcher: Arc::new(dispatcher),
        query: Arc::new(SqlQueryExecutor::new(pool.clone())),
        audit: Arc::new(TracingAuditSink),
        result_limit: config.agent.result_limit,
    }))
}

/// Logs go to stderr so stdout carries only the report.
fn init_logging(config: &AppConfig) {
    use tracing_subscriber::filter::LevelFilter;

    let level = config.logging.level.parse::<LevelFilter>().unwrap_or(LevelFilter::WARN);
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

pub fn render_report(report: &TurnReport) -> String {
    let mut lines = Vec::new();

    for item in &report.items {
        match item {
            DisplayItem::UserMessage { text } => lines.push(format!("you: {text}")),
            DisplayItem::AssistantMessage { text, citations } => {
                lines.push(format!("assistant: {text}"));
                for citation in citations {
                    let excerpt = citation.safeguarded_transcript_text.as_deref().unwrap_or("");
                    lines.push(format!("  {} {}: {excerpt}", citation.label(), citation.doc_id));
                }
            }
            DisplayItem::GeneratedSql { sql } => {
                lines.push("generated sql:".to_string());
                lines.extend(sql.lines().map(|line| format!("  {line}")));
            }
            DisplayItem::ResultTable { result } => lines.extend(render_table(result)),
            DisplayItem::Notice { level, message } => {
                let marker = match level {
                    NoticeLevel::Warning => "warning",
                    NoticeLevel::Error => "error",
                };
                lines.push(format!("{marker}: {message}"));
            }
        }
    }

    if let TurnStatus::Aborted { reason } = &report.status {
        lines.push(format!("turn aborted ({reason}); thread {}", report.thread_id));
    }

    lines.join("\n")
}

fn render_table(result: &ResultSet) -> Vec<String> {
    if result.columns.is_empty() {
        return vec!["(no rows)".to_string()];
    }

    let cells = result
        .rows
        .iter()
        .map(|row| row.iter().map(ToString::to_string).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let mut widths = result.columns.iter().map(|column| column.chars().count()).collect::<Vec<_>>();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let render_row = |fields: &[String]| {
        fields
            .iter()
            .zip(&widths)
            .map(|(field, width)| format!("{field:<width$}", width = *width))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![render_row(result.columns.as_slice())];
    lines.push(widths.iter().map(|width| "-".repeat(*width)).collect::<Vec<_>>().join("-+-"));
    lines.extend(cells.iter().map(|row| render_row(row.as_slice())));
    if cells.is_empty() {
        lines.push("(no rows)".to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use salesguard_agent::{DisplayItem, NoticeLevel, TurnReport, TurnStatus};
    use salesguard_core::{CellValue, Citation, ResultSet, ThreadId};

    use super::render_report;

    fn report(status: TurnStatus, items: Vec<DisplayItem>) -> TurnReport {
        TurnReport { thread_id: ThreadId("thread-1".to_string()), status, items }
    }

    #[test]
    fn completed_report_renders_in_display_order() {
        let mut citation = Citation::new("1", "CONV-001");
        citation.safeguarded_transcript_text = Some("Client wants discount".to_string());
        let rendered = render_report(&report(
            TurnStatus::Completed,
            vec![
                DisplayItem::UserMessage { text: "Which deals slipped?".to_string() },
                DisplayItem::AssistantMessage {
                    text: "TechCorp slipped [1]".to_string(),
                    citations: vec![citation],
                },
                DisplayItem::GeneratedSql { sql: "SELECT deal_id\nFROM sales_metrics".to_string() },
                DisplayItem::ResultTable {
                    result: ResultSet::new(
                        vec!["deal_id".to_string(), "deal_value".to_string()],
                        vec![vec![
                            CellValue::Text("DEAL-001".to_string()),
                            CellValue::Integer(75000),
                        ]],
                    ),
                },
            ],
        ));

        assert_eq!(
            rendered,
            [
                "you: Which deals slipped?",
                "assistant: TechCorp slipped [1]",
                "  [1] CONV-001: Client wants discount",
                "generated sql:",
                "  SELECT deal_id",
                "  FROM sales_metrics",
                "deal_id  | deal_value",
                "---------+-----------",
                "DEAL-001 | 75000",
            ]
            .join("\n")
        );
    }

    #[test]
    fn aborted_report_ends_with_reason() {
        let rendered = render_report(&report(
            TurnStatus::Aborted { reason: "policy_unavailable" },
            vec![DisplayItem::Notice {
                level: NoticeLevel::Error,
                message: "The policy service is unavailable.".to_string(),
            }],
        ));

        assert_eq!(
            rendered,
            "error: The policy service is unavailable.\n\
             turn aborted (policy_unavailable); thread thread-1"
        );
    }

    #[test]
    fn empty_result_table_says_so() {
        let rendered = render_report(&report(
            TurnStatus::Completed,
            vec![DisplayItem::ResultTable {
                result: ResultSet::new(vec!["total".to_string()], Vec::new()),
            }],
        ));

        assert_eq!(rendered, "total\n-----\n(no rows)");
    }
}
