use salesguard_agent::{HttpAgentDispatcher, HttpShieldClient, ShieldApplication};
use salesguard_core::config::AppConfig;
use salesguard_core::QueryExecutor;
use salesguard_db::SqlQueryExecutor;
use serde::Serialize;
use tokio::runtime::Runtime;

use crate::commands::{open_warehouse, prepare};

const DEPENDENT_CHECKS: [&str; 3] = ["agent_client", "shield_client", "warehouse_database"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn from_result(name: &'static str, result: Result<String, String>) -> Self {
        match result {
            Ok(details) => Self { name, status: CheckStatus::Pass, details },
            Err(details) => Self { name, status: CheckStatus::Fail, details },
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            serde_json::json!({
                "overall_status": "fail",
                "summary": "doctor serialization failed",
                "error": error.to_string(),
            })
            .to_string()
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let checks = match prepare() {
        Ok((config, runtime)) => vec![
            DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            },
            DoctorCheck::from_result("agent_client", check_agent_client(&config)),
            DoctorCheck::from_result("shield_client", check_shield_client(&config)),
            DoctorCheck::from_result("warehouse_database", check_warehouse(&config, &runtime)),
        ],
        Err(failure) => {
            let mut checks = vec![DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: failure.message,
            }];
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
            checks
        }
    };

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let (overall_status, summary) = if all_pass {
        (CheckStatus::Pass, "doctor: all readiness checks passed")
    } else {
        (CheckStatus::Fail, "doctor: one or more readiness checks failed")
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

fn check_agent_client(config: &AppConfig) -> Result<String, String> {
    let dispatcher =
        HttpAgentDispatcher::from_config(&config.agent).map_err(|error| error.to_string())?;
    Ok(format!("agent endpoint `{}` with model `{}`", dispatcher.endpoint(), config.agent.model))
}

fn check_shield_client(config: &AppConfig) -> Result<String, String> {
    HttpShieldClient::new(ShieldApplication::from_config(&config.shield))
        .map_err(|error| error.to_string())?;
    Ok(format!(
        "shield endpoint `{}` with {}ms timeout",
        config.shield.endpoint, config.shield.timeout_ms
    ))
}

/// Connects, migrates and runs a trivial query against the warehouse.
fn check_warehouse(config: &AppConfig, runtime: &Runtime) -> Result<String, String> {
    runtime.block_on(async {
        let pool = open_warehouse(config).await.map_err(|failure| failure.message)?;
        let outcome = SqlQueryExecutor::new(pool.clone()).execute("SELECT 1").await;
        pool.close().await;

        outcome
            .map(|_| format!("connected using `{}`", config.database.url))
            .map_err(|error| format!("database check failed: {error}"))
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    lines.extend(report.checks.iter().map(|check| {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        format!("- [{marker}] {}: {}", check.name, check.details)
    }));

    lines.join("\n")
}
