use propline_agent::build_client;
use propline_core::config::{AppConfig, LoadOptions};
use propline_db::{connect_with_settings, ping};
use serde::Serialize;

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
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_extraction_client(&config));
            checks.extend(check_store_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["extraction_client", "database_connectivity", "graph_connectivity"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_extraction_client(config: &AppConfig) -> DoctorCheck {
    let provider = config.llm.provider.as_str();
    match build_client(&config.llm) {
        Ok(_) => DoctorCheck {
            name: "extraction_client",
            status: CheckStatus::Pass,
            details: format!("provider `{provider}` with model `{}`", config.llm.model),
        },
        Err(error) => DoctorCheck {
            name: "extraction_client",
            status: CheckStatus::Fail,
            details: format!("provider `{provider}` is not usable: {error}"),
        },
    }
}

fn check_store_connectivity(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    let stores = [
        ("database_connectivity", config.database.url.as_str(), config.database.max_connections),
        ("graph_connectivity", config.graph.url.as_str(), config.graph.max_connections),
    ];
    stores
        .into_iter()
        .map(|(name, url, max_connections)| {
            let result = runtime.block_on(async {
                let pool = connect_with_settings(url, max_connections, config.database.timeout_secs)
                    .await
                    .map_err(|error| format!("failed to connect: {error}"))?;
                let checked = ping(&pool).await.map_err(|error| format!("ping failed: {error}"));
                pool.close().await;
                checked
            });

            match result {
                Ok(()) => DoctorCheck {
                    name,
                    status: CheckStatus::Pass,
                    details: format!("connected using `{url}`"),
                },
                Err(error) => DoctorCheck { name, status: CheckStatus::Fail, details: error },
            }
        })
        .collect()
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
