use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use propline_cli::commands::{doctor, migrate, reindex, simulate};
use serde_json::Value;

const SENDER: &str = "whatsapp:+2348012345678";

#[test]
fn migrate_returns_success_with_valid_env() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&store_env(dir.path()), || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_unknown_provider() {
    with_env(&[("PROPLINE_LLM_PROVIDER", "carrier-pigeon")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn simulate_walks_a_sender_through_the_first_steps() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&store_env(dir.path()), || {
        let greeted = parse_payload(&simulate::run(SENDER, Some("SIM-1"), "hi").output);
        assert_eq!(greeted["status"], "ok");
        assert_eq!(greeted["details"]["step"], "name");

        let named = parse_payload(&simulate::run(SENDER, Some("SIM-2"), "Ada Obi").output);
        assert_eq!(named["details"]["outcome"], "advanced");
        assert_eq!(named["details"]["step"], "identity");

        let replayed = parse_payload(&simulate::run(SENDER, Some("SIM-2"), "Ada Obi").output);
        assert_eq!(replayed["details"]["outcome"], "replayed");
        assert_eq!(replayed["details"]["reply"], named["details"]["reply"]);
    });
}

#[test]
fn reindex_rebuilds_graph_for_known_principal() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&store_env(dir.path()), || {
        let turns = ["hi", "Ada Obi", "12345678901", "14 Marina Rd, Lagos", "No pets"];
        for (index, text) in turns.iter().enumerate() {
            let result = simulate::run(SENDER, Some(&format!("SIM-R{index}")), text);
            assert_eq!(result.exit_code, 0);
        }

        let first = reindex::run("+2348012345678");
        assert_eq!(first.exit_code, 0, "unexpected output {}", first.output);
        let payload = parse_payload(&first.output);
        assert_eq!(payload["details"]["principal"], "+2348012345678");
        assert_eq!(payload["details"]["listings_created"], 0, "intake already indexed the listing");

        let again = reindex::run("+2348012345678");
        assert_eq!(again.exit_code, 0);
    });
}

#[test]
fn reindex_reports_unknown_principal() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&store_env(dir.path()), || {
        let result = reindex::run("+2349099999999");
        assert_eq!(result.exit_code, 6);
        assert_eq!(parse_payload(&result.output)["error_class"], "not_found");

        let invalid = reindex::run("not-a-phone");
        assert_eq!(invalid.exit_code, 2);
    });
}

#[test]
fn doctor_json_reports_every_check() {
    let dir = tempfile::tempdir().expect("tempdir");
    with_env(&store_env(dir.path()), || {
        let report = parse_payload(&doctor::run(true));
        assert_eq!(report["overall_status"], "pass");

        let names: Vec<&str> = report["checks"]
            .as_array()
            .expect("checks")
            .iter()
            .filter_map(|check| check["name"].as_str())
            .collect();
        assert_eq!(
            names,
            vec!["config_validation", "extraction_client", "database_connectivity", "graph_connectivity"]
        );
    });
}

#[test]
fn doctor_skips_store_checks_when_config_is_invalid() {
    with_env(&[("PROPLINE_GRAPH_MAX_RETRIES", "not-a-number")], || {
        let human = doctor::run(false);
        assert!(human.starts_with("doctor: one or more readiness checks failed"));
        assert!(human.contains("- [skip] graph_connectivity"));
    });
}

fn store_env(dir: &Path) -> Vec<(&'static str, String)> {
    vec![
        ("PROPLINE_DATABASE_URL", format!("sqlite://{}", dir.join("propline.db").display())),
        ("PROPLINE_GRAPH_URL", format!("sqlite://{}", dir.join("graph.db").display())),
        ("PROPLINE_LLM_PROVIDER", "rules".to_string()),
    ]
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env<K: AsRef<str>, V: AsRef<str>>(vars: &[(K, V)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let keys = [
        "PROPLINE_DATABASE_URL",
        "PROPLINE_DATABASE_MAX_CONNECTIONS",
        "PROPLINE_DATABASE_TIMEOUT_SECS",
        "PROPLINE_GRAPH_URL",
        "PROPLINE_GRAPH_MAX_CONNECTIONS",
        "PROPLINE_GRAPH_MAX_RETRIES",
        "PROPLINE_LLM_PROVIDER",
        "PROPLINE_LLM_API_KEY",
        "PROPLINE_LLM_BASE_URL",
        "PROPLINE_LLM_MODEL",
        "PROPLINE_LLM_TIMEOUT_SECS",
        "PROPLINE_LLM_MAX_RETRIES",
        "PROPLINE_INTAKE_RESET_KEYWORD",
        "PROPLINE_LOGGING_LEVEL",
        "PROPLINE_LOGGING_FORMAT",
        "PROPLINE_LOG_LEVEL",
        "PROPLINE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key.as_ref(), value.as_ref());
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
