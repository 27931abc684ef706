//! Integration tests for the caliber CLI
//!
//! These tests exercise the CLI commands end-to-end using assert_cmd.
//! Every test works on its own database inside a temp directory.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// A scratch laboratory: database, tables and payloads in one temp dir
struct Lab {
    tmp: TempDir,
}

impl Lab {
    fn new() -> Self {
        let lab = Self {
            tmp: TempDir::new().unwrap(),
        };
        lab.write_tables();
        lab
    }

    fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    /// Helper to get a caliber command bound to this lab's database
    fn caliber(&self) -> Command {
        let mut cmd = Command::cargo_bin("caliber").unwrap();
        cmd.current_dir(self.tmp.path())
            .env("HOME", self.tmp.path())
            .env("XDG_CONFIG_HOME", self.path("config"))
            .env("XDG_DATA_HOME", self.path("data"))
            .env_remove("CALIBER_DB")
            .env_remove("CALIBER_CONFIG_NAME")
            .env_remove("CALIBER_ACTOR")
            .env_remove("CALIBER_LOG")
            .arg("--db")
            .arg(self.path("caliber.db"));
        cmd
    }

    /// Zero torque correction and a flat CMC band
    fn write_tables(&self) {
        let dir = self.path("tables");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("torque_error.csv"), "x,y\n0,0\n10000,0\n").unwrap();
        fs::write(dir.join("cmc_band.csv"), "lower,upper,value\n0,10000,0.5\n").unwrap();
    }

    fn write_payload(&self, name: &str, payload: &serde_json::Value) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, serde_json::to_string_pretty(payload).unwrap()).unwrap();
        path
    }

    fn new_job(&self, id: &str, temp_before: &str) {
        self.caliber()
            .args(["job", "new", id, "--customer", "Acme Tools", "--work-id", "WO-7781"])
            .args(["--temp-before", temp_before, "--temp-after", "22.5"])
            .args(["--humidity-before", "50", "--humidity-after", "0.52"])
            .assert()
            .success();
    }

    fn run_job(&self, id: &str) -> assert_cmd::assert::Assert {
        let input = self.write_payload("clean.json", &clean_payload());
        self.caliber()
            .args(["run", id, "--input"])
            .arg(&input)
            .arg("--tables")
            .arg(self.path("tables"))
            .assert()
    }
}

fn clean_payload() -> serde_json::Value {
    let five = vec![1349.0; 5];
    let ten = vec![1349.0; 10];
    serde_json::json!({
        "repeatability_points": [
            {"set_torque": 1349.0, "readings": [1349.0, 1350.0, 1348.0, 1349.0, 1349.0]},
            {"set_torque": 4269.0, "readings": [4269.0, 4270.0, 4268.0, 4269.0, 4269.0]}
        ],
        "reproducibility": {"sequences": {"I": five, "II": five, "III": five, "IV": five}},
        "output_drive": {"positions": {"0°": ten, "90°": ten, "180°": ten, "270°": ten}},
        "interface": {"positions": {"0°": ten, "90°": ten, "180°": ten, "270°": ten}},
        "loading_point": {"-10mm": five, "+10mm": vec![1349.5; 5]}
    })
}

// ============================================================================
// CLI Basic Tests
// ============================================================================

#[test]
fn test_help_displays() {
    Command::cargo_bin("caliber")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Torque calibration metrology engine"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("dev"));
}

#[test]
fn test_version_displays() {
    Command::cargo_bin("caliber")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("caliber"));
}

#[test]
fn test_unknown_command_fails() {
    Command::cargo_bin("caliber")
        .unwrap()
        .arg("certify")
        .assert()
        .failure();
}

#[test]
fn test_completions_bash() {
    Command::cargo_bin("caliber")
        .unwrap()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("caliber"));
}

// ============================================================================
// Job and Standard Tests
// ============================================================================

#[test]
fn test_job_new_list_show() {
    let lab = Lab::new();
    lab.caliber()
        .args(["job", "new", "25060-13", "--customer", "Acme Tools"])
        .args(["--temp-before", "22", "--humidity-before", "48"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered job 25060-13"));

    lab.caliber()
        .args(["job", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("25060-13"))
        .stdout(predicate::str::contains("pending"))
        .stdout(predicate::str::contains("1 job(s) found."));

    lab.caliber()
        .args(["job", "list", "--count"])
        .assert()
        .success()
        .stdout("1\n");

    lab.caliber()
        .args(["job", "show", "25060-13"])
        .assert()
        .success()
        .stdout(predicate::str::contains("customer: Acme Tools"))
        .stdout(predicate::str::contains("temp_before: 22"));

    lab.caliber()
        .args(["job", "show", "25060-13", "-f", "table"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Acme Tools"))
        .stdout(predicate::str::contains("blocked"));
}

#[test]
fn test_job_new_refuses_duplicate_without_force() {
    let lab = Lab::new();
    lab.new_job("25060-21", "22");

    lab.caliber()
        .args(["job", "new", "25060-21"])
        .assert()
        .failure();

    lab.caliber()
        .args(["job", "new", "25060-21", "--force", "--customer", "Other"])
        .assert()
        .success();
}

#[test]
fn test_job_new_requires_known_standards() {
    let lab = Lab::new();
    lab.caliber()
        .args(["job", "new", "25060-22", "-s", "STD-404"])
        .assert()
        .failure();
}

#[test]
fn test_job_show_missing_fails() {
    let lab = Lab::new();
    lab.caliber()
        .args(["job", "show", "NOPE-1"])
        .assert()
        .failure();
}

#[test]
fn test_standard_add_and_list() {
    let lab = Lab::new();
    lab.caliber()
        .args(["standard", "add", "STD-01", "-n", "Master transducer 10 kNm"])
        .args(["--valid-until", "2099-12-31", "--serial", "MT-4417"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered standard STD-01"));
    lab.caliber()
        .args(["standard", "add", "STD-02", "-n", "Old transducer"])
        .args(["--valid-until", "2001-01-31"])
        .assert()
        .success();

    lab.caliber()
        .args(["standard", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("STD-01"))
        .stdout(predicate::str::contains("valid"))
        .stdout(predicate::str::contains("expired"));
}

#[test]
fn test_standard_add_rejects_bad_date() {
    let lab = Lab::new();
    lab.caliber()
        .args(["standard", "add", "STD-01", "-n", "Master"])
        .args(["--valid-until", "31/12/2099"])
        .assert()
        .failure();
}

// ============================================================================
// Run and Check Tests
// ============================================================================

#[test]
fn test_run_clean_job_passes() {
    let lab = Lab::new();
    lab.new_job("25060-30", "22");

    lab.run_job("25060-30")
        .success()
        .stdout(predicate::str::contains("repeatability"))
        .stdout(predicate::str::contains("uncertainty_budget"))
        .stdout(predicate::str::contains("passed 3/3 stages, 0 deviation(s), certificate ready"));

    lab.caliber()
        .args(["job", "list", "--status", "completed", "-f", "id"])
        .assert()
        .success()
        .stdout("25060-30\n");
}

#[test]
fn test_run_json_output() {
    let lab = Lab::new();
    lab.new_job("25060-31", "22");
    let input = lab.write_payload("clean.json", &clean_payload());

    let output = lab
        .caliber()
        .args(["run", "25060-31", "-f", "json", "--input"])
        .arg(&input)
        .arg("--tables")
        .arg(lab.path("tables"))
        .output()
        .unwrap();
    assert!(output.status.success());

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["job_id"], "25060-31");
    assert_eq!(result["summary"]["overall_status"], "passed");
    assert_eq!(result["deviation_reports"].as_array().unwrap().len(), 0);
}

#[test]
fn test_rerun_requires_recalculate() {
    let lab = Lab::new();
    lab.new_job("25060-32", "22");
    lab.run_job("25060-32").success();

    lab.run_job("25060-32")
        .failure()
        .stderr(predicate::str::contains("already has calculation results"));

    let input = lab.path("clean.json");
    lab.caliber()
        .args(["run", "25060-32", "--recalculate", "-f", "id", "--input"])
        .arg(&input)
        .arg("--tables")
        .arg(lab.path("tables"))
        .assert()
        .success();
}

#[test]
fn test_run_with_wrong_reading_count_fails() {
    let lab = Lab::new();
    lab.new_job("25060-33", "22");

    let mut payload = clean_payload();
    payload["repeatability_points"][0]["readings"] = serde_json::json!([1349.0, 1350.0, 1348.0]);
    let input = lab.write_payload("short.json", &payload);

    lab.caliber()
        .args(["run", "25060-33", "--input"])
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Calculation failed"));

    lab.caliber()
        .args(["job", "list", "--status", "failed", "-f", "id"])
        .assert()
        .success()
        .stdout("25060-33\n");
}

#[test]
fn test_run_missing_input_file_fails() {
    let lab = Lab::new();
    lab.new_job("25060-34", "22");
    lab.caliber()
        .args(["run", "25060-34", "--input", "missing.json"])
        .assert()
        .failure();
}

#[test]
fn test_check_reports_stored_results() {
    let lab = Lab::new();
    lab.new_job("25060-35", "22");

    lab.caliber()
        .args(["check", "25060-35"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no stored calculation results"));

    lab.run_job("25060-35").success();
    lab.caliber()
        .args(["check", "25060-35", "--strict"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Environmental Conditions"))
        .stdout(predicate::str::contains("PASS"));
}

// ============================================================================
// Deviation Workflow Tests
// ============================================================================

#[test]
fn test_hot_lab_deviation_rejected_by_customer() {
    let lab = Lab::new();
    lab.new_job("25060-40", "32");

    lab.run_job("25060-40")
        .success()
        .stdout(predicate::str::contains("DEV-25060-40-001"))
        .stdout(predicate::str::contains("passed_with_deviations"))
        .stdout(predicate::str::contains("certificate blocked"));

    lab.caliber()
        .args(["check", "25060-40", "--strict"])
        .assert()
        .failure();

    lab.caliber()
        .args(["dev", "list", "25060-40"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DEV-25060-40-001"))
        .stdout(predicate::str::contains("environmental"))
        .stdout(predicate::str::contains("Certificate blocked"));

    // Decisions are only accepted once the customer was notified
    lab.caliber()
        .args(["dev", "decide", "DEV-25060-40-001", "reject"])
        .assert()
        .failure();

    lab.caliber()
        .args(["dev", "review", "DEV-25060-40-001", "--actor", "qa"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is now IN_REVIEW"));
    lab.caliber()
        .args(["dev", "notify", "DEV-25060-40-001", "--actor", "qa", "-m", "Emailed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is now CUSTOMER_NOTIFIED"));
    lab.caliber()
        .args(["dev", "decide", "DEV-25060-40-001", "reject", "--actor", "customer"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is now CUSTOMER_REJECTED"))
        .stdout(predicate::str::contains("rejected by customer: DEV-25060-40-001"));

    lab.caliber()
        .args(["job", "list", "--status", "rejected", "-f", "id"])
        .assert()
        .success()
        .stdout("25060-40\n");

    lab.caliber()
        .args(["dev", "show", "DEV-25060-40-001", "-f", "yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("customer_response"))
        .stdout(predicate::str::contains("decided_by: customer"));
}

#[test]
fn test_conditional_acceptance_releases_certificate() {
    let lab = Lab::new();
    lab.new_job("25060-41", "31");
    lab.run_job("25060-41").success();

    let number = "DEV-25060-41-001";
    lab.caliber().args(["dev", "review", number]).assert().success();
    lab.caliber().args(["dev", "notify", number]).assert().success();

    lab.caliber()
        .args(["dev", "decide", number, "conditional"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("requires the customer's conditions"));

    lab.caliber()
        .args(["dev", "decide", number, "conditional"])
        .args(["--conditions", "Valid between 20 and 30 °C only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Certificate can be generated"))
        .stdout(predicate::str::contains("condition: Valid between 20 and 30 °C only"));

    lab.caliber()
        .args(["dev", "resolve", number, "-a", "Air conditioning repaired"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is now RESOLVED"));
    lab.caliber()
        .args(["dev", "close", number])
        .assert()
        .success()
        .stdout(predicate::str::contains("is now CLOSED"));

    lab.caliber()
        .args(["job", "list", "--status", "approved", "-f", "id"])
        .assert()
        .success()
        .stdout("25060-41\n");
}

#[test]
fn test_dev_invalid_transition_fails() {
    let lab = Lab::new();
    lab.new_job("25060-42", "35");
    lab.run_job("25060-42").success();

    lab.caliber()
        .args(["dev", "close", "DEV-25060-42-001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid status transition"));
}

#[test]
fn test_dev_show_unknown_number_fails() {
    let lab = Lab::new();
    lab.caliber()
        .args(["dev", "show", "DEV-25060-99-001"])
        .assert()
        .failure();
}

// ============================================================================
// Lookup and Config Tests
// ============================================================================

#[test]
fn test_lookup_eval_builtin_table() {
    let lab = Lab::new();
    lab.caliber()
        .args(["lookup", "eval", "torque_error", "3602.8"])
        .assert()
        .success()
        .stdout("0.3992\n");

    lab.caliber()
        .args(["lookup", "eval", "cmc", "1000", "-f", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"value\": 0.58"))
        .stdout(predicate::str::contains("\"confidence\": \"table\""));
}

#[test]
fn test_lookup_eval_csv_directory() {
    let lab = Lab::new();
    lab.caliber()
        .args(["lookup", "eval", "torque_error", "1225", "--tables"])
        .arg(lab.path("tables"))
        .assert()
        .success()
        .stdout("0\n");
}

#[test]
fn test_lookup_import_overrides_builtin() {
    let lab = Lab::new();
    lab.caliber()
        .args(["lookup", "import"])
        .arg(lab.path("tables"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported cmc_band"))
        .stdout(predicate::str::contains("Imported torque_error"));

    lab.caliber()
        .args(["lookup", "eval", "cmc_band", "1000"])
        .assert()
        .success()
        .stdout("0.5\n");

    lab.caliber()
        .args(["lookup", "show", "device_error_band"])
        .assert()
        .success()
        .stdout(predicate::str::contains("35000"));
}

#[test]
fn test_lookup_import_empty_directory_fails() {
    let lab = Lab::new();
    fs::create_dir_all(lab.path("empty")).unwrap();
    lab.caliber()
        .args(["lookup", "import"])
        .arg(lab.path("empty"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("No lookup tables found"));
}

#[test]
fn test_config_show_and_engine() {
    let lab = Lab::new();
    lab.caliber()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config_name"));

    lab.caliber()
        .args(["config", "engine"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_deviation_percent: 4"));
}

#[test]
fn test_config_path_shows_database() {
    let lab = Lab::new();
    lab.caliber()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("caliber.db"));
}
