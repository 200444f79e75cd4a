use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const INGEST_DOC: &str = r#"### 1. **Rule Name:** Age Eligibility

**Rule Purpose:**
Only adults may hold a policy.

**Code Block:** `code/eligibility.js`
```javascript
if (applicant.age < 18) reject();
```

### **Rule Name:** Claim Deductible Check

**Rule Purpose:**
The deductible must be met before payout.
"#;

/// A fresh model home, nested one level down so that log discovery rooted
/// at the input document's parent directory stays inside the sandbox.
fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}")).join("home");
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .unwrap_or_else(|err| panic!("failed to create {}: {err}", parent.display()));
    }
    fs::write(path, content)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn run_rl_env<I, S>(home: &Path, envs: &[(&str, &str)], args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(env!("CARGO_BIN_EXE_rl"));
    command
        .current_dir(home)
        .env_remove("RULELOG_DIR")
        .env_remove("RULELOG_BACKEND")
        .arg("--model-home")
        .arg(home)
        .arg("--log-dir")
        .arg(home.join("logs"));
    for (key, value) in envs {
        command.env(key, value);
    }
    command
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute rl binary: {err}"))
}

fn run_json<I, S>(home: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_json_env(home, &[], args)
}

fn run_json_env<I, S>(home: &Path, envs: &[(&str, &str)], args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_rl_env(home, envs, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "rl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

#[test]
fn ingest_merges_and_reruns_are_idempotent() {
    let home = unique_temp_dir("rl-ingest");
    let doc = home.join("rules.md");
    write_file(&doc, INGEST_DOC);

    let first = run_json(
        &home,
        ["ingest", "--input", path_str(&doc), "--owner", "Claims Team", "--component", "billing"],
    );
    assert_eq!(as_str(&first, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&first, "new"), 2);
    assert_eq!(as_i64(&first, "updated"), 0);
    assert_eq!(as_i64(&first, "registry_count"), 2);

    // Unchanged document, unchanged mtime: nothing new.
    let second = run_json(&home, ["ingest", "--input", path_str(&doc)]);
    assert_eq!(as_i64(&second, "new"), 0);
    assert_eq!(as_i64(&second, "skipped"), 2);

    let listing = run_json(&home, ["registry", "list"]);
    assert_eq!(as_i64(&listing, "count"), 2);
    let records = listing
        .get("records")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing records array: {listing}"));
    assert_eq!(as_str(&records[0], "rule_name"), "Age Eligibility");
    assert_eq!(as_str(&records[0], "owner"), "Claims Team");
    assert_eq!(as_str(&records[0], "component"), "billing");

    let teams = read_json_file(&home.join(".model/teams.json"));
    assert_eq!(teams, serde_json::json!(["Claims Team"]));
}

#[test]
fn extract_doc_then_correlate_overlays_metadata() {
    let home = unique_temp_dir("rl-correlate");

    // Bare headings keep the composite text equal to the rule name, which
    // the documented side also matches exactly.
    let code_doc = home.join("code_rules.md");
    write_file(&code_doc, "## Claim Deductible Check\n\n## Provider Network Validation\n");
    run_json(&home, ["ingest", "--input", path_str(&code_doc)]);

    let documented = home.join("documented.md");
    write_file(
        &documented,
        "### Rule ID: BR-001 - Claim Deductible Check\n\
         - **Category**: Financial\n\
         - **Business Area**: Claims\n\
         - **Owner**: Claims Team\n\
         ### Rule ID: BR-002 - Provider Network Validation\n\
         - **Category**: Network\n",
    );
    let extracted = run_json(&home, ["extract-doc", "--input", path_str(&documented)]);
    assert_eq!(as_i64(&extracted, "documented_rules"), 2);

    let correlated = run_json(&home, ["correlate"]);
    assert_eq!(as_i64(&correlated, "code_rules"), 2);
    assert_eq!(as_i64(&correlated, "matched"), 2);

    let merged = read_json_file(&home.join(".model/correlated_business_rules.json"));
    let records = merged.as_array().unwrap_or_else(|| panic!("expected array: {merged}"));
    let deductible = records
        .iter()
        .find(|record| record.get("rule_name").and_then(Value::as_str) == Some("Claim Deductible Check"))
        .unwrap_or_else(|| panic!("missing correlated record: {merged}"));
    assert_eq!(as_str(deductible, "rule_category"), "Financial");
    assert_eq!(as_str(deductible, "doc_rule_id"), "BR-001");
    let score = deductible
        .get("match_score")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing match_score: {deductible}"));
    assert!((score - 1.0).abs() < 1e-6, "unexpected score {score}");
}

#[test]
fn ingest_attaches_rule_ids_to_producing_run() {
    let home = unique_temp_dir("rl-runs");
    let doc = home.join("rules.md");
    write_file(&doc, INGEST_DOC);

    write_file(
        &home.join("logs/run.log"),
        &format!(
            "<<<<< HEADER BEGIN >>>>>\n\
             [RULELOG:] timestamp=2025-03-01T10:00:00Z\n\
             [RULELOG:] build=2510020940\n\
             [RULELOG:] root_dir=/work/project\n\
             [RULELOG:] source_path=src/claims.js\n\
             [RULELOG:] output_file=rules.md\n\
             <<<<< HEADER END >>>>>\n\
             ===== RESPONSE BEGIN =====\n{INGEST_DOC}\n===== RESPONSE END =====\n"
        ),
    );

    let result = run_json(&home, ["ingest", "--input", path_str(&doc)]);
    assert_eq!(result.get("run_attached"), Some(&Value::Bool(true)));

    let runs = read_json_file(&home.join(".model/runs.json"));
    let runs = runs.as_array().unwrap_or_else(|| panic!("expected array: {runs}"));
    assert_eq!(runs.len(), 1);
    let rule_ids = runs[0]
        .get("rule_ids")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing rule_ids: {}", runs[0]));
    assert_eq!(rule_ids.len(), 2);

    let sources = read_json_file(&home.join(".model/sources.json"));
    assert_eq!(as_str(&sources[0], "root_dir"), "/work/project");

    // A re-ingest of the unchanged document merges nothing, so no ids are
    // attached on the second pass; the first attachment carries forward.
    let rerun = run_json(&home, ["ingest", "--input", path_str(&doc)]);
    assert_eq!(as_i64(&rerun, "skipped"), 2);
    assert_eq!(rerun.get("run_attached"), Some(&Value::Bool(false)));

    let runs = read_json_file(&home.join(".model/runs.json"));
    let runs = runs.as_array().unwrap_or_else(|| panic!("expected array: {runs}"));
    let rule_ids = runs[0]
        .get("rule_ids")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing rule_ids: {}", runs[0]));
    assert_eq!(rule_ids.len(), 2);
}

#[test]
fn link_twice_creates_one_execution() {
    let home = unique_temp_dir("rl-link");
    let doc = home.join("rules.md");
    write_file(&doc, INGEST_DOC);
    run_json(&home, ["ingest", "--input", path_str(&doc)]);

    let artifact = home.join("report.md");
    write_file(&artifact, "# Generated report\n");
    write_file(
        &home.join("logs/extract.log"),
        &format!(
            "Output report: {}\nFile: code/eligibility.js\n```\nif (applicant.age < 18) reject();\n```\n",
            artifact.display()
        ),
    );

    let first = run_json(&home, ["link", "--artifact", path_str(&artifact)]);
    assert_eq!(first.get("matched"), Some(&Value::Bool(true)));
    assert_eq!(as_i64(&first, "rules_annotated"), 1);
    let execution_id = as_str(&first, "execution_id").to_string();

    let second = run_json(&home, ["link", "--artifact", path_str(&artifact)]);
    assert_eq!(as_str(&second, "execution_id"), execution_id);

    let executions = read_json_file(&home.join(".model/executions.json"));
    let executions =
        executions.as_array().unwrap_or_else(|| panic!("expected array: {executions}"));
    assert_eq!(executions.len(), 1);

    let listing = run_json(&home, ["registry", "list"]);
    let records = listing
        .get("records")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing records array: {listing}"));
    let eligibility = records
        .iter()
        .find(|record| record.get("rule_name").and_then(Value::as_str) == Some("Age Eligibility"))
        .unwrap_or_else(|| panic!("missing rule: {listing}"));
    assert_eq!(as_str(eligibility, "execution_id"), execution_id);
    assert_eq!(as_str(eligibility, "artifact_path"), "code/eligibility.js");
}

#[test]
fn categorise_fails_without_categories_file() {
    let home = unique_temp_dir("rl-categorise-missing");
    let doc = home.join("rules.md");
    write_file(&doc, INGEST_DOC);
    run_json(&home, ["ingest", "--input", path_str(&doc)]);

    let output = run_rl_env(&home, &[], ["categorise"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("required input"), "unexpected stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn categorise_updates_rules_via_stub_backend() {
    use std::os::unix::fs::PermissionsExt;

    let home = unique_temp_dir("rl-categorise");
    let doc = home.join("rules.md");
    write_file(&doc, INGEST_DOC);
    run_json(&home, ["ingest", "--input", path_str(&doc)]);

    write_file(
        &home.join(".model/rule_categories.json"),
        r#"{"ruleCategories": [{"name": "Financial", "team": ""}]}"#,
    );

    let stub = home.join("stub-backend.sh");
    write_file(
        &stub,
        "#!/bin/sh\n\
         out=\"\"\n\
         idx=\"\"\n\
         tot=\"\"\n\
         while [ \"$#\" -gt 0 ]; do\n\
           case \"$1\" in\n\
             --output) out=\"$2\"; shift 2 ;;\n\
             --index) idx=\"$2\"; shift 2 ;;\n\
             --total) tot=\"$2\"; shift 2 ;;\n\
             *) shift ;;\n\
           esac\n\
         done\n\
         mkdir -p \"$out/categorise-rule\"\n\
         if [ -n \"$idx\" ]; then\n\
           name=\"categorise-rule-${idx}of${tot}-.md\"\n\
         else\n\
           name=\"categorise-rule.md\"\n\
         fi\n\
         printf '%s' '{\"selectedCategory\":{\"name\":\"Financial\",\"explanation\":\"stub\"}}' \\\n\
           > \"$out/categorise-rule/$name\"\n",
    );
    let mut permissions = fs::metadata(&stub)
        .unwrap_or_else(|err| panic!("failed to stat stub: {err}"))
        .permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&stub, permissions)
        .unwrap_or_else(|err| panic!("failed to chmod stub: {err}"));

    let result =
        run_json_env(&home, &[("RULELOG_BACKEND", path_str(&stub))], ["categorise"]);
    assert_eq!(as_i64(&result, "considered"), 2);
    assert_eq!(as_i64(&result, "categorised"), 2);
    assert_eq!(as_i64(&result, "skipped"), 0);

    let listing = run_json(&home, ["registry", "list"]);
    let records = listing
        .get("records")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing records array: {listing}"));
    for record in records {
        assert_eq!(as_str(record, "rule_category"), "Financial");
    }
}
