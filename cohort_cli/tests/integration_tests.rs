//! Integration tests for the cohort binary.
//!
//! A shell script stands in for the generation engine. It records the
//! arguments it received, copies the lupus module as it looked mid-run and
//! writes one record per requested patient under `<base>/fhir`.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LUPUS_MODULE: &str = r#"{
  "name": "Lupus",
  "states": {
    "Initial": {
      "type": "Initial",
      "direct_transition": "Lupus_Chance"
    },
    "Lupus_Chance": {
      "type": "Simple",
      "distributed_transition": [
        {
          "distribution": 0.02,
          "transition": "Lupus_Onset"
        },
        {
          "distribution": 0.98,
          "transition": "Terminal"
        }
      ]
    },
    "Lupus_Onset": {
      "type": "ConditionOnset",
      "target_encounter": "Diagnosis",
      "direct_transition": "Terminal"
    },
    "Terminal": {
      "type": "Terminal"
    }
  }
}
"#;

const FAKE_ENGINE: &str = r#"
args="$*"
count=0
modules=""
base=""
while [ $# -gt 0 ]; do
  case "$1" in
    -p) count="$2"; shift ;;
    -d) modules="$2"; shift ;;
    --exporter.baseDirectory=*) base="${1#--exporter.baseDirectory=}" ;;
  esac
  shift
done
mkdir -p "$base/fhir"
cp "$modules/lupus.json" "$base/lupus_during_run.json"
i=0
while [ "$i" -lt "$count" ]; do
  echo '{}' > "$base/fhir/patient_$i.json"
  i=$((i + 1))
  echo "$i -- Patient $i"
done
echo "Records: total=$count, alive=$count, dead=0"
echo "$args" > "$base/engine_args.txt"
if [ -n "$FAKE_EXIT" ]; then
  echo "engine failure requested" >&2
  exit "$FAKE_EXIT"
fi
if [ -n "$FAKE_SLEEP" ]; then
  exec sleep "$FAKE_SLEEP"
fi
"#;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = dir.path();
        fs::create_dir_all(root.join("modules")).unwrap();
        fs::write(root.join("modules/lupus.json"), LUPUS_MODULE).unwrap();
        fs::write(root.join("engine.sh"), FAKE_ENGINE).unwrap();

        let config = format!(
            r#"
[paths]
modules_dir = "{modules}"
output_dir = "{output}"
state_dir = "{state}"

[engine]
program = "/bin/sh"
args = ["{script}"]
extra_args = []
poll_interval_ms = 10

[calibration]
lock_policy = "fail_fast"
"#,
            modules = root.join("modules").display(),
            output = root.join("out/fhir").display(),
            state = root.join("state").display(),
            script = root.join("engine.sh").display(),
        );
        fs::write(root.join("config.toml"), config).unwrap();

        Self { dir }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn cli(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("cohort"));
        cmd.arg("--config").arg(self.path("config.toml"));
        cmd.env_remove("FAKE_EXIT").env_remove("FAKE_SLEEP");
        cmd
    }

    fn lupus(&self) -> String {
        fs::read_to_string(self.path("modules/lupus.json")).unwrap()
    }
}

fn lupus_onset_probability(path: &Path) -> f64 {
    let text = fs::read_to_string(path).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
    doc["states"]["Lupus_Chance"]["distributed_transition"][0]["distribution"]
        .as_f64()
        .unwrap()
}

#[test]
fn test_cli_help() {
    Command::new(assert_cmd::cargo::cargo_bin!("cohort"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Synthetic patient cohort generator"));
}

#[test]
fn test_list_shows_catalog() {
    let ws = Workspace::new();
    ws.cli()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cardiovascular"))
        .stdout(predicate::str::contains("lupus"))
        .stdout(predicate::str::contains("prostate_cancer"));
}

#[test]
fn test_resolve_forced_gender() {
    let ws = Workspace::new();
    ws.cli()
        .args(["resolve", "pregnancy", "asthma"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Gender filter: F"));
}

#[test]
fn test_resolve_reports_weighted_skew_without_filter() {
    let ws = Workspace::new();
    ws.cli()
        .args(["resolve", "lupus"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Gender filter: none"))
        .stdout(predicate::str::contains("lupus: 90% female"));
}

#[test]
fn test_resolve_conflict_fails() {
    let ws = Workspace::new();
    ws.cli()
        .args(["resolve", "prostate_cancer", "pregnancy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pregnancy (female only) vs prostate_cancer (male only)"));
}

#[test]
fn test_unknown_pathology_fails() {
    let ws = Workspace::new();
    ws.cli()
        .args(["resolve", "dragon_pox"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dragon_pox"));
}

#[test]
fn test_bad_prevalence_flag_rejected() {
    let ws = Workspace::new();
    ws.cli()
        .args(["generate", "-P", "lupus", "--prevalence", "lupus=lots"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a number"));
}

#[cfg(unix)]
mod with_fake_engine {
    use super::*;

    #[test]
    fn test_generate_calibrates_and_restores() {
        let ws = Workspace::new();
        let original = ws.lupus();

        ws.cli()
            .args([
                "generate",
                "-P",
                "lupus",
                "-n",
                "3",
                "--seed",
                "42",
                "--prevalence",
                "lupus=0.3",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Generated 3 patient(s)"))
            .stdout(predicate::str::contains("Gender filter: none"));

        let during = lupus_onset_probability(&ws.path("out/lupus_during_run.json"));
        assert!((during - 0.3).abs() < 1e-6);
        assert_eq!(ws.lupus(), original);

        let args = fs::read_to_string(ws.path("out/engine_args.txt")).unwrap();
        let base = format!("--exporter.baseDirectory={}", ws.path("out").display());
        assert!(args.contains(&base));
        assert_eq!(
            fs::read_dir(ws.path("out/fhir")).unwrap().count(),
            3
        );
        assert!(args.contains("-p 3"));
        assert!(args.contains("-s 42"));
        assert!(!args.contains("-g"));
    }

    #[test]
    fn test_generate_passes_forced_gender_and_age() {
        let ws = Workspace::new();
        ws.cli()
            .args([
                "generate",
                "-P",
                "pregnancy",
                "-n",
                "2",
                "--age",
                "18-45",
                "--only-alive",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Gender filter: F"));

        let args = fs::read_to_string(ws.path("out/engine_args.txt")).unwrap();
        assert!(args.contains("-g F"));
        assert!(args.contains("-a 18-45"));
        assert!(args.contains("--generate.only_alive_patients=true"));
    }

    #[test]
    fn test_conflict_never_starts_engine() {
        let ws = Workspace::new();
        ws.cli()
            .args(["generate", "-P", "pregnancy", "-P", "prostate_cancer"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("resolve stage"));

        assert!(!ws.path("out/engine_args.txt").exists());
    }

    #[test]
    fn test_engine_failure_restores_module() {
        let ws = Workspace::new();
        let original = ws.lupus();

        ws.cli()
            .env("FAKE_EXIT", "4")
            .args(["generate", "-P", "lupus", "--prevalence", "lupus=0.5"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("generate stage"))
            .stderr(predicate::str::contains("exit code 4"));

        let during = lupus_onset_probability(&ws.path("out/lupus_during_run.json"));
        assert!((during - 0.5).abs() < 1e-6);
        assert_eq!(ws.lupus(), original);
    }

    #[test]
    fn test_non_adjustable_override_rejected() {
        let ws = Workspace::new();
        ws.cli()
            .args(["generate", "-P", "pregnancy", "--prevalence", "pregnancy=0.5"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not support prevalence adjustment"));

        assert!(!ws.path("out/engine_args.txt").exists());
    }

    #[test]
    fn test_output_dir_override_reaches_engine() {
        let ws = Workspace::new();
        ws.cli()
            .arg("--output-dir")
            .arg(ws.path("elsewhere/fhir"))
            .args(["generate", "-P", "lupus", "-n", "2"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Generated 2 patient(s)"));

        assert!(ws.path("elsewhere/engine_args.txt").exists());
        assert!(ws.path("elsewhere/fhir/patient_1.json").exists());
        assert!(!ws.path("out/engine_args.txt").exists());
    }

    #[test]
    fn test_missing_engine_fails_before_calibration() {
        let ws = Workspace::new();
        let original = ws.lupus();
        let config = fs::read_to_string(ws.path("config.toml"))
            .unwrap()
            .replace("program = \"/bin/sh\"", "program = \"/nonexistent/java\"");
        fs::write(ws.path("config.toml"), config).unwrap();

        ws.cli()
            .args(["generate", "-P", "lupus", "--prevalence", "lupus=0.5"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("validate stage"))
            .stderr(predicate::str::contains("Engine unavailable"))
            .stderr(predicate::str::contains("/nonexistent/java"));

        assert_eq!(ws.lupus(), original);
        assert!(!ws.path("state/journal/lupus.json").exists());
    }

    #[test]
    fn test_progress_reported_on_stderr() {
        let ws = Workspace::new();
        ws.cli()
            .args(["generate", "-P", "lupus", "-n", "2"])
            .assert()
            .success()
            .stderr(predicate::str::contains("2/2 patient(s)"));
    }

    #[test]
    fn test_interrupt_stops_engine_and_restores_module() {
        use std::process::{Command as StdCommand, Stdio};
        use std::thread;
        use std::time::{Duration, Instant};

        let ws = Workspace::new();
        let original = ws.lupus();

        let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("cohort"))
            .arg("--config")
            .arg(ws.path("config.toml"))
            .args(["generate", "-P", "lupus", "-n", "1", "--prevalence", "lupus=0.4"])
            .env_remove("FAKE_EXIT")
            .env("FAKE_SLEEP", "30")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        // The engine writes its args once the module is calibrated
        let deadline = Instant::now() + Duration::from_secs(20);
        while !ws.path("out/engine_args.txt").exists() {
            assert!(Instant::now() < deadline, "engine never started");
            thread::sleep(Duration::from_millis(20));
        }
        let during = lupus_onset_probability(&ws.path("out/lupus_during_run.json"));
        assert!((during - 0.4).abs() < 1e-6);

        let sent = StdCommand::new("kill")
            .args(["-INT", &child.id().to_string()])
            .status()
            .unwrap();
        assert!(sent.success());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            assert!(started.elapsed() < Duration::from_secs(10), "cohort ignored SIGINT");
            thread::sleep(Duration::from_millis(20));
        };

        assert_eq!(status.code(), Some(130));
        assert_eq!(ws.lupus(), original);
        assert!(!ws.path("state/journal/lupus.json").exists());

        let mut stderr = String::new();
        std::io::Read::read_to_string(&mut child.stderr.take().unwrap(), &mut stderr).unwrap();
        assert!(stderr.contains("Run cancelled"));
    }

    #[test]
    fn test_history_lists_runs() {
        let ws = Workspace::new();
        ws.cli()
            .args(["generate", "-P", "lupus", "-n", "1"])
            .assert()
            .success();

        ws.cli()
            .arg("history")
            .assert()
            .success()
            .stdout(predicate::str::contains("[lupus]"))
            .stdout(predicate::str::contains("ok, 1 patient(s)"));
    }
}

#[test]
fn test_recover_restores_orphaned_module() {
    let ws = Workspace::new();
    let original = ws.lupus();
    let calibrated = original.replace("0.02", "0.3").replace("0.98", "0.7");
    fs::write(ws.path("modules/lupus.json"), &calibrated).unwrap();

    // Journal entry left by a process that died mid-run
    fs::create_dir_all(ws.path("state/journal")).unwrap();
    let entry = serde_json::json!({
        "module": "lupus",
        "path": ws.path("modules/lupus.json"),
        "created_at": "2026-01-01T00:00:00Z",
        "pid": 999999,
        "original": original,
        "calibrated": calibrated,
    });
    fs::write(ws.path("state/journal/lupus.json"), entry.to_string()).unwrap();

    ws.cli()
        .arg("recover")
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored lupus"));
    assert_eq!(ws.lupus(), original);

    ws.cli()
        .arg("recover")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to recover"));
}
