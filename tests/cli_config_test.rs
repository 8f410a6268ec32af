use std::process::Command;
use tempfile::TempDir;

fn notewatch(dir: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_notewatch"));
    cmd.current_dir(dir).env_remove("NW_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_init_command() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();

    let output = notewatch(temp_path)
        .args(["init", "vault"])
        .output()
        .expect("Failed to run init command");
    assert!(output.status.success());

    // Check that config file was created
    let config_path = temp_path.join(".notewatch/settings.toml");
    assert!(config_path.exists());

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("version = 1"));
    assert!(content.contains("[watch]"));
    assert!(content.contains("vault"));
    assert!(content.contains("[handlers.transcript]"));

    // Second init without --force refuses
    let again = notewatch(temp_path).arg("init").output().unwrap();
    assert!(!again.status.success());
    let forced = notewatch(temp_path).args(["init", "--force"]).output().unwrap();
    assert!(forced.status.success());
}

#[test]
fn test_config_command() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();

    let config_dir = temp_path.join(".notewatch");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("settings.toml"),
        r#"
version = 1

[watch]
roots = ["notes"]
debounce_ms = 4321

[dispatch]
mode = "all"
"#,
    )
    .unwrap();

    let output = notewatch(temp_path).arg("config").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("debounce_ms = 4321"));
    assert!(stdout.contains("mode = \"all\""));
}

#[test]
fn test_transition_command() {
    let temp_dir = TempDir::new().unwrap();
    let temp_path = temp_dir.path();
    let note = temp_path.join("idea.md");
    std::fs::write(&note, "---\ntitle: Idea\nstatus: inbox\n---\nbody\n").unwrap();

    let output = notewatch(temp_path)
        .args(["transition", "idea.md", "promoted", "--reason", "worth keeping"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("inbox -> promoted"));

    let content = std::fs::read_to_string(&note).unwrap();
    assert!(content.contains("status: promoted"));
    assert!(content.contains("processed_date"));

    // promoted -> promoted is not a transition; the file stays as it is
    let before = std::fs::read(&note).unwrap();
    let rejected = notewatch(temp_path)
        .args(["transition", "idea.md", "promoted"])
        .output()
        .unwrap();
    assert!(!rejected.status.success());
    assert_eq!(std::fs::read(&note).unwrap(), before);
}

#[test]
fn test_status_without_snapshot_fails() {
    let temp_dir = TempDir::new().unwrap();
    let output = notewatch(temp_dir.path()).arg("status").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No health snapshot"));
}
