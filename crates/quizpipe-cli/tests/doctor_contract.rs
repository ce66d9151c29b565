use std::io::Write;

#[test]
fn quizpipe_doctor_reports_presence_booleans_only() {
    let bin = assert_cmd::cargo::cargo_bin!("quizpipe");
    let out = std::process::Command::new(bin)
        .args(["doctor"])
        .env("QUIZPIPE_LLM_API_KEY", "sk-very-secret-value")
        .env_remove("GROQ_API_KEY")
        .env_remove("QUIZPIPE_LLM_BASE_URL")
        .env_remove("QUIZPIPE_ENV_FILE")
        .output()
        .expect("run quizpipe doctor");

    assert!(out.status.success(), "quizpipe doctor failed");
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(!s.contains("sk-very-secret-value"), "doctor must not print secrets");
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse doctor json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["name"].as_str(), Some("quizpipe"));
    assert_eq!(v["configured"]["llm"]["api_key"].as_bool(), Some(true));
    assert_eq!(v["configured"]["llm"]["base_url"].as_bool(), Some(false));
    assert!(v["configured"]["render"]["chrome_bin"].is_boolean());
    assert!(v["configured"]["render"]["cdp_endpoint"].is_boolean());
}

#[test]
fn env_file_fills_missing_vars() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "# comment").unwrap();
    writeln!(f, "GROQ_API_KEY=from-file").unwrap();
    writeln!(f, "QUIZPIPE_LLM_MODEL = file-model").unwrap();
    writeln!(f, "not a pair").unwrap();

    let bin = assert_cmd::cargo::cargo_bin!("quizpipe");
    let out = std::process::Command::new(bin)
        .args(["doctor"])
        .env("QUIZPIPE_ENV_FILE", f.path())
        .env_remove("QUIZPIPE_LLM_MODEL")
        .env_remove("GROQ_API_KEY")
        .env_remove("QUIZPIPE_LLM_API_KEY")
        .output()
        .expect("run quizpipe doctor");

    assert!(out.status.success());
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(!s.contains("from-file"));
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse doctor json");
    assert_eq!(v["configured"]["llm"]["api_key"].as_bool(), Some(true));
    assert_eq!(v["configured"]["llm"]["model"].as_bool(), Some(true));
    assert_eq!(v["configured"]["env_file"].as_bool(), Some(true));
}
