use intake::config::{ConfigLoader, ModelLimits};
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    let keys: Vec<String> = env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("INTAKE_"))
        .collect();
    for key in keys {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert!(!cfg.ai.enabled);
    assert_eq!(cfg.dispatcher.concurrency, 3);
    assert_eq!(cfg.dispatcher.max_jobs, 25);
    assert_eq!(cfg.dispatcher.stale_timeout_seconds, 600);
    assert_eq!(cfg.retry.max_retries, 5);
    assert_eq!(cfg.retry.max_retries_local, 3);
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INTAKE_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "INTAKE_API_BIND_ADDR=192.168.0.10:5000\nINTAKE_DISPATCHER_CONCURRENCY=5\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "INTAKE_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Profile chosen in .env.local selects the profile-specific files.
    write_env_file(
        &temp_dir,
        ".env.local",
        "INTAKE_PROFILE=test\nINTAKE_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.dispatcher.concurrency, 5);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "INTAKE_API_BIND_ADDR=127.0.0.1:3000\nINTAKE_AI_ANALYZE_MODELS=file-model\n",
    );
    unsafe {
        env::set_var("INTAKE_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("INTAKE_AI_ANALYZE_MODELS", "gemini-2.5-flash, gemini-2.5-pro");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(
        cfg.ai.analyze_models,
        vec!["gemini-2.5-flash".to_string(), "gemini-2.5-pro".to_string()]
    );

    clear_env();
}

#[test]
fn model_limits_are_read_per_model_key() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "INTAKE_RATE_LIMIT_MODEL_GEMINI_2_5_FLASH_RPM=7\n\
         INTAKE_RATE_LIMIT_MODEL_GEMINI_2_5_FLASH_BATCH_TOKENS=90000\n\
         INTAKE_RATE_LIMIT_MODEL_CUSTOM_MODEL_TPM=1234\n",
    );

    let cfg = loader(&temp_dir).load().expect("config loads with limits");
    let flash = cfg.limits_for("gemini-2.5-flash");
    assert_eq!(flash.rpm, Some(7));
    assert_eq!(flash.batch_tokens, Some(90_000));
    assert_eq!(
        cfg.limits_for("custom-model"),
        ModelLimits {
            tpm: Some(1234),
            ..ModelLimits::default()
        }
    );
}

#[test]
fn production_requires_operator_tokens() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INTAKE_PROFILE=production\n");

    let err = loader(&temp_dir)
        .load()
        .expect_err("production without tokens should fail");
    assert!(err.to_string().contains("INTAKE_OPERATOR_TOKENS"));

    write_env_file(
        &temp_dir,
        ".env.production",
        "INTAKE_OPERATOR_TOKENS=alpha,beta\n",
    );
    let cfg = loader(&temp_dir).load().expect("tokens satisfy validation");
    assert_eq!(cfg.operator_tokens, vec!["alpha", "beta"]);
    assert!(cfg.is_production());
}

#[test]
fn invalid_values_are_reported_with_their_key() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INTAKE_DISPATCHER_MAX_JOBS=lots\n");
    let err = loader(&temp_dir).load().expect_err("non-numeric max jobs");
    assert!(err.to_string().contains("INTAKE_DISPATCHER_MAX_JOBS"));

    write_env_file(&temp_dir, ".env", "INTAKE_API_BIND_ADDR=not-an-addr\n");
    let err = loader(&temp_dir).load().expect_err("invalid bind addr should fail");
    assert!(err.to_string().contains("invalid api bind address"));

    write_env_file(
        &temp_dir,
        ".env",
        "INTAKE_AI_ENABLED=true\n",
    );
    let err = loader(&temp_dir).load().expect_err("AI without key");
    assert!(err.to_string().contains("INTAKE_AI_API_KEY"));
}
