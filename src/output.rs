//! Output parsing (§4.7): classifies every stdout/stderr line from the
//! supervised binary into a readiness signal, a fatal-signal error, or a
//! replication-state transition.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static STDERR_READY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)MinIO Object Storage Server").unwrap());
static STDOUT_READY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)waiting for connections").unwrap());
static ADDRESS_IN_USE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)address already in use").unwrap());
static INIT_EXCEPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"exception in initAndListen: \(([^)]+)\): (.+)").unwrap());
static INIT_EXCEPTION_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"DBException in initAndListen,").unwrap());
static OPENSSL_MISSING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CURL_OPENSSL_[34] not found").unwrap());
static SHARED_OBJECT_MISSING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(lib[^:]+): cannot open shared object").unwrap());
static ABORTING: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*\*aborting after").unwrap());
static REPL_TRANSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"transition to (\S+) from (\S+)").unwrap());
static PRIMARY_TRANSITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"transition to primary complete; database writes are now permitted").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineSignal {
    StdoutReady,
    StderrReady,
    FatalError(String),
    ReplState { state: String, is_primary: bool },
    Primary,
    None,
}

/// Scan a single stdout line.
pub fn scan_stdout(line: &str) -> LineSignal {
    if STDOUT_READY.is_match(line) {
        return LineSignal::StdoutReady;
    }
    scan_common(line)
}

/// Scan a single stderr line.
pub fn scan_stderr(line: &str) -> LineSignal {
    if STDERR_READY.is_match(line) {
        return LineSignal::StderrReady;
    }
    scan_common(line)
}

fn scan_common(line: &str) -> LineSignal {
    if ADDRESS_IN_USE.is_match(line) {
        return LineSignal::FatalError("Port already in use".to_string());
    }

    if let Some(caps) = INIT_EXCEPTION.captures(line) {
        return LineSignal::FatalError(format!("{}: {}", &caps[1], &caps[2]));
    }

    if INIT_EXCEPTION_JSON.is_match(line) {
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if let Some(msg) = value.pointer("/attr/error") {
                return LineSignal::FatalError(msg.to_string());
            }
        }
        return LineSignal::FatalError(line.to_string());
    }

    if OPENSSL_MISSING.is_match(line) {
        return LineSignal::FatalError(line.to_string());
    }

    if let Some(caps) = SHARED_OBJECT_MISSING.captures(line) {
        return LineSignal::FatalError(format!("missing shared library: {}", &caps[1]));
    }

    if ABORTING.is_match(line) {
        return LineSignal::FatalError(line.to_string());
    }

    if PRIMARY_TRANSITION.is_match(line) {
        return LineSignal::Primary;
    }

    if let Some(caps) = REPL_TRANSITION.captures(line) {
        let state = caps[1].to_string();
        let is_primary = state.eq_ignore_ascii_case("PRIMARY");
        return LineSignal::ReplState { state, is_primary };
    }

    LineSignal::None
}

/// Windows/Unix exit-code + signal augmentation for `instanceClosed` (§4.7
/// "Close handling").
pub fn augment_close_message(code: Option<i32>, signal: Option<&str>) -> Option<String> {
    if signal == Some("SIGILL") {
        return Some(
            "process received SIGILL; this may indicate a CPU lacking AVX support".to_string(),
        );
    }
    if cfg!(target_os = "windows") {
        if let Some(code) = code {
            if code > 1_000_000_000 {
                return Some(
                    "exit code suggests a missing Visual C++ Redistributable; install vc_redist"
                        .to_string(),
                );
            }
        }
    }
    None
}

/// Whether a close (code, signal) pair counts as unexpected per §4.7: a
/// non-zero exit, with Windows exit code 12 specifically accepted as a
/// SIGINT-like signal.
pub fn is_unexpected_close(code: Option<i32>, signal: Option<&str>) -> bool {
    match code {
        Some(0) => false,
        Some(12) if cfg!(target_os = "windows") => false,
        Some(_) => true,
        None => signal.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdout_ready_signal() {
        assert_eq!(scan_stdout("waiting for connections on port 9000"), LineSignal::StdoutReady);
    }

    #[test]
    fn test_stderr_ready_signal() {
        assert_eq!(
            scan_stderr("MinIO Object Storage Server started"),
            LineSignal::StderrReady
        );
    }

    #[test]
    fn test_address_in_use() {
        match scan_stdout("ERROR: listen tcp :9000: bind: address already in use") {
            LineSignal::FatalError(msg) => assert!(msg.contains("already in use")),
            other => panic!("expected FatalError, got {other:?}"),
        }
    }

    #[test]
    fn test_init_exception_plain() {
        match scan_stderr("exception in initAndListen: (InvalidBSON): bad magic") {
            LineSignal::FatalError(msg) => {
                assert!(msg.contains("InvalidBSON"));
                assert!(msg.contains("bad magic"));
            }
            other => panic!("expected FatalError, got {other:?}"),
        }
    }

    #[test]
    fn test_init_exception_json_variant() {
        let line = r#"{"t":{}, "msg":"DBException in initAndListen,", "attr":{"error":"bad magic number"}}"#;
        match scan_stderr(line) {
            LineSignal::FatalError(msg) => assert!(msg.contains("bad magic number")),
            other => panic!("expected FatalError, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_shared_object() {
        match scan_stderr("libssl.so.1.1: cannot open shared object file: No such file") {
            LineSignal::FatalError(msg) => assert!(msg.contains("libssl.so.1.1")),
            other => panic!("expected FatalError, got {other:?}"),
        }
    }

    #[test]
    fn test_repl_state_transition() {
        match scan_stdout("transition to SECONDARY from PRIMARY") {
            LineSignal::ReplState { state, is_primary } => {
                assert_eq!(state, "SECONDARY");
                assert!(!is_primary);
            }
            other => panic!("expected ReplState, got {other:?}"),
        }
    }

    #[test]
    fn test_primary_transition() {
        assert_eq!(
            scan_stdout("transition to primary complete; database writes are now permitted"),
            LineSignal::Primary
        );
    }

    #[test]
    fn test_is_unexpected_close() {
        assert!(!is_unexpected_close(Some(0), None));
        assert!(is_unexpected_close(Some(1), None));
        assert!(is_unexpected_close(None, Some("SIGKILL")));
    }

    #[test]
    fn test_sigill_augments_message() {
        let msg = augment_close_message(Some(1), Some("SIGILL")).unwrap();
        assert!(msg.to_lowercase().contains("avx"));
    }
}
