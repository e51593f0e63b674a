use crate::ProvisionError;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const TRANSIENT_MARKERS: &[&str] = &[
    "busy",
    "temporarily unavailable",
    "timed out",
    "try again",
    "locked by another",
];

const NOT_FOUND_MARKERS: &[&str] = &["no such", "does not exist", "not found"];

/// Run an external tool to completion, bounded by `timeout`.
///
/// A timeout is transient: the child is killed and the caller may retry.
/// A non-zero exit is classified from the tool's output.
pub async fn run_tool(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<Output, ProvisionError> {
    debug!("exec: {program} {}", args.join(" "));
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ProvisionError::Transient(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            )))
        }
    };

    if output.status.success() {
        Ok(output)
    } else {
        Err(classify_failure(program, &output))
    }
}

/// Map a failed invocation to an error class using its output text.
pub fn classify_failure(program: &str, output: &Output) -> ProvisionError {
    let mut text = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if text.is_empty() {
        text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    }
    let detail = match output.status.code() {
        Some(code) => format!("{program} exited with code {code}: {text}"),
        None => format!("{program} killed by signal: {text}"),
    };
    classify_message(&text, detail)
}

pub(crate) fn classify_message(text: &str, detail: String) -> ProvisionError {
    let lower = text.to_ascii_lowercase();
    if lower.contains("already exists") {
        ProvisionError::AlreadyExists(detail)
    } else if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        ProvisionError::NotFound(detail)
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ProvisionError::Transient(detail)
    } else {
        ProvisionError::Permanent(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail() -> String {
        "targetcli exited with code 1".to_owned()
    }

    #[test]
    fn classifies_common_tool_messages() {
        assert!(matches!(
            classify_message("No such path /iscsi/iqn.x", detail()),
            ProvisionError::NotFound(_)
        ));
        assert!(matches!(
            classify_message("Storage object fileio/M1 already exists", detail()),
            ProvisionError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify_message("Device or resource busy", detail()),
            ProvisionError::Transient(_)
        ));
        assert!(matches!(
            classify_message("Invalid file_or_dev path", detail()),
            ProvisionError::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn successful_command_returns_output() {
        let out = run_tool("echo", &["hello".to_owned()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn failing_command_is_classified() {
        let args = vec!["-c".to_owned(), "echo 'resource busy' >&2; exit 3".to_owned()];
        let err = run_tool("sh", &args, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn slow_command_times_out_as_transient() {
        let err = run_tool("sleep", &["5".to_owned()], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let err = run_tool("netboot-no-such-tool", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Io(_)));
        assert!(!err.is_transient());
    }
}
