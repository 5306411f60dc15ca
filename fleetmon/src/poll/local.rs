//! Local execution: the composed bundle under `sh -c`.

use tokio::process::Command;

use super::{PollError, stderr_excerpt};

/// Run `command` through the local shell and return its stdout.
///
/// A non-zero exit is a transient failure carrying the exit status and the
/// start of stderr. The child is killed if the future is dropped, so a
/// cycle timeout cannot leak a subprocess.
pub(crate) async fn run_shell(command: &str) -> Result<String, PollError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| PollError::transient(format!("failed to spawn shell: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PollError::transient(format!(
            "command exited with {}: {}",
            output.status,
            stderr_excerpt(&stderr)
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundle_codec::CommandBundle;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let out = run_shell("printf 'hello'").await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_transient_with_stderr() {
        let err = run_shell("echo nope >&2; exit 3").await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.message().contains('3'), "{err}");
        assert!(err.message().contains("nope"), "{err}");
    }

    #[tokio::test]
    async fn bundle_output_splits_back_into_sections() {
        let bundle = CommandBundle::new()
            .with("DISK", "printf 'fs 10G 5G 5G 50%% /data\\n'")
            .with("UPTIME", "printf 'up 3 days\\n'");

        let raw = run_shell(&bundle.compose()).await.unwrap();
        let sections = bundle.split_output(&raw).unwrap();

        assert_eq!(sections["DISK"], "fs 10G 5G 5G 50% /data");
        assert_eq!(sections["UPTIME"], "up 3 days");
    }

    #[tokio::test]
    async fn failed_bundle_member_leaves_markers_unterminated() {
        let bundle = CommandBundle::new().with("A", "exit 7");

        let err = run_shell(&bundle.compose()).await.unwrap_err();

        // `&&` chaining stops at the failing member, so the shell itself
        // exits non-zero before the end marker is printed.
        assert!(err.message().contains('7'), "{err}");
    }
}
