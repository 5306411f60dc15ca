//! The polling engine.
//!
//! One [`PollLoop`] drives one source. A source is described by a
//! [`SourceSpec`]: a unique cache key, the [`PollWork`] to perform each
//! cycle, the poll interval, and a per-cycle timeout. Loops retry transient
//! failures forever at the poll cadence and only ever exit on cancellation
//! or a fatal error.

mod local;
mod poll_loop;
mod remote;

pub use poll_loop::{LoopState, MIN_CYCLE_DELAY, PollLoop};
pub use remote::{RemoteEndpoint, SshTransport, Transport, TransportSession};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bundle_codec::{BundleError, CommandBundle, SectionMap};

/// The work a poll loop performs each cycle, one variant per execution
/// style. Only `Remote` carries a transport; local and function sources
/// cannot hold a session by construction.
pub enum PollWork {
    /// Run the composed bundle as a local `sh -c` subprocess.
    Local {
        bundle: CommandBundle,
        decoder: Arc<dyn SourceDecoder>,
    },
    /// Run the composed bundle over an established remote session.
    Remote {
        transport: Arc<dyn Transport>,
        bundle: CommandBundle,
        decoder: Arc<dyn SourceDecoder>,
    },
    /// Run an in-process async task that produces the payload directly.
    Function { task: Arc<dyn SourceTask> },
}

impl PollWork {
    /// Transport-backed loops re-establish their session after a degraded
    /// cycle; the other kinds re-enter the running state directly.
    pub fn is_transport(&self) -> bool {
        matches!(self, PollWork::Remote { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            PollWork::Local { .. } => "local",
            PollWork::Remote { .. } => "remote",
            PollWork::Function { .. } => "function",
        }
    }
}

impl fmt::Debug for PollWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollWork::Local { bundle, .. } => f
                .debug_struct("Local")
                .field("sections", &bundle.names().collect::<Vec<_>>())
                .finish_non_exhaustive(),
            PollWork::Remote { bundle, .. } => f
                .debug_struct("Remote")
                .field("sections", &bundle.names().collect::<Vec<_>>())
                .finish_non_exhaustive(),
            PollWork::Function { .. } => f.debug_struct("Function").finish_non_exhaustive(),
        }
    }
}

/// One source to poll: identity, work, cadence, and per-cycle timeout.
#[derive(Debug)]
pub struct SourceSpec {
    /// Cache key, unique across the fleet.
    pub key: String,
    pub work: PollWork,
    /// Target wall-clock spacing between cycle starts.
    pub interval: Duration,
    /// Upper bound on one cycle's execution.
    pub timeout: Duration,
}

impl SourceSpec {
    pub fn new(key: impl Into<String>, work: PollWork, interval: Duration, timeout: Duration) -> Self {
        Self {
            key: key.into(),
            work,
            interval,
            timeout,
        }
    }
}

/// Turns the split output of a command bundle into the cached payload.
///
/// Decoders are pure: no I/O, no clock. A decoder that cannot make sense of
/// its sections returns a [`DecodeError`], which the loop treats as a
/// transient cycle failure.
pub trait SourceDecoder: Send + Sync + 'static {
    fn decode(&self, sections: &SectionMap) -> Result<String, DecodeError>;
}

/// A source whose poll is an arbitrary async operation rather than a
/// command bundle. The returned string is cached verbatim.
#[async_trait]
pub trait SourceTask: Send + Sync + 'static {
    async fn run(&self) -> Result<String, PollError>;
}

/// Decoder failure. Always transient from the loop's point of view.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure of one poll cycle.
///
/// Transient errors degrade the loop and are retried forever at the poll
/// cadence. Fatal errors mark programming bugs; they terminate the loop and,
/// by supervisor policy, the whole fleet.
#[derive(Debug, Clone)]
pub struct PollError {
    message: String,
    fatal: bool,
}

impl PollError {
    /// An expected environmental failure: timeout, disconnect, bad output.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// An unexpected failure that must not be retried silently.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PollError {}

impl From<DecodeError> for PollError {
    fn from(err: DecodeError) -> Self {
        PollError::transient(format!("decode error: {err}"))
    }
}

impl From<BundleError> for PollError {
    fn from(err: BundleError) -> Self {
        PollError::transient(format!("decode error: {err}"))
    }
}

/// Byte budget for stderr excerpts quoted in failure comments.
const STDERR_EXCERPT_LEN: usize = 200;

/// First chunk of a stderr stream, bounded so a chatty command cannot
/// flood the cache comment.
pub(crate) fn stderr_excerpt(text: &str) -> String {
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT_LEN {
        text.to_owned()
    } else {
        let mut cut: String = text.chars().take(STDERR_EXCERPT_LEN).collect();
        cut.push_str("...");
        cut
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_fatal_are_distinguished() {
        assert!(!PollError::transient("timeout").is_fatal());
        assert!(PollError::fatal("bug").is_fatal());
        assert_eq!(PollError::transient("timeout").to_string(), "timeout");
    }

    #[test]
    fn decode_errors_convert_to_transient_poll_errors() {
        let err: PollError = DecodeError::new("missing CPU section").into();
        assert!(!err.is_fatal());
        assert!(err.message().contains("missing CPU section"));
    }

    #[test]
    fn bundle_errors_convert_to_transient_poll_errors() {
        let bundle = CommandBundle::new().with("CPU", "iostat");
        let err: PollError = bundle.split_output("garbage").unwrap_err().into();
        assert!(!err.is_fatal());
        assert!(err.message().contains("CPU"));
    }

    #[test]
    fn stderr_excerpts_are_bounded() {
        assert_eq!(stderr_excerpt("  short  "), "short");
        let long = "x".repeat(500);
        let excerpt = stderr_excerpt(&long);
        assert!(excerpt.len() < 250);
        assert!(excerpt.ends_with("..."));
    }
}
