//! Crash reporting for a process that aborts on panic.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, PanicHookInfo};
use std::path::Path;

use tracing::error;

use crate::logging;

/// Install a panic hook that reports the crash through `tracing` before
/// handing off to the previous hook.
///
/// Release builds abort on panic, and the non-blocking log writer gets no
/// chance to flush once that starts; the hook therefore also appends the
/// record straight to the current log file.
pub fn install(log_dir: &Path) {
    let log_dir = log_dir.to_path_buf();
    let previous = panic::take_hook();

    panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let record = crash_record(info);
        error!(target: "fleetmon::crash", "{record}");
        if cfg!(panic = "abort") {
            logging::append_crash_record(&log_dir, &record);
        }
        previous(info);
    }));
}

fn crash_record(info: &PanicHookInfo<'_>) -> String {
    let thread = std::thread::current();
    let location = info
        .location()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<unknown location>".to_owned());
    format!(
        "{}\nbacktrace:\n{}",
        crash_line(
            thread.name().unwrap_or("<unnamed>"),
            &location,
            &payload_text(info.payload()),
        ),
        Backtrace::force_capture()
    )
}

/// First line of a crash record, shaped like the std panic message so log
/// scrapers treat both alike.
fn crash_line(thread: &str, location: &str, payload: &str) -> String {
    format!("thread '{thread}' panicked at {location}: {payload}")
}

fn payload_text(payload: &dyn Any) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}
