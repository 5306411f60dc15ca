//! Small text helpers shared by the payload decoders.

use std::sync::LazyLock;

use regex::Regex;

/// ANSI CSI escape sequences, as emitted by colorized tools like gpustat.
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\x9B|\x1B\[)[0-?]*[ -/]*[@-~]").unwrap());

/// Strip ANSI escape sequences from terminal output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Parse a human-readable size like `31G`, `3.9Gi`, or `512M` into
/// gigabytes. Unrecognized suffixes and unparseable numbers come back as
/// `0.0` so one odd row cannot poison a whole payload.
pub fn parse_gigabytes(value: &str) -> f64 {
    let value = value.trim();
    for (suffix, scale) in [("Gi", 1.0), ("G", 1.0), ("Mi", 1.0 / 1024.0), ("M", 1.0 / 1024.0)] {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<f64>().map(|n| n * scale).unwrap_or(0.0);
        }
    }
    0.0
}

/// Busiest `rxkB/s txkB/s` pair in a block of sar sample rows. Rows that
/// are not exactly two numbers are skipped; `None` when nothing matched.
pub fn max_kb_rates(text: &str) -> Option<(f64, f64)> {
    let mut down_kb: f64 = 0.0;
    let mut up_kb: f64 = 0.0;
    let mut seen = false;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [down, up] = fields.as_slice() else {
            continue;
        };
        let (Ok(down), Ok(up)) = (down.parse::<f64>(), up.parse::<f64>()) else {
            continue;
        };
        seen = true;
        down_kb = down_kb.max(down);
        up_kb = up_kb.max(up);
    }
    seen.then_some((down_kb, up_kb))
}

/// kB/s to Mb/s: times eight bits, over 1024.
pub fn kb_to_mbit(kb: f64) -> f64 {
    kb * 8.0 / 1024.0
}
