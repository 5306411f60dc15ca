//! The per-host probe: one ssh bundle covering CPU, network, memory, CUDA
//! installs, and GPU occupancy.

use std::sync::LazyLock;

use bundle_codec::{CommandBundle, SectionMap};
use regex::Regex;

use crate::config::BundleConfig;
use crate::poll::{DecodeError, SourceDecoder};
use crate::utils::{kb_to_mbit, max_kb_rates, parse_gigabytes, strip_ansi};

/// Installed CUDA toolkits, matched against `/usr/local` listings.
static CUDA_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cuda-([0-9]+\.[0-9]+)").unwrap());

/// Thresholds for the `[busy]` tag in the title line.
const BUSY_CPU_FRACTION: f64 = 0.85;
const BUSY_MEM_FRACTION: f64 = 0.91;
const BUSY_DOWNLOAD_MBIT: f64 = 300.0;

pub fn bundle(commands: &BundleConfig) -> CommandBundle {
    CommandBundle::new()
        .with("CPU", commands.cpu.as_str())
        .with("NETWORK", commands.io.as_str())
        .with("MEM", commands.mem.as_str())
        .with("CUDA", commands.cuda.as_str())
        .with("GPUSTAT", commands.gpustat.as_str())
}

/// Renders the host summary: a title line with hostname, driver, CPU,
/// memory, download rate, and CUDA versions, followed by one line per GPU.
/// A host under load gets a `[busy]` tag after its hostname.
pub struct HostDecoder;

impl SourceDecoder for HostDecoder {
    fn decode(&self, sections: &SectionMap) -> Result<String, DecodeError> {
        let cpu = decode_cpu(section(sections, "CPU")?)?;
        let down = decode_io(section(sections, "NETWORK")?)?;
        let (used, total) = decode_mem(section(sections, "MEM")?)?;
        let cuda = decode_cuda(section(sections, "CUDA")?);
        let (hostname, driver, gpus) = decode_gpustat(section(sections, "GPUSTAT")?)?;

        let busy = cpu > BUSY_CPU_FRACTION
            || used / total > BUSY_MEM_FRACTION
            || down > BUSY_DOWNLOAD_MBIT;
        let tag = if busy { " [busy]" } else { "" };
        Ok(format!(
            "{hostname}{tag}  driver {driver}  cpu {:.1}%  mem {used:.0}G/{total:.0}G  \
             io ↓{down:.1} Mb/s  cuda {cuda}\n{gpus}",
            cpu * 100.0
        ))
    }
}

fn section<'a>(sections: &'a SectionMap, name: &str) -> Result<&'a str, DecodeError> {
    sections
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| DecodeError::new(format!("missing section {name}")))
}

/// Busy fraction from the collapsed two-sample iostat report; the last
/// field is the idle percentage of the final sample.
fn decode_cpu(text: &str) -> Result<f64, DecodeError> {
    let idle = text
        .split_whitespace()
        .last()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| DecodeError::new(format!("unrecognized iostat output: {text:?}")))?;
    Ok((100.0 - idle) / 100.0)
}

/// Download rate in Mb/s across all sampled interfaces, busiest row wins.
fn decode_io(text: &str) -> Result<f64, DecodeError> {
    let (down_kb, _) = max_kb_rates(text).ok_or_else(|| {
        DecodeError::new(format!("no rate samples in section NETWORK: {text:?}"))
    })?;
    Ok(kb_to_mbit(down_kb))
}

/// Used and total gigabytes from `free -h`, covering both the old layout
/// with a `-/+ buffers/cache` row and the modern one with an available
/// column.
fn decode_mem(text: &str) -> Result<(f64, f64), DecodeError> {
    let lines: Vec<&str> = text.lines().collect();

    if let Some(buffers_line) = lines.get(2).filter(|line| line.contains("buffers/cache")) {
        let fields: Vec<&str> = buffers_line.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(DecodeError::new(format!(
                "unrecognized buffers/cache row: {buffers_line:?}"
            )));
        }
        let used = parse_gigabytes(fields[fields.len() - 2]);
        let free = parse_gigabytes(fields[fields.len() - 1]);
        return Ok((used, used + free));
    }

    let mem_line = lines
        .get(1)
        .ok_or_else(|| DecodeError::new("free output too short"))?;
    let fields: Vec<&str> = mem_line.split_whitespace().collect();
    let (Some(total), Some(available)) = (fields.get(1), fields.last()) else {
        return Err(DecodeError::new(format!(
            "unrecognized memory row: {mem_line:?}"
        )));
    };
    let total = parse_gigabytes(total);
    Ok((total - parse_gigabytes(available), total))
}

/// Newest-first list of CUDA toolkit versions, `-` when none are installed.
fn decode_cuda(text: &str) -> String {
    let mut versions: Vec<&str> = CUDA_VERSION
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|m| m.as_str())
        .collect();
    versions.sort_by(|a, b| {
        let a: f64 = a.parse().unwrap_or(0.0);
        let b: f64 = b.parse().unwrap_or(0.0);
        b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
    });
    versions.dedup();
    if versions.is_empty() {
        "-".to_owned()
    } else {
        versions.join("/")
    }
}

/// Hostname, driver version, and the per-GPU lines from gpustat output,
/// colors stripped and the timestamp dropped.
fn decode_gpustat(text: &str) -> Result<(String, String, String), DecodeError> {
    let clean = strip_ansi(text);
    let mut lines = clean.lines().filter(|line| !line.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| DecodeError::new("empty gpustat output"))?;
    let fields: Vec<&str> = header.split_whitespace().collect();
    let (Some(&hostname), Some(&driver)) = (fields.first(), fields.last()) else {
        return Err(DecodeError::new(format!(
            "unrecognized gpustat header: {header:?}"
        )));
    };
    let gpus = lines.collect::<Vec<_>>().join("\n");
    Ok((hostname.to_owned(), driver.to_owned(), gpus))
}
