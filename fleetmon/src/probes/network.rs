//! Per-interface bandwidth probe, sampled over the host's ssh transport.

use bundle_codec::{CommandBundle, SectionMap};

use crate::poll::{DecodeError, SourceDecoder};
use crate::utils::{kb_to_mbit, max_kb_rates};

/// Build the sampling bundle from the configured `sar` template.
pub fn bundle(template: &str, interface: &str, sample_secs: u64) -> CommandBundle {
    let command = template
        .replace("{interface}", interface)
        .replace("{duration}", &sample_secs.to_string());
    CommandBundle::new().with("NET", command)
}

/// Renders the sampled rates as `up X Mb/s  down Y Mb/s`.
///
/// The section holds `rxkB/s txkB/s` pairs, one per matching average row;
/// the busiest value of each direction wins, and kB/s becomes Mb/s.
pub struct NetworkDecoder;

impl SourceDecoder for NetworkDecoder {
    fn decode(&self, sections: &SectionMap) -> Result<String, DecodeError> {
        let text = sections
            .get("NET")
            .ok_or_else(|| DecodeError::new("missing section NET"))?;

        let (down_kb, up_kb) = max_kb_rates(text).ok_or_else(|| {
            DecodeError::new(format!("no rate samples in section NET: {text:?}"))
        })?;

        Ok(format!(
            "up {:.1} Mb/s  down {:.1} Mb/s",
            kb_to_mbit(up_kb),
            kb_to_mbit(down_kb)
        ))
    }
}
