use crate::configuration::{Configuration, PersistedConfig};
use crate::errors::ConfigError;
use embedded_hal::delay::DelayNs;

/// Interactive configuration step run at the start of a cycle.
///
/// Returns the document the operator submitted, or `None` when nothing was
/// changed. Blocking waits go through `delay` so the watchdog stays fed.
pub trait Provisioner {
    fn provision(
        &mut self,
        current: &Configuration,
        delay: &mut dyn DelayNs,
    ) -> anyhow::Result<Option<PersistedConfig>>;
}

pub struct NoProvisioning;

impl Provisioner for NoProvisioning {
    fn provision(
        &mut self,
        _current: &Configuration,
        _delay: &mut dyn DelayNs,
    ) -> anyhow::Result<Option<PersistedConfig>> {
        Ok(None)
    }
}

/// Parses a submitted document and validates it against `current`. The
/// document is returned unchanged when every field it sets is acceptable.
pub fn review_submission(
    current: &Configuration,
    body: &[u8],
) -> Result<PersistedConfig, ConfigError> {
    let doc: PersistedConfig = serde_json::from_slice(body)?;
    current.merged(&doc)?;
    Ok(doc)
}
