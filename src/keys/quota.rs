use crate::config::QuotaConfig;

/// Decides whether a provider error means "this credential is out of quota".
///
/// Provider error shapes differ, so both the status codes and the message
/// markers are configurable.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    status_codes: Vec<u16>,
    markers: Vec<String>,
}

impl QuotaPolicy {
    pub fn new(status_codes: Vec<u16>, markers: Vec<String>) -> Self {
        Self {
            status_codes,
            markers: markers
                .into_iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        Self::new(config.status_codes.clone(), config.markers.clone())
    }

    pub fn is_quota_error(&self, status: Option<u16>, message: &str) -> bool {
        if let Some(status) = status
            && self.status_codes.contains(&status)
        {
            return true;
        }

        let message = message.to_lowercase();
        self.markers.iter().any(|m| message.contains(m.as_str()))
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::from_config(&QuotaConfig::default())
    }
}
