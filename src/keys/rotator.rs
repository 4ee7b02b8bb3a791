use std::fmt;

use crate::{
    config::{KeysConfig, MAX_CREDENTIALS},
    dual_debug, dual_error, dual_info, dual_warn,
    keys::{FileIndexStore, IndexStore, KeyError, KeyResult},
};

/// An API key. `Debug` and `Display` never print the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First and last few characters, for status output.
    pub fn preview(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 12 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.preview())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.preview())
    }
}

/// Rotates through an ordered set of API credentials.
///
/// The cursor is persisted on every move so a restart resumes from the last
/// known-good credential. A rotation pass starts at construction and at every
/// [`KeyRotator::record_success`]; once every credential has been rotated away
/// from within one pass, [`KeyRotator::rotate`] reports exhaustion.
pub struct KeyRotator {
    credentials: Vec<Credential>,
    index: usize,
    rotations_in_pass: usize,
    store: Box<dyn IndexStore>,
}

impl KeyRotator {
    /// Build a rotator over `credentials`, resuming from the index held in `store`.
    ///
    /// An empty credential list is accepted here; [`KeyRotator::current`] will then
    /// report [`KeyError::NoCredentialsAvailable`].
    pub fn new(credentials: Vec<String>, store: Box<dyn IndexStore>) -> Self {
        let credentials: Vec<Credential> = credentials.into_iter().map(Credential::new).collect();
        let index = Self::load_index(store.as_ref(), credentials.len());

        Self {
            credentials,
            index,
            rotations_in_pass: 0,
            store,
        }
    }

    /// Startup constructor: credentials from configuration or environment,
    /// index persisted in the configured file.
    pub fn from_config(config: &KeysConfig) -> KeyResult<Self> {
        let credentials = collect_credentials(&config.credentials, &config.env_prefix, |name| {
            std::env::var(name).ok()
        });

        if credentials.is_empty() {
            dual_error!(
                "No API keys found. Expected {}1 .. {}{}",
                config.env_prefix,
                config.env_prefix,
                MAX_CREDENTIALS
            );
            return Err(KeyError::NoCredentialsAvailable);
        }

        let rotator = Self::new(
            credentials,
            Box::new(FileIndexStore::new(config.index_file.clone())),
        );

        dual_info!(
            "Key rotator initialized: {} keys available, using key #{}",
            rotator.len(),
            rotator.index() + 1
        );

        Ok(rotator)
    }

    fn load_index(store: &dyn IndexStore, total: usize) -> usize {
        match store.load() {
            Ok(Some(index)) if index < total => {
                dual_debug!("Loaded key index {} from {}", index, store.location());
                index
            }
            Ok(Some(index)) => {
                dual_warn!(
                    "Invalid key index {} in {} ({} keys), resetting to 0",
                    index,
                    store.location(),
                    total
                );
                0
            }
            Ok(None) => {
                dual_debug!("No key index at {}, starting at key 0", store.location());
                0
            }
            Err(e) => {
                dual_warn!(
                    "Failed to load key index from {}: {}. Defaulting to 0",
                    store.location(),
                    e
                );
                0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Zero-based position of the active credential.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> KeyResult<&Credential> {
        self.credentials
            .get(self.index)
            .ok_or(KeyError::NoCredentialsAvailable)
    }

    /// Advance to the next credential and persist the new index.
    ///
    /// # Errors
    /// * `KeyError::NoCredentialsAvailable` - the set is empty
    /// * `KeyError::AllCredentialsExhausted` - every credential has already been
    ///   rotated through since the last successful use; the cursor is left as is
    pub fn rotate(&mut self) -> KeyResult<&Credential> {
        let total = self.credentials.len();
        if total == 0 {
            return Err(KeyError::NoCredentialsAvailable);
        }

        if self.rotations_in_pass >= total {
            dual_error!(
                "All {} API keys have been cycled without a successful call",
                total
            );
            return Err(KeyError::AllCredentialsExhausted { total });
        }

        let previous = self.index;
        self.index = (self.index + 1) % total;
        self.rotations_in_pass += 1;
        self.persist();

        dual_warn!(
            "Advanced from key #{} to key #{} ({}/{} rotations this pass)",
            previous + 1,
            self.index + 1,
            self.rotations_in_pass,
            total
        );

        Ok(&self.credentials[self.index])
    }

    /// The active credential worked; start a fresh rotation pass from here.
    pub fn record_success(&mut self) {
        self.rotations_in_pass = 0;
    }

    /// Go back to the first credential, e.g. when a new quota period starts.
    pub fn reset(&mut self) {
        self.index = 0;
        self.rotations_in_pass = 0;
        self.persist();
        dual_info!("Reset to first key (key #1)");
    }

    pub fn status(&self) -> KeyStatus {
        KeyStatus {
            total: self.credentials.len(),
            index: self.index,
            location: self.store.location(),
            previews: self.credentials.iter().map(Credential::preview).collect(),
        }
    }

    // Best effort: the in-memory cursor stays authoritative for this process.
    fn persist(&self) {
        match self.store.save(self.index) {
            Ok(()) => dual_debug!("Saved key index {} to {}", self.index, self.store.location()),
            Err(e) => dual_error!(
                "Failed to save key index {} to {}: {}",
                self.index,
                self.store.location(),
                e
            ),
        }
    }
}

/// Snapshot of the rotator for the `keys status` command.
#[derive(Debug, Clone)]
pub struct KeyStatus {
    pub total: usize,
    pub index: usize,
    pub location: String,
    pub previews: Vec<String>,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Key Rotator Status:")?;
        writeln!(f, "  Total keys: {}", self.total)?;
        if self.total > 0 {
            writeln!(
                f,
                "  Current key: #{} (index {})",
                self.index + 1,
                self.index
            )?;
        }
        writeln!(f, "  Index file: {}", self.location)?;
        for (i, preview) in self.previews.iter().enumerate() {
            let marker = if i == self.index { "  <- active" } else { "" };
            writeln!(f, "  Key #{}: {}{}", i + 1, preview, marker)?;
        }
        Ok(())
    }
}

/// Explicit credentials win over the environment; either way at most
/// five non-blank values are taken, in priority order.
fn collect_credentials(
    explicit: &[String],
    env_prefix: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<String> {
    let non_blank = |value: &String| {
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    };

    if !explicit.is_empty() {
        return explicit
            .iter()
            .filter_map(non_blank)
            .take(MAX_CREDENTIALS)
            .collect();
    }

    (1..=MAX_CREDENTIALS)
        .filter_map(|i| {
            let name = format!("{env_prefix}{i}");
            match lookup(&name).as_ref().and_then(non_blank) {
                Some(value) => {
                    dual_debug!("Loaded {}", name);
                    Some(value)
                }
                None => {
                    dual_debug!("{} not found or empty", name);
                    None
                }
            }
        })
        .collect()
}
