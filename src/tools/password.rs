use std::{
    collections::BTreeSet,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::OsRng, seq::SliceRandom};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolError, ToolResult, parse_input};
use crate::{dual_error, dual_info};

const MAX_LENGTH: usize = 1024;

const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

fn named_class(name: &str) -> Option<String> {
    let pool = match name {
        "upper" => UPPER.to_string(),
        "lower" => LOWER.to_string(),
        "digits" => DIGITS.to_string(),
        "symbols" => SYMBOLS.to_string(),
        "ascii" => format!("{UPPER}{LOWER}{DIGITS}"),
        "all" => format!("{UPPER}{LOWER}{DIGITS}{SYMBOLS}"),
        _ => return None,
    };
    Some(pool)
}

fn default_length() -> i64 {
    16
}

#[derive(Debug, Deserialize)]
struct PasswordInput {
    #[serde(default = "default_length")]
    length: i64,
    #[serde(default)]
    charset: String,
    #[serde(default)]
    enforce_classes: bool,
    #[serde(default)]
    save: bool,
}

/// Where the characters come from.
#[derive(Debug, Clone, PartialEq)]
enum Alphabet {
    /// Named classes, in the order given; each entry is (name, pool)
    Classes(Vec<(String, Vec<char>)>),
    /// Literal characters, deduplicated and sorted
    Literal(Vec<char>),
}

impl Alphabet {
    /// Comma-separated names when every part is a known class, otherwise the
    /// string itself is the alphabet. Empty means upper, lower, digits and symbols.
    fn parse(charset: &str) -> ToolResult<Self> {
        let charset_trimmed = charset.trim();
        let names: Vec<String> = if charset_trimmed.is_empty() {
            ["upper", "lower", "digits", "symbols"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            charset_trimmed
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };

        if !names.is_empty() && names.iter().all(|n| named_class(n).is_some()) {
            let mut classes: Vec<(String, Vec<char>)> = Vec::new();
            for name in names {
                if classes.iter().any(|(n, _)| *n == name) {
                    continue;
                }
                let pool = named_class(&name).unwrap_or_default().chars().collect();
                classes.push((name, pool));
            }
            return Ok(Alphabet::Classes(classes));
        }

        let literal: Vec<char> = charset.chars().collect::<BTreeSet<_>>().into_iter().collect();
        if literal.is_empty() {
            return Err(ToolError::InvalidInput(
                "provided charset resulted in empty character set".into(),
            ));
        }
        Ok(Alphabet::Literal(literal))
    }

    fn available(&self) -> Vec<char> {
        match self {
            Alphabet::Classes(classes) => classes
                .iter()
                .flat_map(|(_, pool)| pool.iter().copied())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            Alphabet::Literal(chars) => chars.clone(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Alphabet::Classes(classes) => classes
                .iter()
                .map(|(n, _)| n.as_str())
                .collect::<Vec<_>>()
                .join(","),
            Alphabet::Literal(chars) => format!("{:?}", chars.iter().collect::<String>()),
        }
    }
}

/// Generate a password of `length` characters. With `enforce_classes` and
/// named classes, every class contributes at least one character.
fn generate(length: usize, alphabet: &Alphabet, enforce_classes: bool) -> ToolResult<String> {
    let available = alphabet.available();
    if available.is_empty() {
        return Err(ToolError::InvalidInput(
            "no characters available for password generation".into(),
        ));
    }

    let mut rng = OsRng;
    let mut chars: Vec<char> = Vec::with_capacity(length);

    if enforce_classes && let Alphabet::Classes(classes) = alphabet {
        if length < classes.len() {
            return Err(ToolError::InvalidInput(format!(
                "length {length} too small to include {} required character classes",
                classes.len()
            )));
        }
        for (_, pool) in classes {
            if let Some(c) = pool.choose(&mut rng) {
                chars.push(*c);
            }
        }
    }

    while chars.len() < length {
        if let Some(c) = available.choose(&mut rng) {
            chars.push(*c);
        }
    }

    chars.shuffle(&mut rng);
    Ok(chars.into_iter().collect())
}

pub struct GeneratePasswordTool {
    password_file: PathBuf,
}

impl GeneratePasswordTool {
    pub fn new(password_file: impl AsRef<Path>) -> Self {
        Self {
            password_file: password_file.as_ref().to_path_buf(),
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.password_file.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.password_file)?;
        writeln!(file, "{line}")
    }
}

#[async_trait]
impl Tool for GeneratePasswordTool {
    fn name(&self) -> &str {
        "generate_password"
    }

    fn description(&self) -> &str {
        "Generate a secure random password. The charset is either a comma-separated list of \
         classes (upper, lower, digits, symbols, ascii, all) or a literal string of characters."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "length": { "type": "integer", "default": 16, "minimum": 1, "maximum": MAX_LENGTH },
                "charset": { "type": "string", "default": "" },
                "enforce_classes": { "type": "boolean", "default": false },
                "save": {
                    "type": "boolean",
                    "default": false,
                    "description": "Append the password to a plaintext file"
                }
            }
        })
    }

    async fn execute(&self, input: Value) -> ToolResult<String> {
        let input: PasswordInput = parse_input(input)?;
        let length = match usize::try_from(input.length) {
            Ok(0) | Err(_) => {
                return Err(ToolError::InvalidInput(
                    "length must be a positive integer".into(),
                ));
            }
            Ok(length) if length > MAX_LENGTH => {
                return Err(ToolError::InvalidInput(format!(
                    "length must be at most {MAX_LENGTH}"
                )));
            }
            Ok(length) => length,
        };

        let alphabet = Alphabet::parse(&input.charset)?;
        let password = generate(length, &alphabet, input.enforce_classes)?;

        if input.save {
            let line = format!(
                "{}\tlength={}\tenforce_classes={}\tcharset={}\tpassword={}",
                Utc::now().to_rfc3339(),
                length,
                input.enforce_classes,
                alphabet.describe(),
                password
            );
            match self.append(&line) {
                Ok(()) => dual_info!(
                    "Password saved to {}",
                    self.password_file.display()
                ),
                Err(e) => dual_error!(
                    "Failed to write password to {}: {}",
                    self.password_file.display(),
                    e
                ),
            }
        }

        Ok(password)
    }
}
