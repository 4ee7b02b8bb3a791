use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolError, ToolResult, parse_input, with_timeout};
use crate::{config::ToolsConfig, dual_error, dual_info};

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("Invalid regex")
});

const USER_ENV: &str = "GMAIL_USER";
const PASSWORD_ENV: &str = "GMAIL_APP_PASSWORD";

#[derive(Debug, Deserialize)]
struct EmailInput {
    to_email: String,
    subject: String,
    message: String,
    #[serde(default)]
    cc_email: Option<String>,
}

/// Sends a plain-text email over SMTP. Port 465 uses implicit TLS, any other
/// port STARTTLS.
pub struct SendEmailTool {
    smtp_server: String,
    smtp_port: u16,
    username: Option<String>,
    password: Option<String>,
    timeout_secs: u64,
}

impl SendEmailTool {
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            smtp_server: config.email.smtp_server.clone(),
            smtp_port: config.email.smtp_port,
            username: config.email.username.clone(),
            password: config.email.password.clone(),
            timeout_secs: config.email_timeout_secs,
        }
    }

    /// Configured credentials win; otherwise `GMAIL_USER` / `GMAIL_APP_PASSWORD`.
    fn credentials(&self, lookup: impl Fn(&str) -> Option<String>) -> ToolResult<(String, String)> {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let user = non_blank(self.username.clone()).or_else(|| non_blank(lookup(USER_ENV)));
        let password =
            non_blank(self.password.clone()).or_else(|| non_blank(lookup(PASSWORD_ENV)));

        match (user, password) {
            (Some(user), Some(password)) => Ok((user, password)),
            _ => {
                dual_error!("Email credentials not found in configuration or environment");
                Err(ToolError::Unavailable("email credentials not configured".into()))
            }
        }
    }

    async fn send(&self, input: &EmailInput, user: String, password: String) -> ToolResult<String> {
        let message = build_message(&user, input)?;

        let transport = if self.smtp_port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.smtp_server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp_server)
        }
        .map_err(|e| ToolError::Unavailable(format!("smtp setup failed: {e}")))?
        .port(self.smtp_port)
        .credentials(Credentials::new(user, password))
        .build();

        transport.send(message).await.map_err(|e| {
            dual_error!("SMTP error: {}", e);
            if e.is_permanent() {
                ToolError::Unavailable("email authentication or delivery rejected".into())
            } else {
                ToolError::Unavailable("smtp error occurred".into())
            }
        })?;

        dual_info!("Email sent successfully to {}", input.to_email);
        Ok(format!("email sent successfully to {}", input.to_email))
    }
}

fn validate(input: &EmailInput) -> ToolResult<()> {
    if !EMAIL_REGEX.is_match(input.to_email.trim()) {
        return Err(ToolError::InvalidInput("invalid recipient email address".into()));
    }
    if let Some(cc) = input.cc_email.as_deref()
        && !cc.trim().is_empty()
        && !EMAIL_REGEX.is_match(cc.trim())
    {
        return Err(ToolError::InvalidInput("invalid cc email address".into()));
    }
    Ok(())
}

fn build_message(from: &str, input: &EmailInput) -> ToolResult<Message> {
    let mailbox = |addr: &str, what: &str| {
        addr.trim()
            .parse::<Mailbox>()
            .map_err(|e| ToolError::InvalidInput(format!("invalid {what} address: {e}")))
    };

    let mut builder = Message::builder()
        .from(mailbox(from, "sender")?)
        .to(mailbox(&input.to_email, "recipient")?)
        .subject(input.subject.as_str());

    if let Some(cc) = input.cc_email.as_deref()
        && !cc.trim().is_empty()
    {
        builder = builder.cc(mailbox(cc, "cc")?);
    }

    builder
        .header(ContentType::TEXT_PLAIN)
        .body(input.message.clone())
        .map_err(|e| ToolError::InvalidInput(format!("could not build email: {e}")))
}

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Send an email with recipient, subject and message, optionally CC'ing one more address."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to_email": { "type": "string", "description": "Recipient email address" },
                "subject": { "type": "string", "description": "Email subject line" },
                "message": { "type": "string", "description": "Email body content" },
                "cc_email": { "type": "string", "description": "Optional CC email address" }
            },
            "required": ["to_email", "subject", "message"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult<String> {
        let input: EmailInput = parse_input(input)?;
        validate(&input)?;

        let (user, password) = self.credentials(|name| std::env::var(name).ok())?;

        with_timeout("email sending", self.timeout_secs, self.send(&input, user, password)).await
    }
}
