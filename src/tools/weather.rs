use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolError, ToolResult, parse_input, with_timeout};
use crate::dual_info;

const WTTR_BASE_URL: &str = "https://wttr.in";

#[derive(Debug, Deserialize)]
struct WeatherInput {
    city: String,
}

/// One-line current conditions from wttr.in.
pub struct WeatherTool {
    client: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
}

impl WeatherTool {
    pub fn new(timeout_secs: u64) -> Self {
        Self::with_base_url(WTTR_BASE_URL, timeout_secs)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout_secs,
        }
    }

    fn url_for(&self, city: &str) -> String {
        format!(
            "{}/{}?format=3",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(city)
        )
    }

    async fn fetch(&self, city: &str) -> ToolResult<String> {
        let response = self
            .client
            .get(self.url_for(city))
            .send()
            .await
            .map_err(|_| ToolError::Unavailable(format!("could not retrieve weather for {city}")))?;

        if !response.status().is_success() {
            return Err(ToolError::Upstream {
                what: format!("weather service for {city}"),
                status: response.status().as_u16(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|_| ToolError::Unavailable(format!("could not retrieve weather for {city}")))?;

        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather for a given city."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "city": { "type": "string", "description": "City name" }
            },
            "required": ["city"]
        })
    }

    async fn execute(&self, input: Value) -> ToolResult<String> {
        let WeatherInput { city } = parse_input(input)?;
        let city = city.trim();
        if city.is_empty() {
            return Err(ToolError::InvalidInput("city is required".into()));
        }

        let weather = with_timeout(
            format!("weather lookup for {city}"),
            self.timeout_secs,
            self.fetch(city),
        )
        .await?;

        dual_info!("Weather for {}: {}", city, weather);
        Ok(weather)
    }
}
