use std::{fmt, fs, path::Path, time::Duration};

use anyhow::Context;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::error::MapError;

pub const API_KEY_ENV_VAR: &str = "OPENAI_API_KEY";

pub const DEFAULT_PROMPT: &str = "Analyze the health data map visualization and provide specific, actionable recommendations for improvement:

Converting yellow regions to green: Suggest targeted interventions or programs to enhance health outcomes in these regions.
Improving red regions to orange: Propose immediate, practical actions to address the most critical health challenges in these areas.
Moving orange regions to yellow: Recommend strategies for gradual and sustainable improvements in these regions.
Consider geographic clusters, regional patterns, and potential correlations between areas. Incorporate recent government interventions at the state level into your analysis, identifying how they can be optimized or expanded. Ensure the response is concise (200 words) and focused on practical solutions.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NarrationConfig {
    /// Chat-completions endpoint of the inference service.
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Image detail level requested from the vision model.
    pub detail: String,
    /// Replaces `DEFAULT_PROMPT` when set.
    pub prompt: Option<String>,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 500,
            timeout_secs: 60,
            detail: "high".to_string(),
            prompt: None,
        }
    }
}

impl NarrationConfig {
    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }
}

/// Credential for the inference service. Never printed.
#[derive(Clone)]
pub struct ApiKey(String);

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_env() -> Result<Self, MapError> {
        Self::from_env_var(API_KEY_ENV_VAR)
    }

    /// Read the key from `variable`. An empty value counts as missing.
    pub fn from_env_var(variable: &str) -> Result<Self, MapError> {
        match std::env::var(variable) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key.trim())),
            _ => Err(MapError::MissingCredential {
                variable: variable.to_string(),
            }),
        }
    }
}

/// Body of a chat-completions request with one user message holding the prompt and the image.
pub fn build_chat_request(prompt: &str, jpeg: &[u8], config: &NarrationConfig) -> serde_json::Value {
    let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
    json!({
        "model": config.model,
        "messages": [
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:image/jpeg;base64,{}", encoded),
                            "detail": config.detail,
                        }
                    }
                ]
            }
        ],
        "max_tokens": config.max_tokens,
    })
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ServiceErrorResponse {
    error: ServiceError,
}

#[derive(Deserialize)]
struct ServiceError {
    message: String,
}

/// Extract the answer text from a chat-completions response body.
pub fn parse_chat_response(body: &str) -> anyhow::Result<String> {
    if let Ok(error_response) = serde_json::from_str::<ServiceErrorResponse>(body) {
        return Err(MapError::Narration(error_response.error.message).into());
    }
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|err| MapError::Narration(format!("unexpected response from service, {}", err)))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| MapError::Narration("the service returned no answer".to_string()).into())
}

/// Sends rendered maps to the inference service. Rendering does not depend on it: without a
/// credential it can still be constructed, and only `narrate` fails.
#[derive(Debug)]
pub struct Narrator {
    api_key: Option<ApiKey>,
    config: NarrationConfig,
}

impl Narrator {
    pub fn new(api_key: Option<ApiKey>, config: NarrationConfig) -> Self {
        Self { api_key, config }
    }

    pub fn from_env(config: NarrationConfig) -> Self {
        let api_key = match ApiKey::from_env() {
            Ok(api_key) => Some(api_key),
            Err(err) => {
                log::debug!("{}", err);
                None
            }
        };
        Self::new(api_key, config)
    }

    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Ask the inference service to analyze the JPEG image at `image_path` and return its answer verbatim.
    pub fn narrate(&self, image_path: &Path) -> anyhow::Result<String> {
        let api_key = self.api_key.as_ref().ok_or_else(|| MapError::MissingCredential {
            variable: API_KEY_ENV_VAR.to_string(),
        })?;
        let jpeg = fs::read(image_path)
            .with_context(|| format!("Reading rendered map {:?}", image_path))?;
        let body = build_chat_request(self.config.prompt(), &jpeg, &self.config);

        log::info!(
            "Requesting map analysis from {} with model {}",
            self.config.endpoint,
            self.config.model
        );
        let client = reqwest::blocking::Client::builder()
            .user_agent("choropleth-rust")
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;
        let response = client
            .post(&self.config.endpoint)
            .bearer_auth(&api_key.0)
            .json(&body)
            .send()
            .map_err(|err| MapError::Narration(format!("request failed, {}", err)))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|err| MapError::Narration(format!("reading response, {}", err)))?;
        match parse_chat_response(&text) {
            Ok(answer) => Ok(answer),
            Err(err) if status.is_success() => Err(err),
            Err(err) => Err(err.context(format!("Inference service responded with {}", status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::TcpListener,
    };

    use base64::Engine;
    use testdir::testdir;

    use crate::error::{ErrorKind, MapError};

    use super::{
        build_chat_request, parse_chat_response, ApiKey, NarrationConfig, Narrator,
        DEFAULT_PROMPT,
    };

    #[test]
    fn test_build_chat_request() {
        let config = NarrationConfig::default();
        let body = build_chat_request(DEFAULT_PROMPT, b"jpeg bytes", &config);

        assert_eq!("gpt-4o-mini", body["model"]);
        assert_eq!(500, body["max_tokens"]);
        let content = &body["messages"][0]["content"];
        assert_eq!("user", body["messages"][0]["role"]);
        assert_eq!(DEFAULT_PROMPT, content[0]["text"]);
        assert_eq!("high", content[1]["image_url"]["detail"]);

        let url = content[1]["image_url"]["url"].as_str().unwrap();
        let encoded = url.strip_prefix("data:image/jpeg;base64,").unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(b"jpeg bytes".to_vec(), decoded);
    }

    #[test]
    fn test_parse_chat_response() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "Focus on the red regions."}}]}"#;
        assert_eq!("Focus on the red regions.", parse_chat_response(body).unwrap());
    }

    #[test]
    fn test_parse_service_error() {
        let body = r#"{"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}}"#;
        let err = parse_chat_response(body).unwrap_err();
        let map_error = err.downcast_ref::<MapError>().unwrap();
        assert_eq!(ErrorKind::Narration, map_error.kind());
        assert!(map_error.to_string().contains("Incorrect API key provided"));
    }

    #[test]
    fn test_parse_empty_choices() {
        assert!(parse_chat_response(r#"{"choices": []}"#).is_err());
        assert!(parse_chat_response("<html>bad gateway</html>").is_err());
    }

    #[test]
    fn test_missing_credential() {
        let result = ApiKey::from_env_var("CHOROPLETH_RUST_TEST_UNSET_API_KEY");
        assert!(matches!(result, Err(MapError::MissingCredential { .. })));
    }

    #[test]
    fn test_narrate_without_credential_is_configuration_error() {
        let image_path = testdir!().join("map.jpg");
        std::fs::write(&image_path, b"jpeg bytes").unwrap();

        let narrator = Narrator::new(None, NarrationConfig::default());
        assert!(!narrator.is_available());
        let err = narrator.narrate(&image_path).unwrap_err();
        let map_error = err.downcast_ref::<MapError>().unwrap();
        assert_eq!(ErrorKind::Configuration, map_error.kind());
    }

    #[test]
    fn test_api_key_is_redacted() {
        let key = ApiKey::new("sk-secret");
        assert!(!format!("{:?}", key).contains("sk-secret"));
    }

    #[test]
    fn test_config_from_yaml_keeps_defaults() {
        let config: NarrationConfig = serde_yaml::from_str("model: gpt-4o\ntimeout_secs: 5").unwrap();
        assert_eq!("gpt-4o", config.model);
        assert_eq!(5, config.timeout_secs);
        assert_eq!(500, config.max_tokens);
        assert_eq!(DEFAULT_PROMPT, config.prompt());
    }

    /// Serve one request, answering with a body shorter than its announced length.
    fn serve_truncated_response(listener: TcpListener) {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line == "\r\n" || line.is_empty() {
                break;
            }
            if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                content_length = value.trim().parse().unwrap();
            }
        }
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"choices\"")
            .unwrap();
    }

    #[test]
    fn test_truncated_response_is_narration_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        std::thread::spawn(move || serve_truncated_response(listener));

        let image_path = testdir!().join("map.jpg");
        std::fs::write(&image_path, b"jpeg bytes").unwrap();
        let narrator = Narrator::new(
            Some(ApiKey::new("sk-test")),
            NarrationConfig {
                endpoint: format!("http://{}/v1/chat/completions", address),
                timeout_secs: 10,
                ..NarrationConfig::default()
            },
        );
        assert!(narrator.is_available());

        let err = narrator.narrate(&image_path).unwrap_err();
        let map_error = err.downcast_ref::<MapError>().unwrap();
        assert_eq!(ErrorKind::Narration, map_error.kind());
    }
}
