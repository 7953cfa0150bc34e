use std::borrow::Cow;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use log::{debug, trace, warn, error};
use crate::config::{EndpointConfig, EndpointFlavor};
use crate::error::{truncate_chars, MAX_ERROR_BODY_CHARS};
use crate::request::RawCompletion;

// ===== Wire Types =====

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest<'a>
{   pub system_prompt: &'a str
  , pub user_prompt: &'a str
  , pub max_tokens: u32
  , pub temperature: f32
}

/// Submit body in the shape the configured flavor expects
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SubmitBody<'a>
{   Generic(SubmitRequest<'a>)
  , /// Positional arguments of the Gradio predict function
    Gradio
    {   data: (&'a str, &'a str, u32, f32)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse
{   #[serde(rename = "jobId", alias = "event_id", default)]
    pub job_id: Option<String>
}

/// One `data:` frame and the `event:` name announced before it
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame<'a>
{   pub event: Option<&'a str>
  , pub data: &'a str
}

// ===== HTTP Client =====

/// Talks to the remote endpoint over HTTP
pub struct HttpGenerationClient
{   config: EndpointConfig
  , http_client: reqwest::Client
}

impl HttpGenerationClient
{   pub fn new(config: EndpointConfig)
      -> crate::Result<Self>
    {   debug!(
          "Creating HttpGenerationClient for {} ({:?})",
          config.api_base, config.flavor
        );
        let http_client = reqwest::Client::builder()
          .connect_timeout(config.submit_timeout())
          .build()
          .map_err(|e| {
            error!("Cannot build HTTP client: {}", e);
            crate::Error::InvalidConfiguration(e.to_string())
          })?;
        Ok(HttpGenerationClient
        {   config
          , http_client
        })
    }

    pub fn config(&self) -> &EndpointConfig
    {   &self.config
    }

    fn submit_url(&self) -> String
    {   let base = self.config.api_base.trim_end_matches('/');
        match self.config.flavor
        {   EndpointFlavor::Generic => {
              format!("{}/generate/submit", base)
            }
          , EndpointFlavor::Gradio => {
              format!("{}/gradio_api/call/predict", base)
            }
        }
    }

    fn stream_url(&self, job_id: &str) -> String
    {   let base = self.config.api_base.trim_end_matches('/');
        match self.config.flavor
        {   EndpointFlavor::Generic => {
              format!("{}/generate/stream/{}", base, job_id)
            }
          , EndpointFlavor::Gradio => {
              format!("{}/gradio_api/call/predict/{}", base, job_id)
            }
        }
    }

    fn submit_body<'a>(
      &self
    , system_prompt: &'a str
    , user_prompt: &'a str
    , max_tokens: u32
    , temperature: f32
    ) -> SubmitBody<'a>
    {   match self.config.flavor
        {   EndpointFlavor::Generic => SubmitBody::Generic(SubmitRequest
            {   system_prompt
              , user_prompt
              , max_tokens
              , temperature
            })
          , EndpointFlavor::Gradio => SubmitBody::Gradio
            {   data: (system_prompt, user_prompt, max_tokens, temperature)
            }
        }
    }

    /// Append the stream body to `buffer` until a `complete` or `error`
    /// frame arrives or the endpoint closes the connection. Returns
    /// whether a terminal frame was seen.
    async fn read_stream(&self, job_id: &str, buffer: &mut Vec<u8>)
      -> crate::Result<bool>
    {   let mut response = self.http_client
          .get(self.stream_url(job_id))
          .header("Accept", "text/event-stream")
          .send()
          .await
          .map_err(|e| {
            error!("Stream request failed: {}", e);
            crate::Error::HttpError(e.to_string())
          })?;

        let status = response.status();
        trace!("Stream response status: {}", status);
        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_|
                "Unknown error".to_string()
              );
            error!("Stream for {} failed: {}", job_id, error_text);
            return Err(crate::Error::HttpError(format!(
              "stream status {}: {}",
              status.as_u16(),
              truncate_chars(&error_text, MAX_ERROR_BODY_CHARS)
            )));
        }

        while let Some(chunk) = response.chunk().await.map_err(|e| {
          error!("Stream read failed: {}", e);
          crate::Error::HttpError(e.to_string())
        })?
        {   buffer.extend_from_slice(&chunk);
            if has_terminal_event(&complete_lines(buffer))
            {   debug!("Terminal frame for {} received", job_id);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl crate::providers::GenerationBackend for HttpGenerationClient
{   async fn submit(
      &self
    , system_prompt: &str
    , user_prompt: &str
    , max_tokens: u32
    , temperature: f32
    ) -> crate::Result<String>
    {   let max_tokens = crate::providers::clamp_max_tokens(
          max_tokens,
          self.config.min_max_tokens,
          self.config.max_max_tokens
        );
        let temperature
          = crate::providers::check_temperature(temperature)?;
        let body = self.submit_body(
          system_prompt, user_prompt, max_tokens, temperature
        );
        debug!("Submitting to {}", self.submit_url());
        trace!("Submit body: {:?}", body);

        let response = self.http_client
          .post(self.submit_url())
          .timeout(self.config.submit_timeout())
          .json(&body)
          .send()
          .await
          .map_err(|e| {
            error!("Submit failed: {}", e);
            crate::Error::submission(None, &e.to_string())
          })?;

        let status = response.status();
        trace!("Submit response status: {}", status);

        if !status.is_success()
        {   let error_text = response.text().await
              .unwrap_or_else(|_|
                "Unknown error".to_string()
              );
            error!("Submit rejected ({}): {}", status, error_text);
            return Err(crate::Error::submission(
              Some(status.as_u16()),
              &error_text
            ));
        }

        let submitted: SubmitResponse
          = response.json().await.map_err(|e| {
            error!("Submit response parse error: {}", e);
            crate::Error::NoPayload(
              format!("unreadable submit response: {}", e)
            )
          })?;

        match submitted.job_id
        {   Some(id) if !id.is_empty() => {
              debug!("Submitted, job id {}", id);
              Ok(id)
            }
          , _ => {
              error!("Submit response carried no job id");
              Err(crate::Error::NoPayload(
                "submit response carried no job id".to_string()
              ))
            }
        }
    }

    async fn poll(
      &self
    , job_id: &str
    , timeout: Duration
    ) -> crate::Result<RawCompletion>
    {   debug!("Polling job {} for up to {:?}", job_id, timeout);
        let mut buffer: Vec<u8> = vec![];
        let outcome = tokio::time::timeout(
          timeout,
          self.read_stream(job_id, &mut buffer)
        ).await;
        let raw = match outcome
        {   Ok(Ok(true)) => complete_lines(&buffer).into_owned()
          , Ok(Ok(false)) => String::from_utf8_lossy(&buffer).into_owned()
          , Ok(Err(e)) => return Err(e)
          , Err(_) => {
              let received = complete_lines(&buffer).into_owned();
              if !has_terminal_event(&received)
              {   error!("Job {} timed out after {:?}", job_id, timeout);
                  return Err(crate::Error::PollTimeout
                  {   job_id: job_id.to_string()
                    , after: timeout
                  });
              }
              warn!("Job {} stream still open after {:?}", job_id, timeout);
              received
            }
        };
        trace!("Raw stream for {}: {}", job_id, raw);
        terminal_completion(&raw)
    }
}

// ===== Event Stream =====

/// Split a stream body into `data:` frames; other lines are ignored
pub fn stream_frames(raw: &str) -> Vec<StreamFrame<'_>>
{   let mut frames = vec![];
    let mut event: Option<&str> = None;
    for line in raw.lines()
    {   let line = line.trim();
        if line.is_empty()
        {   event = None;
        } else if let Some(name) = line.strip_prefix("event:")
        {   event = Some(name.trim());
        } else if let Some(data) = line.strip_prefix("data:")
        {   frames.push(StreamFrame
            {   event: event.take()
              , data: data.trim()
            });
        }
    }
    frames
}

/// Stream body up to its last line break; a frame cut mid-line is
/// left out
fn complete_lines(buffer: &[u8]) -> Cow<'_, str>
{   match buffer.iter().rposition(|b| *b == b'\n')
    {   Some(end) => String::from_utf8_lossy(&buffer[..=end])
      , None => Cow::Borrowed("")
    }
}

/// Whether the stream carries a `complete` or `error` frame
pub fn has_terminal_event(raw: &str) -> bool
{   stream_frames(raw)
      .iter()
      .any(|f| matches!(f.event, Some("complete") | Some("error")))
}

/// Completion text from the last non-heartbeat frame of a stream
pub fn terminal_completion(raw: &str) -> crate::Result<RawCompletion>
{   let frames = stream_frames(raw);
    let terminal = frames
      .iter()
      .rev()
      .find(|f| f.event != Some("heartbeat"))
      .ok_or_else(|| {
        error!("No data frame in stream");
        crate::Error::NoPayload("no data frame in stream".to_string())
      })?;

    if terminal.event == Some("error")
    {   error!("Endpoint reported error: {}", terminal.data);
        return Err(crate::Error::NoPayload(format!(
          "endpoint reported error: {}",
          truncate_chars(terminal.data, MAX_ERROR_BODY_CHARS)
        )));
    }

    let payload: Value = serde_json::from_str(terminal.data)
      .map_err(|_| {
        error!("Terminal frame is not JSON");
        crate::Error::NoPayload(format!(
          "terminal frame is not JSON: {}",
          truncate_chars(terminal.data, MAX_ERROR_BODY_CHARS)
        ))
      })?;

    match completion_text(&payload)
    {   Some(text) if !text.trim().is_empty() => Ok(text.to_string())
      , Some(_) => {
          error!("Terminal frame carried an empty completion");
          Err(crate::Error::NoPayload("empty completion".to_string()))
        }
      , None => {
          error!("Terminal payload has an unknown shape");
          Err(crate::Error::NoPayload(format!(
            "unknown payload shape: {}",
            truncate_chars(&payload.to_string(), MAX_ERROR_BODY_CHARS)
          )))
        }
    }
}

/// `[text, ..]`, `[[text, ..], ..]` or `{output: {data: [text, ..]}}`
pub fn completion_text(payload: &Value) -> Option<&str>
{   match payload
    {   Value::Array(items) => match items.first()
        {   Some(Value::String(text)) => Some(text.as_str())
          , Some(Value::Array(inner)) => inner.first()?.as_str()
          , _ => None
        }
      , Value::Object(_) => payload.pointer("/output/data/0")?.as_str()
      , _ => None
    }
}
