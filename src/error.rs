use std::fmt;
use std::time::Duration;

/// Longest response body kept in a `Submission` error
pub const MAX_ERROR_BODY_CHARS: usize = 300;

/// Custom error type for plan generation
/// Implements Clone for sending through channels
#[derive(Debug, Clone, PartialEq)]
pub enum Error
{   /// Endpoint rejected a submit call.
    /// `status` is None when the request never got a response.
    Submission
    {   status: Option<u16>
      , body: String
    }
  , /// No terminal event arrived before the poll timeout
    PollTimeout
    {   job_id: String
      , after: Duration
    }
  , /// Terminal event missing, empty or of an unknown shape
    NoPayload(String)
  , /// Completion text could not be turned into a JSON document
    Extraction
    {   reason: String
      , sample: String
    }
  , /// Transport failure outside of submit
    HttpError(String)
  , /// A call parameter the endpoint would reject
    InvalidParameter(String)
  , /// A malformed GenerationRequest
    InvalidRequest(String)
  , /// Invalid configuration
    InvalidConfiguration(String)
  , /// Work abandoned because the orchestration deadline elapsed
    Cancelled
  , /// Generic error
    Other(String)
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error
{   /// Build a submission error, keeping only the head of the body
    pub fn submission(status: Option<u16>, body: &str) -> Self
    {   Error::Submission
        {   status
          , body: truncate_chars(body, MAX_ERROR_BODY_CHARS)
        }
    }

    /// Build an extraction error carrying a short sample of the text
    pub fn extraction(reason: &str, text: &str) -> Self
    {   Error::Extraction
        {   reason: reason.to_string()
          , sample: truncate_chars(text, MAX_ERROR_BODY_CHARS)
        }
    }

    /// Whether a fresh attempt has a chance of succeeding
    pub fn is_retryable(&self) -> bool
    {   match self
        {   Error::Submission { status: None, .. } => true
          , Error::Submission { status: Some(code), .. } => {
              *code >= 500 || *code == 408 || *code == 429
            }
          , Error::PollTimeout { .. }
          | Error::NoPayload(_)
          | Error::Extraction { .. }
          | Error::HttpError(_) => true
          , Error::InvalidParameter(_)
          | Error::InvalidRequest(_)
          | Error::InvalidConfiguration(_)
          | Error::Cancelled
          | Error::Other(_) => false
        }
    }
}

impl fmt::Display for Error
{   fn fmt(&self, f: &mut fmt::Formatter<'_>)
      -> fmt::Result
    {   match self
        {   Error::Submission { status: Some(code), body } => {
              write!(f, "Submission rejected ({}): {}", code, body)
            }
          , Error::Submission { status: None, body } => {
              write!(f, "Submission failed: {}", body)
            }
          , Error::PollTimeout { job_id, after } => {
              write!(f,
                "No terminal event for job {} after {:?}",
                job_id, after
              )
            }
          , Error::NoPayload(msg) => {
              write!(f, "No payload in terminal event: {}", msg)
            }
          , Error::Extraction { reason, sample } => {
              write!(f,
                "Extraction failed ({}): {}",
                reason, sample
              )
            }
          , Error::HttpError(msg) => {
              write!(f, "HTTP error: {}", msg)
            }
          , Error::InvalidParameter(msg) => {
              write!(f, "Invalid parameter: {}", msg)
            }
          , Error::InvalidRequest(msg) => {
              write!(f, "Invalid request: {}", msg)
            }
          , Error::InvalidConfiguration(msg) => {
              write!(f, "Invalid configuration: {}", msg)
            }
          , Error::Cancelled => {
              write!(f, "Cancelled at orchestration deadline")
            }
          , Error::Other(msg) => {
              write!(f, "Error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error
{   fn from(s: String) -> Self
    {   Error::Other(s)
    }
}

impl From<&str> for Error
{   fn from(s: &str) -> Self
    {   Error::Other(s.to_string())
    }
}

impl From<reqwest::Error> for Error
{   fn from(e: reqwest::Error) -> Self
    {   Error::HttpError(e.to_string())
    }
}

/// First `max` characters of `text`, on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> String
{   text.chars().take(max).collect()
}
