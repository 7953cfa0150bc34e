//! Recovers a JSON document from model output.
//!
//! Model output frequently arrives wrapped in markdown fences, with
//! prose before or after the payload, with units glued to numbers
//! (`"carbs": 25g`) or cut off mid-document. Extraction runs a fixed
//! sequence of repairs:
//!
//! 1. strip code-fence markers
//! 2. drop alphabetic unit suffixes that follow a numeric value outside
//!    string literals
//! 3. take the text between the first `{` and the last `}`
//! 4. parse it; on failure retry without trailing commas, then retry
//!    with a truncated document closed off
//! 5. report which expected keys hold a non-empty array or object
//!
//! Extraction never assumes a key is present. Callers get the recovered
//! keys and the missing ones and decide what a partial result is worth.

use std::sync::OnceLock;
use regex::Regex;
use serde_json::{Map, Number, Value};
use log::{debug, trace, warn, error};
use crate::request::ParsedSlotResult;

/// Fields whose string values are coerced to plain numbers
pub const DEFAULT_NUMERIC_FIELDS: &[&str] = &[
  "calories",
  "carbs",
  "protein",
  "fat",
  "fiber",
  "total_calories",
  "duration_min",
  "calories_burned",
];

fn fence_re() -> &'static Regex
{   static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
      Regex::new(r"```[A-Za-z0-9_+-]*").expect("valid fence regex")
    })
}

fn unit_suffix_re() -> &'static Regex
{   static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
      Regex::new(r"-?\d+(?:\.\d+)?([ \t]*[A-Za-z%]+)")
        .expect("valid unit suffix regex")
    })
}

fn trailing_comma_re() -> &'static Regex
{   static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
      Regex::new(r",(\s*[}\]])").expect("valid trailing comma regex")
    })
}

fn number_with_unit_re() -> &'static Regex
{   static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
      Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*[A-Za-z%]*\s*$")
        .expect("valid numeric string regex")
    })
}

/// Remove every ``` marker, with or without a language tag
pub fn strip_fences(text: &str) -> String
{   fence_re().replace_all(text, "").into_owned()
}

/// `"carbs": 25g` -> `"carbs": 25`, `"calories": 100 kcal` -> `100`,
/// `[25g, 30g]` -> `[25, 30]`. Only values outside string literals are
/// touched. Idempotent: bare numbers are left alone.
pub fn strip_unit_suffixes(text: &str) -> String
{   let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for (start, end) in outside_strings(text)
    {   for caps in unit_suffix_re().captures_iter(&text[start..end])
        {   let (number, unit) = match (caps.get(0), caps.get(1))
            {   (Some(number), Some(unit)) => (number, unit)
              , _ => continue
            };
            if !is_value_position(text, start + number.start(), start + unit.end())
            {   continue;
            }
            out.push_str(&text[copied..start + unit.start()]);
            copied = start + unit.end();
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// Byte ranges of `text` that lie outside string literals
fn outside_strings(text: &str) -> Vec<(usize, usize)>
{   let mut ranges = vec![];
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices()
    {   if !in_string
        {   if c == '"'
            {   ranges.push((start, i));
                in_string = true;
            }
        } else if escaped
        {   escaped = false;
        } else if c == '\\'
        {   escaped = true;
        } else if c == '"'
        {   in_string = false;
            start = i + 1;
        }
    }
    if !in_string
    {   ranges.push((start, text.len()));
    }
    ranges
}

/// A number sits where a value goes: after `:`, `[` or `,` and before
/// `,`, `}`, `]`, a line break or the end of the text
fn is_value_position(text: &str, number_start: usize, unit_end: usize) -> bool
{   let before = text[..number_start].trim_end().chars().last();
    let after = text[unit_end..].trim_start_matches([' ', '\t']).chars().next();
    matches!(before, Some(':') | Some('[') | Some(','))
      && matches!(
        after,
        None | Some(',') | Some('}') | Some(']') | Some('\r') | Some('\n')
      )
}

/// Drop commas directly before a closing brace or bracket
pub fn remove_trailing_commas(text: &str) -> String
{   trailing_comma_re().replace_all(text, "${1}").into_owned()
}

/// Text from the first `{` to the last `}`, inclusive
pub fn outermost_object(text: &str) -> Option<&str>
{   let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start
    {   return None;
    }
    Some(&text[start..=end])
}

/// Close a document that was cut off: terminate an open string, drop
/// a dangling comma and close open arrays and objects in stack order.
/// Scanning stops once the first object is complete.
pub fn close_truncated(text: &str) -> String
{   scan_first_object(text).0
}

/// The first object in `text`, closed off if needed, and whether the
/// text ended while that object was still open
fn scan_first_object(text: &str) -> (String, bool)
{   let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = vec![];
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars()
    {   out.push(c);
        if in_string
        {   if escaped
            {   escaped = false;
            } else if c == '\\'
            {   escaped = true;
            } else if c == '"'
            {   in_string = false;
            }
            continue;
        }
        match c
        {   '"' => in_string = true
          , '{' => stack.push('}')
          , '[' => stack.push(']')
          , '}' | ']' => {
              stack.pop();
              if stack.is_empty()
              {   return (out, false);
              }
            }
          , _ => {}
        }
    }

    if in_string
    {   if escaped
        {   out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',')
    {   out.pop();
    } else if out.ends_with(':')
    {   out.push_str("null");
    }
    let truncated = !stack.is_empty() || in_string;
    while let Some(closer) = stack.pop()
    {   out.push(closer);
    }
    (out, truncated)
}

/// Turns raw completion text into a validated ParsedSlotResult
#[derive(Debug, Clone)]
pub struct ResponseExtractor
{   numeric_fields: Vec<String>
}

impl Default for ResponseExtractor
{   fn default() -> Self
    {   ResponseExtractor
        {   numeric_fields: DEFAULT_NUMERIC_FIELDS
              .iter()
              .map(|f| f.to_string())
              .collect()
        }
    }
}

impl ResponseExtractor
{   pub fn new() -> Self
    {   ResponseExtractor::default()
    }

    /// Replace the set of fields coerced to numbers
    pub fn with_numeric_fields(mut self, fields: &[&str]) -> Self
    {   self.numeric_fields
          = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Recover the JSON object in `raw` and check it for `expected_keys`
    pub fn extract<S: AsRef<str>>(
      &self
    , raw: &str
    , expected_keys: &[S]
    ) -> crate::Result<ParsedSlotResult>
    {   debug!(
          "Extracting {} expected keys from {} chars",
          expected_keys.len(), raw.len()
        );
        let cleaned = strip_unit_suffixes(&strip_fences(raw));
        let (document, repaired_truncation) = parse_document(&cleaned)?;

        let mut result = ParsedSlotResult
        {   repaired_truncation
          , ..ParsedSlotResult::default()
        };

        let mut remaining: Map<String, Value> = document;
        for key in expected_keys
        {   let key = key.as_ref();
            match remaining.remove(key)
            {   Some(mut value) if is_filled(&value) => {
                  self.coerce_numbers(&mut value);
                  result.slots.insert(key.to_string(), value);
                }
              , Some(_) => {
                  warn!("Key {} present but empty", key);
                  result.missing_keys.push(key.to_string());
                }
              , None => {
                  warn!("Key {} absent", key);
                  result.missing_keys.push(key.to_string());
                }
            }
        }
        result.extras = remaining;

        debug!(
          "Recovered {:?}, missing {:?}",
          result.slots.keys().collect::<Vec<_>>(),
          result.missing_keys
        );
        Ok(result)
    }

    fn coerce_numbers(&self, value: &mut Value)
    {   match value
        {   Value::Object(map) => {
              for (key, child) in map.iter_mut()
              {   if child.is_string()
                  {   if self.numeric_fields.iter().any(|f| f == key)
                      {   if let Some(n) = child.as_str().and_then(leading_number)
                          {   trace!("Coerced {} to {}", key, n);
                              *child = Value::Number(n);
                          }
                      }
                      continue;
                  }
                  self.coerce_numbers(child);
              }
            }
          , Value::Array(items) => {
              for child in items.iter_mut()
              {   self.coerce_numbers(child);
              }
            }
          , _ => {}
        }
    }
}

/// Parse the cleaned text, escalating through the repairs.
/// Returns the object and whether truncation repair was needed.
fn parse_document(cleaned: &str)
  -> crate::Result<(Map<String, Value>, bool)>
{   let start = match cleaned.find('{')
    {   Some(i) => i
      , None => {
          error!("No JSON object in response");
          return Err(crate::Error::extraction("no_json_object", cleaned));
        }
    };

    if let Some(candidate) = outermost_object(cleaned)
    {   if let Some(map) = parse_object(candidate)
        {   return Ok((map, false));
        }
        let without_commas = remove_trailing_commas(candidate);
        if let Some(map) = parse_object(&without_commas)
        {   debug!("Parsed after removing trailing commas");
            return Ok((map, false));
        }
    }

    let (first, truncated) = scan_first_object(&cleaned[start..]);
    if let Some(map) = parse_object(&remove_trailing_commas(&first))
    {   if truncated
        {   warn!("Response was truncated; recovered by closing the document");
        } else
        {   debug!("Parsed the first complete object; trailing text ignored");
        }
        return Ok((map, truncated));
    }

    error!("Response is not parsable JSON");
    Err(crate::Error::extraction("unparsable", cleaned))
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>>
{   match serde_json::from_str::<Value>(candidate)
    {   Ok(Value::Object(map)) => Some(map)
      , Ok(_) => None
      , Err(e) => {
          trace!("Candidate rejected: {}", e);
          None
        }
    }
}

fn is_filled(value: &Value) -> bool
{   match value
    {   Value::Array(items) => !items.is_empty()
      , Value::Object(map) => !map.is_empty()
      , _ => false
    }
}

/// "25g" -> 25, "12.5 mg" -> 12.5; None for anything else
pub(crate) fn leading_number(text: &str) -> Option<Number>
{   let caps = number_with_unit_re().captures(text)?;
    let digits = caps.get(1)?.as_str();
    if let Ok(i) = digits.parse::<i64>()
    {   return Some(Number::from(i));
    }
    Number::from_f64(digits.parse::<f64>().ok()?)
}
