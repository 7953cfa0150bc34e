//! Request, partition and result types shared by the pipeline

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use log::error;

/// Unparsed completion text for one job; consumed by the extractor
pub type RawCompletion = String;

/// One named unit of content to generate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot
{   /// Key the model must answer under (e.g. "breakfast")
    pub name: String
  , /// Numeric target for the slot (e.g. calories)
    pub target: f64
  , /// Semantic family used to keep related slots in one call.
    /// Inferred from the name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>
}

impl Slot
{   pub fn new(name: &str, target: f64) -> Self
    {   Slot
        {   name: name.to_string()
          , target
          , family: None
        }
    }

    pub fn with_family(mut self, family: &str) -> Self
    {   self.family = Some(family.to_string());
        self
    }

    /// Explicit family, or "snack" / "meal" by name
    pub fn family(&self) -> &str
    {   match &self.family
        {   Some(f) => f.as_str()
          , None if self.name.contains("snack") => "snack"
          , None => "meal"
        }
    }

    /// Human-readable label: "mid_morning_snack" -> "Mid Morning Snack"
    pub fn label(&self) -> String
    {   self.name
          .split('_')
          .filter(|w| !w.is_empty())
          .map(|w| {
            let mut chars = w.chars();
            match chars.next()
            {   Some(c) => c.to_uppercase().chain(chars).collect()
              , None => String::new()
            }
          })
          .collect::<Vec<String>>()
          .join(" ")
    }
}

/// Logical unit of work requested by a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest
{   /// System instruction sent with every call
    pub system_prompt: String
  , /// Slots to fill; names must be unique
    pub slots: Vec<Slot>
  , /// Unit printed after slot targets ("kcal")
    #[serde(default = "default_target_unit")]
    pub target_unit: String
  , /// Options requested per slot
    #[serde(default = "default_options_per_slot")]
    pub options_per_slot: usize
  , /// Maximum output tokens for any single call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32
  , /// Sampling temperature in [0, 1]
    #[serde(default = "default_temperature")]
    pub temperature: f32
  , /// Free-form context lines (patient profile, regional foods)
    #[serde(default)]
    pub context: Vec<String>
  , /// Extra rules appended to the built-in ones
    #[serde(default)]
    pub rules: Vec<String>
  , /// JSON template for one option in the response skeleton
    #[serde(default = "default_option_template")]
    pub option_template: Value
}

fn default_target_unit() -> String
{   "kcal".to_string()
}

fn default_options_per_slot() -> usize
{   2
}

fn default_max_tokens() -> u32
{   2048
}

fn default_temperature() -> f32
{   0.9
}

/// Template of one meal option, as shown to the model
pub fn default_option_template() -> Value
{   serde_json::json!({
      "option_name": "Option",
      "description": "Short description max 8 words",
      "preparation_time": "10 min",
      "difficulty": "Easy",
      "items": [
        { "food": "name", "portion": "amount", "calories": 100
        , "carbs": 15, "protein": 5, "fat": 3, "fiber": 2 }
      ]
    })
}

impl GenerationRequest
{   pub fn new(system_prompt: &str) -> Self
    {   GenerationRequest
        {   system_prompt: system_prompt.to_string()
          , slots: vec![]
          , target_unit: default_target_unit()
          , options_per_slot: default_options_per_slot()
          , max_tokens: default_max_tokens()
          , temperature: default_temperature()
          , context: vec![]
          , rules: vec![]
          , option_template: default_option_template()
        }
    }

    pub fn with_slot(mut self, name: &str, target: f64) -> Self
    {   self.slots.push(Slot::new(name, target));
        self
    }

    pub fn with_context(mut self, line: &str) -> Self
    {   self.context.push(line.to_string());
        self
    }

    pub fn with_options_per_slot(mut self, n: usize) -> Self
    {   self.options_per_slot = n;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self
    {   self.temperature = t;
        self
    }

    pub fn with_max_tokens(mut self, n: u32) -> Self
    {   self.max_tokens = n;
        self
    }

    /// A request with one slot per (meal, calories) pair
    pub fn meal_plan(meals: &[(&str, f64)]) -> Self
    {   let mut req = GenerationRequest::new(
          "You are a diabetes nutrition expert AI. Respond with \
           ONLY valid JSON, no markdown, no code blocks."
        );
        for (name, kcal) in meals
        {   req.slots.push(Slot::new(name, *kcal));
        }
        req
    }

    pub fn slot_names(&self) -> Vec<String>
    {   self.slots.iter().map(|s| s.name.clone()).collect()
    }

    /// Check the request before anything is sent
    pub fn validate(&self) -> crate::Result<()>
    {   let invalid = |msg: String| {
          error!("Invalid request: {}", msg);
          Err(crate::Error::InvalidRequest(msg))
        };
        if self.slots.is_empty()
        {   return invalid("no slots requested".to_string());
        }
        let mut seen = HashSet::new();
        for slot in &self.slots
        {   if slot.name.trim().is_empty()
            {   return invalid("empty slot name".to_string());
            }
            if !seen.insert(slot.name.as_str())
            {   return invalid(
                  format!("duplicate slot {}", slot.name)
                );
            }
        }
        if self.options_per_slot == 0
        {   return invalid("options_per_slot must be >= 1".to_string());
        }
        if !self.temperature.is_finite()
        {   return invalid("temperature is not finite".to_string());
        }
        Ok(())
    }
}

/// Slots bundled into one remote call, with the prompt built for them
#[derive(Debug, Clone, PartialEq)]
pub struct Partition
{   /// Position in the plan
    pub index: usize
  , pub slots: Vec<Slot>
  , /// Literal user prompt for this call
    pub prompt: String
  , /// System instruction for this call
    pub system_prompt: String
  , /// Requested output tokens (before endpoint clamping)
    pub max_tokens: u32
  , pub temperature: f32
}

impl Partition
{   pub fn slot_names(&self) -> Vec<String>
    {   self.slots.iter().map(|s| s.name.clone()).collect()
    }
}

/// Ordered partitions covering every requested slot once
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPlan
{   pub partitions: Vec<Partition>
}

impl PartitionPlan
{   pub fn len(&self) -> usize
    {   self.partitions.len()
    }

    pub fn is_empty(&self) -> bool
    {   self.partitions.is_empty()
    }

    /// Every slot name, in partition order
    pub fn slot_names(&self) -> Vec<String>
    {   self.partitions
          .iter()
          .flat_map(|p| p.slot_names())
          .collect()
    }

    /// Confirm the plan covers `request` exactly once per slot
    pub fn check_covers(&self, request: &GenerationRequest)
      -> crate::Result<()>
    {   let mut seen = HashSet::new();
        for name in self.slot_names()
        {   if !seen.insert(name.clone())
            {   return Err(crate::Error::Other(
                  format!("slot {} planned twice", name)
                ));
            }
        }
        for name in request.slot_names()
        {   if !seen.remove(&name)
            {   return Err(crate::Error::Other(
                  format!("slot {} not planned", name)
                ));
            }
        }
        match seen.into_iter().next()
        {   Some(extra) => Err(crate::Error::Other(
              format!("slot {} planned but not requested", extra)
            ))
          , None => Ok(())
        }
    }
}

/// Terminal state of one remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus
{   Pending
  , Succeeded
  , Failed
  , TimedOut
}

/// One in-flight remote call
#[derive(Debug, Clone)]
pub struct GenerationJob
{   pub partition_index: usize
  , /// Server-issued handle
    pub job_id: String
  , pub submitted_at: Instant
  , pub status: JobStatus
}

impl GenerationJob
{   pub fn new(partition_index: usize, job_id: String) -> Self
    {   GenerationJob
        {   partition_index
          , job_id
          , submitted_at: Instant::now()
          , status: JobStatus::Pending
        }
    }

    pub fn finish(&mut self, status: JobStatus)
    {   self.status = status;
    }

    pub fn elapsed(&self) -> Duration
    {   self.submitted_at.elapsed()
    }
}

/// Validated content recovered from one completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSlotResult
{   /// Expected keys that held a non-empty array or object
    pub slots: BTreeMap<String, Value>
  , /// Expected keys absent or empty, in expected order
    pub missing_keys: Vec<String>
  , /// Top-level keys that were not expected (e.g. "tips")
    #[serde(default)]
    pub extras: Map<String, Value>
  , /// The document had to be closed after truncation
    #[serde(default)]
    pub repaired_truncation: bool
}

impl ParsedSlotResult
{   /// Some keys recovered, some missing
    pub fn is_partial(&self) -> bool
    {   !self.slots.is_empty() && !self.missing_keys.is_empty()
    }

    /// Nothing expected was recovered
    pub fn is_empty(&self) -> bool
    {   self.slots.is_empty()
    }
}
