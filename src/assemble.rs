//! Merges per-partition results into the caller-facing result

use std::collections::{BTreeMap, HashMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use log::{debug, warn, error};
use crate::request::Slot;
use crate::retry::PartitionOutcome;

/// Why a requested slot has no content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnfilledReason
{   /// The partition answered but left this key out or empty
    MissingFromResponse
    {   partition_index: usize
    }
  , /// Every attempt for the partition failed
    PartitionFailed
    {   partition_index: usize
      , attempts: usize
      , error: String
    }
  , /// The orchestration deadline elapsed first
    Cancelled
    {   partition_index: usize
    }
  , /// No partition carried the slot
    NotPlanned
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnfilledSlot
{   pub slot: String
  , pub reason: UnfilledReason
}

/// Informational: a partition was accepted with keys missing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResultWarning
{   pub partition_index: usize
  , pub missing: Vec<String>
}

/// Which slots were filled and which were not
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest
{   /// Unfilled slots, in request order
    pub unfilled: Vec<UnfilledSlot>
  , pub warnings: Vec<PartialResultWarning>
  , /// Partitions whose response had to be closed after truncation
    pub repaired_partitions: Vec<usize>
}

impl Manifest
{   /// Nothing left unfilled
    pub fn is_empty(&self) -> bool
    {   self.unfilled.is_empty()
    }

    pub fn unfilled_slots(&self) -> Vec<&str>
    {   self.unfilled.iter().map(|u| u.slot.as_str()).collect()
    }
}

/// Final slot -> content mapping plus the manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssembledResult
{   pub slots: BTreeMap<String, Value>
  , /// Non-slot keys returned by the model (e.g. "tips")
    pub extras: Map<String, Value>
  , pub manifest: Manifest
}

impl AssembledResult
{   pub fn get(&self, slot: &str) -> Option<&Value>
    {   self.slots.get(slot)
    }

    /// Every requested slot is filled
    pub fn is_complete(&self) -> bool
    {   self.manifest.is_empty()
    }

    /// Fill unfilled slots with placeholder options.
    /// The manifest is left as is so substitutions stay visible.
    pub fn with_fallbacks(mut self, requested: &[Slot]) -> Self
    {   for slot in requested
        {   if self.slots.contains_key(&slot.name)
            {   continue;
            }
            warn!("Using fallback options for {}", slot.name);
            self.slots.insert(
              slot.name.clone(),
              crate::meal::fallback_value(slot)
            );
        }
        self
    }
}

/// Merges partition outcomes by key union
pub struct PlanAssembler;

impl PlanAssembler
{   /// Merge `outcomes` for the `requested` slot names.
    /// Requires every partition to have finished.
    pub fn assemble(
      requested: &[String]
    , outcomes: Vec<PartitionOutcome>
    ) -> AssembledResult
    {   debug!(
          "Assembling {} outcomes for {} slots",
          outcomes.len(), requested.len()
        );
        let mut result = AssembledResult::default();
        let mut reasons: HashMap<String, UnfilledReason> = HashMap::new();

        for outcome in outcomes
        {   match outcome.result
            {   Ok(parsed) => {
                  for (slot, value) in parsed.slots
                  {   debug_assert!(
                        !result.slots.contains_key(&slot),
                        "slot {} filled by two partitions", slot
                      );
                      if result.slots.contains_key(&slot)
                      {   error!(
                            "Slot {} filled twice; keeping the first",
                            slot
                          );
                          continue;
                      }
                      result.slots.insert(slot, value);
                  }
                  if !parsed.missing_keys.is_empty()
                  {   for slot in &parsed.missing_keys
                      {   reasons.insert(
                            slot.clone(),
                            UnfilledReason::MissingFromResponse
                            {   partition_index: outcome.partition_index
                            }
                          );
                      }
                      result.manifest.warnings.push(PartialResultWarning
                      {   partition_index: outcome.partition_index
                        , missing: parsed.missing_keys
                      });
                  }
                  if parsed.repaired_truncation
                  {   result.manifest.repaired_partitions
                        .push(outcome.partition_index);
                  }
                  merge_extras(&mut result.extras, parsed.extras);
                }
              , Err(crate::Error::Cancelled) => {
                  for slot in outcome.slots
                  {   reasons.insert(slot, UnfilledReason::Cancelled
                      {   partition_index: outcome.partition_index
                      });
                  }
                }
              , Err(e) => {
                  let message = e.to_string();
                  for slot in outcome.slots
                  {   reasons.insert(slot, UnfilledReason::PartitionFailed
                      {   partition_index: outcome.partition_index
                        , attempts: outcome.attempts
                        , error: message.clone()
                      });
                  }
                }
            }
        }

        for slot in requested
        {   if result.slots.contains_key(slot)
            {   continue;
            }
            let reason = reasons
              .remove(slot)
              .unwrap_or(UnfilledReason::NotPlanned);
            result.manifest.unfilled.push(UnfilledSlot
            {   slot: slot.clone()
              , reason
            });
        }
        result.manifest.repaired_partitions.sort_unstable();

        if !result.manifest.is_empty()
        {   warn!(
              "Unfilled slots: {:?}",
              result.manifest.unfilled_slots()
            );
        }
        result
    }
}

/// Union of extras; arrays under the same key are concatenated
fn merge_extras(into: &mut Map<String, Value>, from: Map<String, Value>)
{   for (key, value) in from
    {   if let Some(existing) = into.get_mut(&key)
        {   match (existing, value)
            {   (Value::Array(existing), Value::Array(more)) => {
                  existing.extend(more);
                }
              , _ => {
                  debug!("Keeping first value of extra {}", key);
                }
            }
            continue;
        }
        into.insert(key, value);
    }
}
