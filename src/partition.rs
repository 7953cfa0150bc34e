//! Splits a request into calls that each fit the model's output budget

use log::{debug, warn};
use crate::config::PartitionConfig;
use crate::request::{GenerationRequest, Partition, PartitionPlan, Slot};

/// Groups slots into bounded remote calls
#[derive(Debug, Clone, Default)]
pub struct PromptPartitioner
{   config: PartitionConfig
}

impl PromptPartitioner
{   pub fn new(config: PartitionConfig) -> Self
    {   PromptPartitioner { config }
    }

    /// Output token ceiling for one call of `request`
    pub fn ceiling(&self, request: &GenerationRequest) -> u32
    {   request.max_tokens.min(self.config.token_ceiling)
    }

    /// Estimated output tokens for a call carrying `slots` slots
    pub fn estimate_cost(
      &self
    , request: &GenerationRequest
    , slots: usize
    ) -> u64
    {   slots as u64
          * request.options_per_slot as u64
          * self.config.tokens_per_item as u64
    }

    /// How many slots one call may carry
    pub fn slots_per_call(&self, request: &GenerationRequest) -> usize
    {   let per_slot = self.estimate_cost(request, 1).max(1);
        let ceiling = self.ceiling(request) as u64;
        if per_slot > ceiling
        {   warn!(
              "One slot ({} tokens) exceeds ceiling {}; one slot per call",
              per_slot, ceiling
            );
            return 1;
        }
        let by_budget = (ceiling / per_slot) as usize;
        by_budget.min(self.config.max_slots_per_call).max(1)
    }

    /// Partition `request` into disjoint, exhaustive calls
    pub fn plan(&self, request: &GenerationRequest) -> PartitionPlan
    {   let per = self.slots_per_call(request);
        let minimum = (request.slots.len() + per - 1) / per;
        debug!(
          "Planning {} slots, {} per call, at least {} calls",
          request.slots.len(), per, minimum
        );

        let families = group_by_family(&request.slots);
        let mut groups = family_aligned(&families, per);
        if groups.len() > minimum
        {   debug!(
              "Family-aligned plan needs {} calls, packing sequentially",
              groups.len()
            );
            let ordered: Vec<Slot> = families
              .into_iter()
              .flat_map(|(_, slots)| slots)
              .collect();
            groups = ordered.chunks(per).map(|c| c.to_vec()).collect();
        }

        let partitions = groups
          .into_iter()
          .enumerate()
          .map(|(index, slots)| {
            let prompt = crate::prompt::build_user_prompt(request, &slots);
            Partition
            {   index
              , slots
              , prompt
              , system_prompt: request.system_prompt.clone()
              , max_tokens: self.ceiling(request)
              , temperature: request.temperature
            }
          })
          .collect();

        PartitionPlan { partitions }
    }
}

/// Families in order of first appearance, members in request order
fn group_by_family(slots: &[Slot]) -> Vec<(String, Vec<Slot>)>
{   let mut families: Vec<(String, Vec<Slot>)> = vec![];
    for slot in slots
    {   let family = slot.family();
        match families.iter().position(|(f, _)| f == family)
        {   Some(i) => families[i].1.push(slot.clone())
          , None => families.push(
              (family.to_string(), vec![slot.clone()])
            )
        }
    }
    families
}

/// Chunk each family, then first-fit the leftover chunks together
fn family_aligned(
  families: &[(String, Vec<Slot>)]
, per: usize
) -> Vec<Vec<Slot>>
{   let mut groups: Vec<Vec<Slot>> = vec![];
    for (_, members) in families
    {   for chunk in members.chunks(per)
        {   if chunk.len() < per
            {   if let Some(group) = groups
                  .iter_mut()
                  .find(|g| g.len() + chunk.len() <= per)
                {   group.extend_from_slice(chunk);
                    continue;
                }
            }
            groups.push(chunk.to_vec());
        }
    }
    groups
}
