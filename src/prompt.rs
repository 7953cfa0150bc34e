//! Prompt text for a single partition

use serde_json::Value;
use crate::request::{GenerationRequest, Slot};

/// JSON skeleton with `options` copies of `template` under each slot
pub fn build_skeleton(
  slots: &[Slot]
, options: usize
, template: &Value
) -> String
{   let entries: Vec<String> = slots
      .iter()
      .map(|slot| {
        let opts: Vec<String> = (1..=options)
          .map(|n| numbered_option(template, n).to_string())
          .collect();
        format!(
          "\n  \"{}\": [\n    {}\n  ]",
          slot.name,
          opts.join(",\n    ")
        )
      })
      .collect();
    format!("{{{}\n}}", entries.join(","))
}

fn numbered_option(template: &Value, n: usize) -> Value
{   let mut option = template.clone();
    if let Value::Object(map) = &mut option
    {   if map.contains_key("option_name")
        {   map.insert(
              "option_name".to_string(),
              Value::String(format!("Option {}", n))
            );
        }
    }
    option
}

/// User prompt asking for `slots` only
pub fn build_user_prompt(
  request: &GenerationRequest
, slots: &[Slot]
) -> String
{   let labels: Vec<String>
      = slots.iter().map(|s| s.label()).collect();
    let targets: Vec<String> = slots
      .iter()
      .map(|s| format!("{}={} {}", s.name, s.target, request.target_unit))
      .collect();
    let keys: Vec<&str>
      = slots.iter().map(|s| s.name.as_str()).collect();

    let mut out = format!(
      "Create {} options for each of: {}.\n",
      request.options_per_slot,
      labels.join(", ")
    );

    if !request.context.is_empty()
    {   out.push_str("\nCONTEXT:\n");
        for line in &request.context
        {   out.push_str("- ");
            out.push_str(line);
            out.push('\n');
        }
    }

    out.push_str(&format!("\nTARGETS: {}\n", targets.join(", ")));

    out.push_str("\nRULES:\n");
    out.push_str(
      "- All numeric values MUST be plain numbers (no units like g, mg, kcal)\n"
    );
    out.push_str(&format!(
      "- Use exactly these top-level keys: {}\n",
      keys.join(", ")
    ));
    out.push_str(&format!(
      "- Exactly {} options per key\n",
      request.options_per_slot
    ));
    for rule in &request.rules
    {   out.push_str("- ");
        out.push_str(rule);
        out.push('\n');
    }

    out.push_str("\nReturn ONLY valid JSON, no markdown, no extra text:\n");
    out.push_str(&build_skeleton(
      slots,
      request.options_per_slot,
      &request.option_template
    ));
    out
}
