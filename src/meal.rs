//! Typed meal options over assembled slot content

use serde::{Deserialize, Serialize};
use serde_json::Value;
use log::debug;
use crate::assemble::AssembledResult;
use crate::request::Slot;

pub const VALID_DIFFICULTIES: &[&str] = &["Easy", "Medium", "Moderate", "Hard"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodItem
{   pub food: String
  , pub portion: String
  , pub calories: f64
  , pub carbs: f64
  , pub protein: f64
  , pub fat: f64
  , pub fiber: f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealOption
{   pub option_name: String
  , pub description: String
  , pub preparation_time: String
  , pub difficulty: String
  , pub items: Vec<FoodItem>
  , /// Sum of item calories, or the slot target when there are no items
    pub total_calories: f64
}

fn text(option: &Value, key: &str, default: &str) -> String
{   match option.get(key).and_then(Value::as_str)
    {   Some(s) if !s.trim().is_empty() => s.to_string()
      , _ => default.to_string()
    }
}

fn number(option: &Value, key: &str) -> f64
{   match option.get(key)
    {   Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0)
      , Some(Value::String(s)) => crate::extract::leading_number(s)
          .and_then(|n| n.as_f64())
          .unwrap_or(0.0)
      , _ => 0.0
    }
}

fn food_item(item: &Value) -> Option<FoodItem>
{   let food = text(item, "food", "");
    if food.is_empty()
    {   return None;
    }
    Some(FoodItem
    {   food
      , portion: text(item, "portion", "1 serving")
      , calories: number(item, "calories")
      , carbs: number(item, "carbs")
      , protein: number(item, "protein")
      , fat: number(item, "fat")
      , fiber: number(item, "fiber")
    })
}

fn meal_option(option: &Value, target: f64) -> Option<MealOption>
{   if !option.is_object()
    {   return None;
    }
    let items: Vec<FoodItem> = option
      .get("items")
      .and_then(Value::as_array)
      .map(|items| items.iter().filter_map(food_item).collect())
      .unwrap_or_default();
    let total_calories = if items.is_empty()
    {   target
    } else
    {   items.iter().map(|i| i.calories).sum()
    };
    let mut difficulty = text(option, "difficulty", "Easy");
    if !VALID_DIFFICULTIES.contains(&difficulty.as_str())
    {   debug!("Unknown difficulty {:?}, using Easy", difficulty);
        difficulty = "Easy".to_string();
    }
    Some(MealOption
    {   option_name: text(option, "option_name", "Option")
      , description: text(option, "description", "")
      , preparation_time: text(option, "preparation_time", "15 minutes")
      , difficulty
      , items
      , total_calories
    })
}

/// Options under one slot, with defaults filled in
pub fn normalize_options(value: &Value, target: f64) -> Vec<MealOption>
{   value
      .as_array()
      .map(|options| {
        options.iter().filter_map(|o| meal_option(o, target)).collect()
      })
      .unwrap_or_default()
}

/// Normalized options for `slot`, empty when the slot is unfilled
pub fn meal_options(result: &AssembledResult, slot: &Slot) -> Vec<MealOption>
{   result
      .get(&slot.name)
      .map(|v| normalize_options(v, slot.target))
      .unwrap_or_default()
}

/// One balanced placeholder option sized to the slot target
pub fn fallback_value(slot: &Slot) -> Value
{   let kcal = if slot.target > 0.0 { slot.target } else { 300.0 };
    let label = slot.label();
    serde_json::json!([{
      "option_name": format!("{} Option", label),
      "description": format!(
        "Balanced diabetic-friendly {}", label.to_lowercase()
      ),
      "preparation_time": "15 minutes",
      "difficulty": "Easy",
      "items": [{
        "food": "Balanced meal",
        "portion": "1 serving",
        "calories": kcal,
        "carbs": (kcal * 0.45 / 4.0).round(),
        "protein": (kcal * 0.25 / 4.0).round(),
        "fat": (kcal * 0.30 / 9.0).round(),
        "fiber": 5
      }],
      "total_calories": kcal
    }])
}

/// Typed form of `fallback_value`
pub fn fallback_options(slot: &Slot) -> Vec<MealOption>
{   normalize_options(&fallback_value(slot), slot.target)
}
