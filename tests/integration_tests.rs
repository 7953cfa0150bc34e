mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use plangen::meal::{fallback_options, meal_options, normalize_options};
use plangen::{
  EndpointFlavor, Error, GenerationRequest, GenerationService, Orchestrator
, PlanGenConfig, Slot, UnfilledReason
};
use common::{clean_payload, fast_config, ScriptedBackend, Step};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String>
{   let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name: &str| vars.get(name).cloned()
}

fn temp_config(name: &str, contents: &str) -> std::path::PathBuf
{   let path = std::env::temp_dir().join(format!(
      "plangen-{}-{}.json",
      name,
      std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

// ===== Configuration =====

#[tokio::test]
async fn test_default_config_is_valid()
{   let config = PlanGenConfig::default();
    assert_ok!(config.validate());
    assert_eq!(config.endpoint.flavor, EndpointFlavor::Generic);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.partition.token_ceiling, 2048);
    assert_eq!(config.deadline(), None);
}

#[tokio::test]
async fn test_env_overlay()
{   let mut config = PlanGenConfig::default();
    assert_ok!(config.apply_env(lookup(&[
      ("PLANGEN_API_BASE", "https://example.hf.space/"),
      ("PLANGEN_FLAVOR", "gradio"),
      ("PLANGEN_MAX_TOKENS", "1500"),
      ("PLANGEN_POLL_TIMEOUT_SECS", "45"),
      ("PLANGEN_MAX_ATTEMPTS", "5"),
      ("PLANGEN_DEADLINE_SECS", "90"),
    ])));
    assert_eq!(config.endpoint.api_base, "https://example.hf.space");
    assert_eq!(config.endpoint.flavor, EndpointFlavor::Gradio);
    assert_eq!(config.partition.token_ceiling, 1500);
    assert_eq!(config.endpoint.poll_timeout(), Duration::from_secs(45));
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.deadline(), Some(Duration::from_secs(90)));
}

#[tokio::test]
async fn test_env_overlay_rejects_bad_values()
{   let mut config = PlanGenConfig::default();
    let err = assert_err!(
      config.apply_env(lookup(&[("PLANGEN_FLAVOR", "openai")]))
    );
    assert!(matches!(err, Error::InvalidConfiguration(_)));

    let err = assert_err!(
      config.apply_env(lookup(&[("PLANGEN_MAX_ATTEMPTS", "many")]))
    );
    assert!(err.to_string().contains("PLANGEN_MAX_ATTEMPTS"));
}

#[tokio::test]
async fn test_validate_rejects_unusable_values()
{   let mut config = PlanGenConfig::default();
    config.retry.max_attempts = 0;
    assert_err!(config.validate());

    let mut config = PlanGenConfig::default();
    config.retry.backoff_multiplier = 0.5;
    assert_err!(config.validate());

    let mut config = PlanGenConfig::default();
    config.endpoint.min_max_tokens = 4096;
    assert_err!(config.validate());

    let mut config = PlanGenConfig::default();
    config.partition.max_slots_per_call = 0;
    assert_err!(config.validate());
}

#[tokio::test]
async fn test_config_file_fills_defaults()
{   let path = temp_config(
      "partial",
      r#"{"endpoint": {"flavor": "gradio", "api_base": "http://10.0.0.2:7860"}, "deadline_secs": 30}"#
    );
    let config = assert_ok!(PlanGenConfig::from_json_file(&path));
    std::fs::remove_file(&path).ok();

    assert_eq!(config.endpoint.flavor, EndpointFlavor::Gradio);
    assert_eq!(config.endpoint.api_base, "http://10.0.0.2:7860");
    assert_eq!(config.endpoint.poll_timeout_secs, 120);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.deadline(), Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_bad_config_file()
{   let path = temp_config("bad", r#"{"retry": {"max_attempts": 0}}"#);
    assert_err!(PlanGenConfig::from_json_file(&path));
    std::fs::remove_file(&path).ok();

    assert_err!(PlanGenConfig::from_json_file("/nonexistent/plangen.json"));
}

// ===== Meal options =====

#[tokio::test]
async fn test_normalize_fills_defaults()
{   let value = json!([
      {
        "option_name": "Poha bowl",
        "difficulty": "Impossible",
        "items": [
          {"food": "poha", "portion": "1 bowl", "calories": 250, "carbs": "40g"},
          {"food": "", "calories": 999},
          {"food": "tea", "calories": 30}
        ]
      },
      {"description": "no items at all"},
      "not an option"
    ]);
    let options = normalize_options(&value, 450.0);
    assert_eq!(options.len(), 2);

    let first = &options[0];
    assert_eq!(first.option_name, "Poha bowl");
    assert_eq!(first.difficulty, "Easy");
    assert_eq!(first.preparation_time, "15 minutes");
    assert_eq!(first.items.len(), 2);
    assert_eq!(first.items[0].carbs, 40.0);
    assert_eq!(first.items[1].portion, "1 serving");
    assert_eq!(first.total_calories, 280.0);

    let second = &options[1];
    assert_eq!(second.option_name, "Option");
    assert!(second.items.is_empty());
    assert_eq!(second.total_calories, 450.0);
}

#[tokio::test]
async fn test_fallback_options_are_balanced()
{   let options = fallback_options(&Slot::new("lunch", 600.0));
    assert_eq!(options.len(), 1);
    let item = &options[0].items[0];
    assert_eq!(options[0].option_name, "Lunch Option");
    assert_eq!(item.calories, 600.0);
    assert_eq!(item.carbs, 68.0);
    assert_eq!(item.protein, 38.0);
    assert_eq!(item.fat, 20.0);
    assert_eq!(options[0].total_calories, 600.0);

    let snack = fallback_options(&Slot::new("mid_morning_snack", 0.0));
    assert_eq!(snack[0].option_name, "Mid Morning Snack Option");
    assert_eq!(snack[0].total_calories, 300.0);
}

// ===== Orchestration with fallbacks =====

#[tokio::test]
async fn test_fallbacks_fill_but_keep_manifest()
{   let mut config = fast_config();
    config.retry.max_attempts = 1;
    let backend = Arc::new(
      ScriptedBackend::new()
        .script("breakfast", vec![Step::Reply(
          clean_payload(&["breakfast", "lunch"])
        )])
    );
    let request = GenerationRequest::meal_plan(&[
      ("breakfast", 450.0),
      ("lunch", 540.0),
      ("dinner", 510.0),
    ]);
    let result = assert_ok!(
      Orchestrator::new(&config, backend)
        .generate(&request, None)
        .await
    );
    assert_eq!(result.manifest.unfilled_slots(), vec!["dinner"]);

    let filled = result.with_fallbacks(&request.slots);
    assert_eq!(filled.slots.len(), 3);
    assert_eq!(filled.manifest.unfilled_slots(), vec!["dinner"]);

    let dinner = meal_options(&filled, &request.slots[2]);
    assert_eq!(dinner[0].option_name, "Dinner Option");
    let breakfast = meal_options(&filled, &request.slots[0]);
    assert_eq!(breakfast.len(), 2);
    assert_eq!(breakfast[1].items[0].food, "dal");
}

// ===== GenerationService =====

fn day_backend() -> Arc<ScriptedBackend>
{   Arc::new(
      ScriptedBackend::new()
        .script("breakfast", vec![Step::Reply(
          clean_payload(&["breakfast", "lunch", "dinner"])
        )])
        .script("evening_snack", vec![Step::Hang])
    )
}

fn day_request() -> GenerationRequest
{   GenerationRequest::meal_plan(&[
      ("breakfast", 450.0),
      ("lunch", 540.0),
      ("evening_snack", 150.0),
      ("dinner", 510.0),
    ])
}

#[tokio::test]
async fn test_service_initialization_and_shutdown()
{   let service = GenerationService::new(
      Orchestrator::new(&fast_config(), day_backend())
    );
    assert_ok!(service.shutdown().await);
}

#[tokio::test]
async fn test_service_generate()
{   let service = GenerationService::new(
      Orchestrator::new(&fast_config(), day_backend())
    );
    let mut reply_rx = assert_ok!(
      service.generate(day_request(), Some(Duration::from_millis(300))).await
    );
    let result = assert_ok!(reply_rx.recv().await.expect("reply"));

    assert_eq!(result.slots.len(), 3);
    assert_eq!(result.manifest.unfilled_slots(), vec!["evening_snack"]);
    assert_eq!(
      result.manifest.unfilled[0].reason,
      UnfilledReason::Cancelled { partition_index: 1 }
    );
    assert_ok!(service.shutdown().await);
}

#[tokio::test]
async fn test_service_runs_calls_side_by_side()
{   let backend = day_backend();
    let service = GenerationService::new(
      Orchestrator::new(&fast_config(), backend.clone())
    );
    let mut slow = assert_ok!(
      service.generate(day_request(), Some(Duration::from_millis(500))).await
    );
    let mut fast = assert_ok!(
      service.generate(
        GenerationRequest::meal_plan(&[("breakfast", 450.0)]),
        None
      ).await
    );

    // The second call does not wait for the first one's deadline
    let quick = tokio::time::timeout(Duration::from_millis(400), fast.recv())
      .await
      .expect("second call answered first")
      .expect("reply");
    assert!(assert_ok!(quick).is_complete());

    let first = assert_ok!(slow.recv().await.expect("reply"));
    assert_eq!(first.manifest.unfilled_slots(), vec!["evening_snack"]);
    assert_ok!(service.shutdown().await);
}

#[tokio::test]
async fn test_service_reports_invalid_request()
{   let service = GenerationService::new(
      Orchestrator::new(&fast_config(), day_backend())
    );
    let mut reply_rx = assert_ok!(
      service.generate(GenerationRequest::new("system"), None).await
    );
    let reply = reply_rx.recv().await.expect("reply");
    assert!(matches!(reply, Err(Error::InvalidRequest(_))));
    assert_ok!(service.shutdown().await);
}
