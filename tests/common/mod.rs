#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use plangen::{Error, GenerationBackend, RawCompletion};

/// What the fake endpoint does for one submitted job
#[derive(Debug, Clone)]
pub enum Step
{   /// Stream ends with this completion text
    Reply(String)
  , /// Submit is rejected with this status
    SubmitFail(u16)
  , /// Stream never finishes within the poll timeout
    Timeout
  , /// Stream ends without a usable payload
    NoPayload
  , /// Stream never finishes at all
    Hang
}

/// Scripted GenerationBackend routed by slot name.
///
/// A job is routed to the first script whose slot name appears
/// quoted in the prompt. Each script is consumed one step per submit;
/// the last step repeats once the script runs out.
pub struct ScriptedBackend
{   scripts: Mutex<HashMap<String, VecDeque<Step>>>
  , jobs: Mutex<HashMap<String, Step>>
  , submits: Mutex<HashMap<String, usize>>
  , pub prompts: Mutex<Vec<String>>
  , pub max_tokens_seen: Mutex<Vec<u32>>
  , delay: Duration
  , next_id: AtomicUsize
  , in_flight: AtomicUsize
  , pub max_in_flight: AtomicUsize
}

impl ScriptedBackend
{   pub fn new() -> Self
    {   ScriptedBackend
        {   scripts: Mutex::new(HashMap::new())
          , jobs: Mutex::new(HashMap::new())
          , submits: Mutex::new(HashMap::new())
          , prompts: Mutex::new(vec![])
          , max_tokens_seen: Mutex::new(vec![])
          , delay: Duration::from_millis(0)
          , next_id: AtomicUsize::new(0)
          , in_flight: AtomicUsize::new(0)
          , max_in_flight: AtomicUsize::new(0)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self
    {   self.delay = delay;
        self
    }

    pub fn script(self, slot: &str, steps: Vec<Step>) -> Self
    {   self.scripts
          .lock()
          .unwrap()
          .insert(slot.to_string(), steps.into());
        self
    }

    /// Submits routed to the script for `slot`
    pub fn submits_for(&self, slot: &str) -> usize
    {   *self.submits.lock().unwrap().get(slot).unwrap_or(&0)
    }

    pub fn total_submits(&self) -> usize
    {   self.submits.lock().unwrap().values().sum()
    }

    fn route(&self, prompt: &str) -> Option<String>
    {   let scripts = self.scripts.lock().unwrap();
        let mut keys: Vec<&String> = scripts.keys().collect();
        keys.sort();
        keys.into_iter()
          .find(|k| prompt.contains(&format!("\"{}\"", k)))
          .cloned()
    }

    fn next_step(&self, route: &str) -> Step
    {   let mut scripts = self.scripts.lock().unwrap();
        let steps = scripts.get_mut(route).unwrap();
        if steps.len() > 1
        {   steps.pop_front().unwrap()
        } else
        {   steps.front().cloned().unwrap_or(Step::NoPayload)
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend
{   async fn submit(
      &self
    , _system_prompt: &str
    , user_prompt: &str
    , max_tokens: u32
    , _temperature: f32
    ) -> plangen::Result<String>
    {   self.prompts.lock().unwrap().push(user_prompt.to_string());
        self.max_tokens_seen.lock().unwrap().push(max_tokens);
        let route = self.route(user_prompt)
          .ok_or_else(|| Error::submission(Some(404), "no script"))?;
        *self.submits.lock().unwrap().entry(route.clone()).or_insert(0) += 1;

        let step = self.next_step(&route);
        if let Step::SubmitFail(status) = step
        {   return Err(Error::submission(Some(status), "scripted rejection"));
        }
        let id = format!(
          "{}-{}",
          route,
          self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        self.jobs.lock().unwrap().insert(id.clone(), step);
        Ok(id)
    }

    async fn poll(
      &self
    , job_id: &str
    , timeout: Duration
    ) -> plangen::Result<RawCompletion>
    {   let step = self.jobs.lock().unwrap().remove(job_id)
          .ok_or_else(|| Error::NoPayload("unknown job".to_string()))?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = match step
        {   Step::Reply(text) => {
              tokio::time::sleep(self.delay).await;
              Ok(text)
            }
          , Step::Timeout => {
              tokio::time::sleep(timeout).await;
              Err(Error::PollTimeout
              {   job_id: job_id.to_string()
                , after: timeout
              })
            }
          , Step::NoPayload => {
              Err(Error::NoPayload("scripted empty stream".to_string()))
            }
          , Step::Hang => {
              tokio::time::sleep(Duration::from_secs(3600)).await;
              Err(Error::NoPayload("hung".to_string()))
            }
          , Step::SubmitFail(_) => unreachable!()
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Two options per slot, as a well-behaved model would answer
pub fn clean_payload(slots: &[&str]) -> String
{   let body: Vec<String> = slots
      .iter()
      .map(|s| format!(
        r#""{}": [{{"option_name":"Option 1","items":[{{"food":"roti","portion":"1","calories":120,"carbs":20,"protein":4,"fat":2,"fiber":3}}]}},{{"option_name":"Option 2","items":[{{"food":"dal","portion":"1 cup","calories":180,"carbs":25,"protein":9,"fat":4,"fiber":6}}]}}]"#,
        s
      ))
      .collect();
    format!("{{{}}}", body.join(","))
}

/// Fast config: tiny backoff, short poll timeout
pub fn fast_config() -> plangen::PlanGenConfig
{   let mut config = plangen::PlanGenConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.endpoint.poll_timeout_secs = 1;
    config
}
