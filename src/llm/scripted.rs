//! Scripted judge for tests and offline demos.
//!
//! Responses are queued per purpose and consumed in order. When a queue is
//! empty the purpose's responder or default response is used; with neither,
//! the call fails with a transport error.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::judge::{Judge, JudgeRequest, LlmError, LlmResult, Purpose};

type Responder = Box<dyn Fn(&JudgeRequest) -> LlmResult<String> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedJudge {
    queues: Mutex<HashMap<Purpose, VecDeque<LlmResult<String>>>>,
    defaults: HashMap<Purpose, String>,
    responders: HashMap<Purpose, Responder>,
    seen: Mutex<Vec<(Purpose, String)>>,
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response used whenever the queue for `purpose` is empty
    pub fn with_default(mut self, purpose: Purpose, response: &str) -> Self {
        self.defaults.insert(purpose, response.to_string());
        self
    }

    /// Compute responses from the request when the queue is empty
    pub fn with_responder<F>(mut self, purpose: Purpose, responder: F) -> Self
    where
        F: Fn(&JudgeRequest) -> LlmResult<String> + Send + Sync + 'static,
    {
        self.responders.insert(purpose, Box::new(responder));
        self
    }

    /// Queue one response for `purpose`
    pub fn push(&self, purpose: Purpose, response: LlmResult<String>) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.entry(purpose).or_default().push_back(response);
        }
    }

    /// Prompts received for `purpose`, in call order
    pub fn prompts(&self, purpose: Purpose) -> Vec<String> {
        self.seen
            .lock()
            .map(|seen| seen.iter().filter(|(p, _)| *p == purpose).map(|(_, s)| s.clone()).collect())
            .unwrap_or_default()
    }

    pub fn calls(&self, purpose: Purpose) -> usize {
        self.prompts(purpose).len()
    }
}

impl Judge for ScriptedJudge {
    fn judge(&self, request: &JudgeRequest) -> LlmResult<String> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((request.purpose, request.prompt.clone()));
        }

        let queued = self
            .queues
            .lock()
            .ok()
            .and_then(|mut queues| queues.get_mut(&request.purpose).and_then(VecDeque::pop_front));
        if let Some(response) = queued {
            return response;
        }
        if let Some(responder) = self.responders.get(&request.purpose) {
            return responder(request);
        }
        self.defaults
            .get(&request.purpose)
            .cloned()
            .ok_or_else(|| LlmError::Transport(format!("no scripted response for {}", request.purpose)))
    }
}
