pub mod annotate;
pub mod client;
pub mod judge;
pub mod prompt;
pub mod scripted;

pub use annotate::annotated_screenshot;
pub use client::{ChatClient, ChatConfig, TokenUsage, check_health};
pub use judge::{
    Attempt, ImageAttachment, Judge, JudgeRequest, Judgment, LlmError, LlmResult, Purpose, RetryPolicy, judge_all,
    judge_with_retry,
};
pub use prompt::PromptSet;
pub use scripted::ScriptedJudge;
