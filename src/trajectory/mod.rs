//! Canonical trajectory model.
//!
//! Every ingestion path normalizes into [`Trajectory`]; classification and
//! statistics read it back. A trajectory holds:
//! - **Transcript**: role-tagged messages (`system` / `user` / `assistant` / `tool`)
//! - **Steps**: per-step reward, done flag, Monte-Carlo return and tool observation
//! - **Rewards**: final `reward` plus `toolcall_reward` and `res_reward`
//! - **Training coordinates**: `training_id`, `epoch_id`, `iteration_id`, `sample_id`, `tree_id`

pub mod types;

pub use types::{ClassificationResult, Message, Role, Step, Task, Trajectory};
