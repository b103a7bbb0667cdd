//! Execution backends implementing [`StoryRunner`](crate::domain::ports::StoryRunner).

pub mod command;

pub use command::CommandRunner;
