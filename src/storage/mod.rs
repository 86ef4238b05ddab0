pub mod task;

pub use task::{SqliteTaskStorage, TaskStorage};
