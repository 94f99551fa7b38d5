pub mod health;
pub mod judging;
pub mod scheduler;
