pub mod backup_exchange;
pub mod boundaries;
pub mod classes;
pub mod core;
pub mod exams;
pub mod marklist;
pub mod reports;
pub mod results;
pub mod setup;
pub mod students;
