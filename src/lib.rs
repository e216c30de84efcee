pub mod brain;
pub mod command;
pub mod config;
pub mod history;
pub mod intent;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod supervisor;
