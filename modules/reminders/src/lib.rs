//! Reminder service: turns `user.registered` and `program.plan.persisted`
//! events into scheduled reminder rows.

pub mod config;
pub mod db;
pub mod handlers;
pub mod routes;
