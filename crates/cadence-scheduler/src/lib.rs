//! `cadence-scheduler` — periodic job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Job implementations live in a [`registry::JobRegistry`]. Every tick the
//! [`engine::Controller`] reconciles the registry with the persisted job
//! definitions, runs the schedule instances that are due, creates the next
//! instance for each definition, mails digests of finished runs and prunes
//! old history.
//!
//! # Instance lifecycle
//!
//! | Status      | Meaning                                             |
//! |-------------|-----------------------------------------------------|
//! | `scheduled` | Waiting for its `start` instant                     |
//! | `running`   | Claimed by a trigger; job body executing            |
//! | `finished`  | Result, duration and error flag recorded            |
//!
//! Cron expressions use the classic five fields and are evaluated in local time.

pub mod catalog;
pub mod command;
pub mod cron;
pub mod db;
pub mod digest;
pub mod display;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod mailer;
pub mod registry;
pub mod retention;
pub mod runner;
pub mod store;
pub mod types;

pub use engine::{Controller, TickReport};
pub use error::{Result, SchedulerError};
pub use registry::{Capture, Job, JobRegistry};
pub use store::{SqliteStore, Store};
pub use types::{InstanceStatus, JobDefinition, JobKey, ScheduleInstance};
