//! afl-daemon: the unattended side of the engine.
//!
//! Runs the daily settlement batch, the daily payout sweep and the periodic
//! stale-job recovery on a UTC wall-clock schedule. Every job goes through
//! the same engine entry points the CLI uses, with `Trigger::Scheduled`, so
//! lock contention and job failures are logged instead of surfacing.

pub mod jobs;
pub mod schedule;
pub mod wiring;
