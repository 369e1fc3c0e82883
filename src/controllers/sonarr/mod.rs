pub mod controller;

pub use controller::{reconcile_sonarr, run, ReconcileOutcome, Step};

pub mod reconcilers;
