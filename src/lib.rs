// lisa-launch - distributed fine-tuning launcher for LISA
// Library exports

pub mod cli;
pub mod config;
pub mod errors; // User-facing messages and exit codes
pub mod launcher;
pub mod rendezvous; // Startup barrier between launcher and workers
pub mod telemetry;
pub mod worker;
