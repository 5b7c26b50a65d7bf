use serde::{Deserialize, Serialize};

pub mod command;
pub mod config;
pub mod context;
pub mod credential;
pub mod credentials;
pub mod cron_schedule;
pub mod database;
pub mod error;
pub mod execution;
pub mod job;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod recap;
pub mod repository;
pub mod repository_sync;
pub mod runner;
pub mod scheduler;
pub mod secrets;
pub mod workload;

#[cfg(test)]
mod tests;

/// Messages accepted by the scheduler loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Reconcile configured jobs with running workloads now.
    Reload,
    /// Stop every workload and leave the loop.
    Stop,
}

/// Process signals the scheduler reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hangup,
    Interrupt,
    Terminate,
}

/// What to do with a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Send(Command),
    /// A stop was already requested; leave without waiting for the workloads.
    Exit,
}

/// Maps signals to scheduler commands. A second SIGINT/SIGTERM forces an exit.
#[derive(Debug, Default)]
pub struct SignalHandler {
    stopping: bool,
}

impl SignalHandler {
    pub fn handle(&mut self, signal: Signal) -> SignalAction {
        match signal {
            Signal::Hangup if self.stopping => SignalAction::Send(Command::Stop),
            Signal::Hangup => SignalAction::Send(Command::Reload),
            Signal::Interrupt | Signal::Terminate if self.stopping => SignalAction::Exit,
            Signal::Interrupt | Signal::Terminate => {
                self.stopping = true;
                SignalAction::Send(Command::Stop)
            }
        }
    }
}
