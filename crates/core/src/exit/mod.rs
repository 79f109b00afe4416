/// Exit-node side of the tunnel protocol

pub mod agent;

pub use agent::ExitAgent;
