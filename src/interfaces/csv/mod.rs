//! CSV adapters used by the replay binary: command scripts in, final state out.

pub mod command_reader;
pub mod script;
pub mod state_writer;
