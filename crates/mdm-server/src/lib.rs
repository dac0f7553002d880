//! Support code for the `mdm` binary: file configuration and the persisted
//! resource repository the CLI feeds the linking core with.

pub mod config;
pub mod resources;

pub use config::MdmConfig;
pub use resources::RedbRepository;
