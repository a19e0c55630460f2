//! A process-supervisor runtime for a multi-process network service: it
//! bootstraps listening sockets inherited from its environment, forks and
//! manages worker processes, and maintains the process/port registries that
//! make those workers addressable.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod address;
pub mod cli;
pub mod engine;
pub mod environment;
pub mod listen_socket;
pub mod log_file;
pub mod pid_file;
pub mod registry;
pub mod signals;
pub mod socket_inheritance;
pub mod supervisor;

pub use address::SocketAddress;
pub use cli::{Cli, Config};
pub use environment::Environment;
pub use supervisor::{ProcessRole, Supervisor, SupervisorState};
