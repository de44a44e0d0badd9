/// Blockchain communication module
/// Handles daemon RPC, block templates and generation transactions

pub mod daemon;
pub mod template;
pub mod transactions;

pub use daemon::{CommandResult, DaemonEndpoint, DaemonInitError, DaemonInterface, RpcError};
pub use template::{BlockTemplate, TemplateTransaction};
pub use transactions::{GenerationBuilder, GenerationTx, Recipient, StandardGenerationBuilder};
