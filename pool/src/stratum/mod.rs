pub mod banning;
pub mod client;
pub mod protocol;
pub mod proxy;
pub mod server;

pub use banning::{BanStatus, BanTable};
pub use client::{ClientState, StratumClient};
pub use protocol::{ProtocolError, StratumError, StratumNotification, StratumRequest, StratumResponse, SubmitParams};
pub use server::{AcceptAll, Authorizer, ClientHandle, ClientSnapshot, ServerConfig, ServerEvent, StratumServer};
