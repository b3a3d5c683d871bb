//! Discord adapter: gateway events in, REST calls and admin tools out.

pub mod authz;
pub mod components;
pub mod error;
pub mod event;
pub mod gateway;
pub mod rest;
pub mod tools;

pub use authz::Authorizer;
pub use error::DiscordError;
pub use gateway::GatewayClient;
pub use rest::DiscordRest;
pub use tools::all_tools;
