pub mod anthropic;
pub mod mock;
