pub mod gateway;
pub mod parser;

pub use gateway::{CommandGateway, CommandOutcome};
pub use parser::{ParsedCommand, SlashCommand, parse_slash_command};
