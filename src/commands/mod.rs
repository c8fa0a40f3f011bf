/*!
Command handlers for the CLI

- `config` -- validate and print the effective configuration
- `tokens` -- inspect or delete stored credential sets
- `flow`   -- manage the suspended authorization-code continuation

Handlers open the configured storage backend themselves; nothing here talks
to the remote backend.
*/

pub mod config;
pub mod flow;
pub mod tokens;
