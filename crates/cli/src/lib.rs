//! `procrastinate-cli`: command-line front-end.
//!
//! The `procrastinate` binary drives an app holding only the builtin tasks:
//! it can defer any task by name (`defer --unknown`), apply the schema,
//! inspect jobs and run workers for the builtins. Applications embed
//! [`run`] with their own [`App`](procrastinate_infra::App) to run workers
//! for their tasks, as `procrastinate-demo` does.

pub mod commands;
pub mod demo;
pub mod shell;

pub use commands::{
    Cli, Command, DeferArgs, EXIT_ALREADY_ENQUEUED, GlobalArgs, Outcome, SchemaArgs, WorkerArgs,
    load_json_args, run,
};
pub use shell::Shell;
