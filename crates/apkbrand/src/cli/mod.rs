pub mod clap_cli;
pub mod program;
