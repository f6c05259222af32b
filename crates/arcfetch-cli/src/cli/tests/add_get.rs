//! Tests for add, get and run subcommands.

use super::parse;
use crate::cli::{Cli, CliCommand};
use arcfetch_core::manager::RedownloadMode;
use clap::Parser;
use std::path::Path;

#[test]
fn cli_parse_add() {
    match parse(&["arcfetch", "add", "https://example.com/file.iso"]) {
        CliCommand::Add { target } => {
            assert_eq!(target.urls, vec!["https://example.com/file.iso"]);
            assert!(target.dir.is_none());
            assert!(target.name.is_none());
            assert_eq!(target.redownload, RedownloadMode::Always);
        }
        _ => panic!("expected Add"),
    }
}

#[test]
fn cli_parse_add_mirrors_and_options() {
    match parse(&[
        "arcfetch",
        "add",
        "https://a.example/x.7z",
        "https://b.example/x.7z",
        "--dir",
        "/tmp",
        "--name",
        "mod.7z",
        "--redownload",
        "never",
    ]) {
        CliCommand::Add { target } => {
            assert_eq!(target.urls.len(), 2);
            assert_eq!(target.dir.as_deref(), Some(Path::new("/tmp")));
            assert_eq!(target.redownload, RedownloadMode::Never);
            let options = target.options();
            assert_eq!(options.file_name.as_deref(), Some("mod.7z"));
            assert_eq!(options.redownload, RedownloadMode::Never);
        }
        _ => panic!("expected Add with options"),
    }
}

#[test]
fn cli_parse_add_requires_url() {
    assert!(Cli::try_parse_from(["arcfetch", "add"]).is_err());
}

#[test]
fn cli_parse_add_rejects_unknown_mode() {
    assert!(Cli::try_parse_from(["arcfetch", "add", "http://h/f", "--redownload", "maybe"]).is_err());
}

#[test]
fn cli_parse_get_with_checksum() {
    match parse(&[
        "arcfetch",
        "get",
        "https://example.com/file.iso",
        "--redownload",
        "replace",
        "--sha256",
        "abc123",
    ]) {
        CliCommand::Get { target, sha256 } => {
            assert_eq!(target.urls, vec!["https://example.com/file.iso"]);
            assert_eq!(target.redownload, RedownloadMode::Replace);
            assert_eq!(sha256.as_deref(), Some("abc123"));
        }
        _ => panic!("expected Get"),
    }
}

#[test]
fn cli_parse_run() {
    assert!(matches!(parse(&["arcfetch", "run"]), CliCommand::Run));
}
