//! Prints the memory plan of an alt-os executable as JSON
//!
//! Usage: `exeinfo <executable> [config.json]`

use altos_code::{
    elf::{ExecutableCode, SectionMemoryInfo},
    program::Loader,
    runtime::Config,
};
use serde::Serialize;
use std::{env, fs, process::exit, sync::Arc};

#[derive(Serialize)]
struct ExecutableInfo {
    shared_size: u64,
    unshared_size: u64,
    size: u64,
    plt_entries: u64,
    got_entries: u64,
    sections: SectionMemoryInfo,
}

fn main() {
    let args = env::args().collect::<Vec<_>>();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("usage: {} <executable> [config.json]", args[0]);
        exit(2);
    }

    let config = match args.get(2) {
        Some(path) => {
            let json = fs::read_to_string(path).unwrap_or_else(|err| {
                eprintln!("failed to read {}: {}", path, err);
                exit(1);
            });
            Config::from_json(&json).unwrap_or_else(|err| {
                eprintln!("invalid config {}: {}", path, err);
                exit(1);
            })
        }
        None => Config::default(),
    };

    let executable =
        ExecutableCode::from_file_with_loader(&args[1], Arc::new(Loader::new(config)))
            .unwrap_or_else(|err| {
                eprintln!("{}: {}", args[1], err);
                exit(1);
            });

    let info = ExecutableInfo {
        shared_size: executable.shared_size(),
        unshared_size: executable.unshared_size(),
        size: executable.size(),
        plt_entries: executable.plt_entry_count(),
        got_entries: executable.got_entry_count(),
        sections: *executable.section_info(),
    };
    match serde_json::to_string_pretty(&info) {
        Ok(json) => println!("{}", json),
        Err(err) => {
            eprintln!("failed to serialize: {}", err);
            exit(1);
        }
    }
}
