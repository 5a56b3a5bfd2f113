//! Renders the `selfhosted` manual pages.
//!
//! One page covers the top-level command, with the DNS modes and environment
//! variables; each subcommand (`deploy`, `apps`, `sizes`, `regions`) gets its
//! own `selfhosted-<name>.1` page. Pages land in `OUT_DIR/man`.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

const MANUAL: &str = "selfhosted manual";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir =
        PathBuf::from(env::var_os("OUT_DIR").ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
        })?);
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let root = Cli::command();
    write_page(&man_dir, root.clone())?;
    for sub in root.get_subcommands() {
        let page_name = format!("{}-{}", root.get_name(), sub.get_name());
        write_page(&man_dir, sub.clone().name(page_name))?;
    }

    Ok(())
}

fn write_page(dir: &Path, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let file_name = format!("{}.1", command.get_name());
    let mut buffer = Vec::new();
    Man::new(command).manual(MANUAL).render(&mut buffer)?;
    fs::write(dir.join(file_name), buffer)?;
    Ok(())
}
