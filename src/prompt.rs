//! Asking the operator before doing anything destructive.

use anyhow::Context as _;
use std::io::{self, BufRead, IsTerminal, Write};
use tracing::warn;

/// Asks a yes/no question on the terminal. Anything but a yes is a no, and
/// so is not having a terminal to ask on.
pub(crate) fn confirm(question: &str) -> anyhow::Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        warn!("You can only do this from a terminal");
        return Ok(false);
    }
    print!("{question} ");
    io::stdout().flush().context("Writing to standard output")?;
    read_answer(&mut stdin.lock())
}

fn read_answer(input: &mut impl BufRead) -> anyhow::Result<bool> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Error reading standard input")?;
    Ok(line.trim_start().starts_with(['Y', 'y']))
}
