use agentboard::core::error::BoardError;
use anyhow::Context;
use std::process::ExitCode;

/// Exit status for a command that lost a claim or lock race.
const EXIT_BLOCKED: u8 = 3;

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let blocked = err
                .downcast_ref::<BoardError>()
                .is_some_and(BoardError::is_blocked);
            if blocked {
                ExitCode::from(EXIT_BLOCKED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn try_main() -> anyhow::Result<()> {
    agentboard::run().context("agentboard")?;
    Ok(())
}
