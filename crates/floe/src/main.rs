//! floe CLI: mirrors source tables into a Fabric Open Mirroring landing zone.

use std::process::ExitCode;

use floe::{Application, Config};

fn main() -> ExitCode {
    Application::<Config>::run()
}
