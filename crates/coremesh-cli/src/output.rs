//! CLI output styling for coremesh

use colored::Colorize;
use coremesh::system_proxy::ProxyEndpoint;
use coremesh::{ProcessRole, RunOutcome, RunPlan};

/// Print the name and version line
pub fn print_banner(silent: bool) {
    if silent {
        return;
    }
    let version = env!("CARGO_PKG_VERSION");
    eprintln!();
    eprintln!(
        " {} {}",
        "coremesh".truecolor(0, 153, 153).bold(),
        format!("v{}", version).white()
    );
    eprintln!();
}

/// Print the processes about to be started, in start order
pub fn print_plan(plan: &RunPlan, verbose: u8, silent: bool) {
    if silent {
        return;
    }

    eprintln!("{}", "Processes:".white().bold());
    for spec in plan.cores.iter().chain(std::iter::once(&plan.edge)) {
        let role = spec.role.to_string();
        let role = match spec.role {
            ProcessRole::CoreProxy => role.cyan(),
            ProcessRole::EdgeProxy => role.truecolor(204, 102, 0),
        };
        if verbose > 0 {
            eprintln!(
                "  {} [{}] {} {}",
                spec.name.white(),
                role,
                spec.program.display().to_string().truecolor(150, 150, 150),
                spec.resolved_args()
                    .join(" ")
                    .truecolor(100, 100, 100),
            );
        } else {
            eprintln!("  {} [{}]", spec.name.white(), role);
        }
    }
    eprintln!();
    eprintln!(
        "{}",
        "Starting. Press Ctrl-C to stop and restore the system proxy.".truecolor(150, 150, 150)
    );
}

/// Print how the run ended
pub fn print_outcome(outcome: &RunOutcome, silent: bool) {
    if silent {
        return;
    }
    match outcome {
        RunOutcome::Completed => {
            eprintln!("{}", "Edge proxy exited. All processes stopped.".green());
        }
        RunOutcome::Cancelled => {
            eprintln!("{}", "Stopped. All processes cleaned up.".green());
        }
        RunOutcome::Failed(_) => {
            eprintln!("{}", "Run aborted. Started processes were cleaned up.".red());
        }
    }
}

/// Print a detected endpoint
pub fn print_endpoint(endpoint: &ProxyEndpoint) {
    println!(
        "{} {}",
        endpoint.protocol.cyan(),
        endpoint.server_address().white().bold()
    );
}
