//! ssh-runner binary entry point.

use std::error::Error;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use ssh_runner::cli::{self, Args};
use ssh_runner::config::Config;
use ssh_runner::transport::{SshTransport, Transport};
use ssh_runner::{logging, CommandResult, CommandRunner, PortForward};
use tracing::{error, info};

/// Exit status when the command's outcome is unknown.
const EXIT_UNKNOWN: u8 = 124;
const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Try 'ssh-runner --help' for more information.");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    // A subscriber may already be installed when embedded; keep going.
    let _ = logging::init_with_filter(config.log_filter());

    let Some(command) = args.command_line() else {
        eprintln!("error: no command given");
        eprintln!("Try 'ssh-runner --help' for more information.");
        return ExitCode::from(EXIT_USAGE);
    };

    match run(&args, &config, command).await {
        Ok(result) => report(&args, &config, &result),
        Err(e) => fail(&*e),
    }
}

/// Report a run failure once, through the log sink, which writes to stderr.
fn fail(e: &dyn Error) -> ExitCode {
    error!("{}", e);
    ExitCode::FAILURE
}

async fn run(
    args: &Args,
    config: &Config,
    command: String,
) -> Result<CommandResult, Box<dyn Error>> {
    let ssh = config.to_ssh_config()?;
    info!("connecting to {}", ssh.address());
    let transport = tokio::task::spawn_blocking(move || SshTransport::connect(&ssh)).await??;
    let transport: Arc<dyn Transport> = Arc::new(transport);

    // Held open until the command is done.
    let mut forwards = Vec::with_capacity(args.forwards.len());
    for spec in &args.forwards {
        let forward = PortForward::open(
            &*transport,
            &spec.remote_host,
            spec.remote_port,
            spec.local_port,
        )?;
        info!("{}", forward);
        forwards.push(forward);
    }

    let runner = Arc::new(
        CommandRunner::new(transport).with_emergency_timeout(config.runner.emergency_timeout()),
    );
    let result = runner
        .run_and_wait_async(command, config.to_run_options())
        .await?;

    for forward in &forwards {
        forward.close();
    }
    Ok(result)
}

fn report(args: &Args, config: &Config, result: &CommandResult) -> ExitCode {
    if args.json {
        match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("error: cannot encode result: {}", e),
        }
    } else if config.runner.capture_output && !config.runner.live_log {
        print!("{}", result.stdout());
        eprint!("{}", result.stderr());
        let _ = std::io::stdout().flush();
    }

    match result.exit_code() {
        Some(code) => ExitCode::from((code & 0xff) as u8),
        None => ExitCode::from(EXIT_UNKNOWN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[derive(Clone, Default)]
    struct EventCount(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for EventCount {
        fn on_event(&self, _event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_failure_reported_once() {
        let count = EventCount::default();
        let subscriber = tracing_subscriber::registry().with(count.clone());
        let err = ssh_runner::RunnerError::transport("connection reset");

        let _ = tracing::subscriber::with_default(subscriber, || fail(&err));

        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }
}
