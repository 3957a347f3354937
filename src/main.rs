use clap::Parser;

use vmdrive::cli::{Cli, Command};
use vmdrive::config;
use vmdrive::error::VmError;
use vmdrive::logging;
use vmdrive::orchestrator::Orchestrator;
use vmdrive::package::PackageRequest;
use vmdrive::paths;
use vmdrive::platform::HostPlatform;
use vmdrive::power::PowerVerb;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let log_file = logging::init(cli.verbose);

    let config = config::load_or_default(cli.config.as_deref(), &paths::default_config_path())?;
    let file_target = cli
        .log_file
        .clone()
        .or_else(|| config.logging.file.as_ref().map(Into::into));
    if let Some(path) = file_target {
        log_file.open(&path).map_err(|source| VmError::Io {
            context: format!("opening log file {}", path.display()),
            source,
        })?;
    }

    let platform = HostPlatform::detect();
    let mut orchestrator = Orchestrator::from_config(&config, platform)?;
    cli.run.apply(orchestrator.options_mut());

    let outcome = dispatch(&orchestrator, cli.command).await;
    let closed = orchestrator.shutdown().await;
    let exit_code = outcome?;
    closed?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Run one subcommand. Returns the process exit code for guest-executing commands.
async fn dispatch(orchestrator: &Orchestrator, command: Command) -> Result<i32, VmError> {
    match command {
        Command::Vms => {
            for vm in orchestrator.list_guests().await? {
                match &vm.remote_id {
                    Some(id) => println!("{}\t{}\t{}", vm.nickname, id, vm.path.display()),
                    None => println!("{}\t{}", vm.nickname, vm.path.display()),
                }
            }
        }
        Command::Power { vm, verb, wait } => {
            let state = match verb {
                Some(verb) => {
                    let verb = PowerVerb::parse(&verb)?;
                    orchestrator.set_power(&vm, verb, wait).await?
                }
                None => orchestrator.power_state(&vm).await?,
            };
            println!("{state}");
        }
        Command::Ready { vm } => {
            let attempts = orchestrator.wait_until_ready(&vm).await?;
            println!("ready after {attempts} attempt(s)");
        }
        Command::Run { vm, program, args } => {
            let out = orchestrator.run_program(&vm, &program, &args).await?;
            print!("{}", out.stdout);
            return Ok(out.exit_code);
        }
        Command::Script { vm, script } => {
            let out = orchestrator.run_script(&vm, &script).await?;
            print!("{}", out.stdout);
            return Ok(out.exit_code);
        }
        Command::RunPackage {
            vm,
            dir,
            entry,
            args,
            output,
            tail_port,
        } => {
            let mut request = PackageRequest::new(dir, entry);
            request.entry_args = args;
            request.output_log = output;
            request.tail_port = tail_port;

            let result = orchestrator.run_package(&vm, &request).await?;
            // Streamed lines were already logged as they arrived.
            if result.streamed.is_none() {
                print!("{}", result.output);
            }
            if let Some(err) = result.guest_error() {
                tracing::error!(vm = %vm, "{err}");
            }
            for warning in &result.cleanup_warnings {
                eprintln!("warning: {warning}");
            }
            return Ok(result.exit_code);
        }
        Command::CopyTo { vm, local, remote } => {
            orchestrator.copy_to_guest(&vm, &local, &remote).await?;
        }
        Command::CopyFrom { vm, remote, local } => {
            orchestrator.copy_from_guest(&vm, &remote, &local).await?;
        }
        Command::Ip { vm } => println!("{}", orchestrator.ip_address(&vm).await?),
        Command::Mac { vm } => println!("{}", orchestrator.mac_address(&vm).await?),
        Command::Settings { vm } => {
            let settings = orchestrator.vm_settings(&vm).await?;
            println!("cpus: {}", settings.cpus);
            println!("memory: {} MB", settings.memory_mb);
        }
        Command::Clone { vm, name, dir } => {
            let clone = orchestrator.clone_vm(&vm, &name, dir.as_deref()).await?;
            println!("{}", clone.path.display());
        }
        Command::Delete { vm, shutdown } => {
            orchestrator.delete_vm(&vm, shutdown).await?;
        }
    }
    Ok(0)
}
