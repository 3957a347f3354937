use std::path::PathBuf;

use clap::Parser;

/// Command line of the launcher as it is invoked inside the guest.
///
/// `<launcher> [--debug] [--tty <path>] [--tail-log-port <port>]
/// [--tail-log-host <addr>] <archive> <entry_command> <output_log> [entry_args...]`
///
/// The host builds this with [`Invocation::to_args`]; the guest binary parses
/// it back with clap, so both sides share a single definition.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "vmdrive-launcher",
    about = "Unpack a workload archive and run its entry command"
)]
pub struct Invocation {
    /// Write launcher diagnostics to the tty device
    #[arg(long)]
    pub debug: bool,

    /// Device or file that receives debug diagnostics
    #[arg(long)]
    pub tty: Option<String>,

    /// Host port that receives live output lines
    #[arg(long)]
    pub tail_log_port: Option<u16>,

    /// Host address for the tail connection (defaults to 127.0.0.1)
    #[arg(long)]
    pub tail_log_host: Option<String>,

    /// Workload archive (zip or tar)
    pub archive: PathBuf,

    /// Entry command, relative to the unpacked archive root
    pub entry_command: String,

    /// File that receives merged stdout+stderr of the entry command
    pub output_log: PathBuf,

    /// Arguments passed through to the entry command
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub entry_args: Vec<String>,
}

impl Invocation {
    pub fn new(
        archive: impl Into<PathBuf>,
        entry_command: impl Into<String>,
        output_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            debug: false,
            tty: None,
            tail_log_port: None,
            tail_log_host: None,
            archive: archive.into(),
            entry_command: entry_command.into(),
            output_log: output_log.into(),
            entry_args: Vec::new(),
        }
    }

    /// Render the argument vector (without the program name).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.debug {
            args.push("--debug".to_string());
        }
        if let Some(tty) = &self.tty {
            args.push("--tty".to_string());
            args.push(tty.clone());
        }
        if let Some(port) = self.tail_log_port {
            args.push("--tail-log-port".to_string());
            args.push(port.to_string());
        }
        if let Some(host) = &self.tail_log_host {
            args.push("--tail-log-host".to_string());
            args.push(host.clone());
        }
        // Entry args may reuse launcher flag names.
        args.push("--".to_string());
        args.push(self.archive.display().to_string());
        args.push(self.entry_command.clone());
        args.push(self.output_log.display().to_string());
        args.extend(self.entry_args.iter().cloned());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[String]) -> Invocation {
        let argv = std::iter::once("vmdrive-launcher".to_string()).chain(args.iter().cloned());
        Invocation::try_parse_from(argv).unwrap()
    }

    #[test]
    fn minimal_invocation_round_trips() {
        let inv = Invocation::new("/tmp/x/package.tar", "run.sh", "/tmp/x/output.log");
        assert_eq!(
            inv.to_args(),
            vec!["--", "/tmp/x/package.tar", "run.sh", "/tmp/x/output.log"]
        );
        assert_eq!(parse(&inv.to_args()), inv);
    }

    #[test]
    fn flags_precede_positionals() {
        let mut inv = Invocation::new("a.zip", "bin/go", "out.log");
        inv.debug = true;
        inv.tty = Some("/dev/ttys001".into());
        inv.tail_log_port = Some(9000);
        let args = inv.to_args();
        assert_eq!(
            &args[..5],
            &["--debug", "--tty", "/dev/ttys001", "--tail-log-port", "9000"]
        );
        assert_eq!(parse(&args), inv);
    }

    #[test]
    fn hyphenated_entry_args_pass_through() {
        let mut inv = Invocation::new("a.tar", "run.sh", "out.log");
        inv.entry_args = vec!["--verbose".into(), "-x".into(), "plain".into()];
        let parsed = parse(&inv.to_args());
        assert_eq!(parsed.entry_args, vec!["--verbose", "-x", "plain"]);
        assert!(!parsed.debug);
    }

    #[test]
    fn entry_args_named_like_launcher_flags_stay_entry_args() {
        let mut inv = Invocation::new("a.tar", "run.sh", "out.log");
        inv.entry_args = vec![
            "--debug".into(),
            "--tty".into(),
            "x".into(),
            "--tail-log-port".into(),
            "1".into(),
        ];
        let parsed = parse(&inv.to_args());
        assert_eq!(parsed, inv);
        assert!(!parsed.debug);
        assert_eq!(parsed.tty, None);
    }

    #[test]
    fn launcher_flags_and_colliding_entry_args_together() {
        let mut inv = Invocation::new("a.tar", "run.sh", "out.log");
        inv.debug = true;
        inv.tail_log_host = Some("10.0.0.1".into());
        inv.entry_args = vec!["--tail-log-host".into(), "elsewhere".into()];
        assert_eq!(parse(&inv.to_args()), inv);
    }
}
