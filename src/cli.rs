use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "vmdrive", about = "Run programs and packages inside VMware guests")]
pub struct Cli {
    /// Path to config file (default: <config dir>/vmdrive/vmdrive.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also append debug logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub run: RunFlags,

    #[command(subcommand)]
    pub command: Command,
}

/// Overrides for the `[run]` config section.
#[derive(Args, Debug, Default, Clone)]
pub struct RunFlags {
    /// Work in a throwaway clone of the guest
    #[arg(long, global = true)]
    pub clone: bool,

    /// Keep the clone afterwards
    #[arg(long, global = true)]
    pub keep: bool,

    /// Keep temp dirs and have the launcher write diagnostics
    #[arg(long, global = true)]
    pub debug: bool,

    /// Readiness probe attempts
    #[arg(long, global = true)]
    pub tries: Option<u32>,

    /// Seconds between readiness probes
    #[arg(long, global = true)]
    pub sleep: Option<u64>,

    /// Limit on guest execution, in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Run guest programs in the interactive session
    #[arg(long, global = true)]
    pub interactive: bool,

    /// Do not power on and wait for the guest first
    #[arg(long, global = true)]
    pub no_ensure: bool,
}

impl RunFlags {
    pub fn apply(&self, options: &mut RunOptions) {
        options.clone |= self.clone;
        options.keep_clone |= self.keep;
        options.debug |= self.debug;
        options.interactive |= self.interactive;
        if self.no_ensure {
            options.ensure_ready = false;
        }
        if let Some(tries) = self.tries {
            options.num_tries = tries.max(1);
        }
        if let Some(sleep) = self.sleep {
            options.sleep = std::time::Duration::from_secs(sleep);
        }
        if let Some(timeout) = self.timeout.filter(|t| *t > 0) {
            options.exec_timeout = Some(std::time::Duration::from_secs(timeout));
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List known guests
    Vms,

    /// Show the power state, or change it
    Power {
        vm: String,
        /// start | stop | shutdown | suspend | pause | unpause
        verb: Option<String>,
        /// After start/unpause, wait until the guest can run programs
        #[arg(long)]
        wait: bool,
    },

    /// Wait until the guest can run programs
    Ready { vm: String },

    /// Run a program in the guest
    Run {
        vm: String,
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run a script through the guest's interpreter
    Script { vm: String, script: String },

    /// Ship a directory to the guest and run its entry command
    RunPackage {
        vm: String,
        dir: PathBuf,
        entry: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Write the captured output here as well
        #[arg(long)]
        output: Option<PathBuf>,
        /// Stream output live on this host port (0 = any)
        #[arg(long)]
        tail_port: Option<u16>,
    },

    /// Copy a host file into the guest
    CopyTo {
        vm: String,
        local: PathBuf,
        remote: String,
    },

    /// Copy a guest file to the host
    CopyFrom {
        vm: String,
        remote: String,
        local: PathBuf,
    },

    /// Print the guest's IP address
    Ip { vm: String },

    /// Print the guest's MAC address
    Mac { vm: String },

    /// Print CPU and memory settings
    Settings { vm: String },

    /// Create a persistent clone
    Clone {
        vm: String,
        name: String,
        /// Directory to create the clone in (default: next to the source)
        #[arg(long = "where")]
        dir: Option<PathBuf>,
    },

    /// Delete a guest
    Delete {
        vm: String,
        /// Power the guest off first
        #[arg(long)]
        shutdown: bool,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn run_package_keeps_hyphenated_entry_args() {
        let cli = Cli::try_parse_from([
            "vmdrive",
            "--clone",
            "run-package",
            "builder",
            "./work",
            "run.sh",
            "--fast",
            "-n",
            "3",
        ])
        .unwrap();
        assert!(cli.run.clone);
        match cli.command {
            Command::RunPackage { entry, args, .. } => {
                assert_eq!(entry, "run.sh");
                assert_eq!(args, vec!["--fast", "-n", "3"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn flags_override_options() {
        let flags = RunFlags {
            tries: Some(3),
            sleep: Some(0),
            timeout: Some(60),
            no_ensure: true,
            keep: true,
            ..RunFlags::default()
        };
        let mut options = RunOptions::default();
        flags.apply(&mut options);
        assert_eq!(options.num_tries, 3);
        assert_eq!(options.sleep, Duration::ZERO);
        assert_eq!(options.exec_timeout, Some(Duration::from_secs(60)));
        assert!(!options.ensure_ready);
        assert!(options.keeps_resources());
    }
}
