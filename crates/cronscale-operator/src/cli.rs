//! Command line interface of the operator, built with `clap`.
//!
//! ```
//! use clap::Parser;
//! use cronscale_operator::cli::{Command, Opts};
//!
//! let opts = Opts::parse_from(["cronscale-operator", "run", "--watch-namespace", "shop,web"]);
//! assert!(matches!(opts.command, Command::Run(_)));
//! ```
use std::net::SocketAddr;

use clap::{Args, Parser};

use crate::{
    decision::OverlapPolicy,
    driver::LoopConfig,
    logging::LogFormat,
    namespace::WatchNamespaces,
    utils::retry::RetryConfig,
};

pub const APP_NAME: &str = "cronscale-operator";

#[derive(Debug, Parser)]
#[command(
    name = "CronScale Operator",
    version,
    about = "Enforces time windowed replica bounds on HorizontalPodAutoscalers and workloads"
)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

/// Commands of the operator.
#[derive(Debug, PartialEq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print the CronScale CustomResourceDefinition.
    Crd,

    /// Run the operator.
    Run(Run),
}

#[derive(Debug, PartialEq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Comma separated namespaces to reconcile, each in its own control loop. Reconciles all
    /// namespaces in a single loop when empty.
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespaces,

    /// Name used to identify writes of this operator in managedFields.
    #[arg(long, env, default_value = APP_NAME)]
    pub field_manager: String,

    /// Address the health endpoints are served on.
    #[arg(long, env, default_value = "0.0.0.0:8081")]
    pub health_bind_address: SocketAddr,

    /// Format of the log output on stdout.
    #[arg(long, env, value_enum, default_value_t = LogFormat::default())]
    pub log_format: LogFormat,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub control_loop: ControlLoopOptions,

    #[command(flatten)]
    pub retry: RetryOptions,
}

#[derive(Debug, PartialEq, Args)]
#[command(next_help_heading = "Control Loop Options")]
pub struct ControlLoopOptions {
    /// Maximum time between two reconciliation passes.
    #[arg(long, env, default_value = "30s")]
    pub tick_interval: humantime::Duration,

    /// Upper bound of the random delay added after every pass.
    #[arg(long, env, default_value = "5s")]
    pub max_jitter: humantime::Duration,

    /// Upper bound of the delay after consecutive aborted passes.
    #[arg(long, env, default_value = "5m")]
    pub max_failure_backoff: humantime::Duration,

    /// Which CronScale wins when several active ones govern the same target.
    #[arg(long, env, value_enum, default_value_t = OverlapPolicy::default())]
    pub overlap_policy: OverlapPolicy,
}

#[derive(Debug, PartialEq, Args)]
#[command(next_help_heading = "Write Retry Options")]
pub struct RetryOptions {
    /// Attempts per write, including the first one. Version conflicts are never retried.
    #[arg(long, env, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub write_attempts: u32,

    /// Delay before the first retry of a failed write.
    #[arg(long, env, default_value = "200ms")]
    pub retry_initial_delay: humantime::Duration,

    /// Upper bound of the delay between retries of a failed write.
    #[arg(long, env, default_value = "5s")]
    pub retry_max_delay: humantime::Duration,
}

impl RunArguments {
    pub fn loop_config(&self) -> LoopConfig {
        let options = &self.control_loop;
        LoopConfig {
            tick_interval: options.tick_interval.into(),
            max_jitter: options.max_jitter.into(),
            max_failure_backoff: options.max_failure_backoff.into(),
            overlap_policy: options.overlap_policy,
            retry: RetryConfig {
                max_attempts: self.retry.write_attempts,
                initial_delay: self.retry.retry_initial_delay.into(),
                max_delay: self.retry.retry_max_delay.into(),
                ..RetryConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;
    use crate::namespace::WatchNamespace;

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
        RunArguments::command().debug_assert();
    }

    #[test]
    fn defaults_match_loop_defaults() {
        let Command::Run(run) = Command::<RunArguments>::parse_from([APP_NAME, "run"]) else {
            unreachable!("expected the run command");
        };

        assert_eq!(run.loop_config(), LoopConfig::default());
        assert_eq!(run.watch_namespace.scopes(), vec![WatchNamespace::All]);
        assert_eq!(run.field_manager, APP_NAME);
        assert_eq!(run.log_format, LogFormat::Plain);
    }

    #[rstest]
    #[case(
        &["--tick-interval", "1m"],
        |config: &LoopConfig| config.tick_interval == Duration::from_secs(60)
    )]
    #[case(&["--max-jitter", "0s"], |config: &LoopConfig| config.max_jitter.is_zero())]
    #[case(
        &["--overlap-policy", "highest-replicas"],
        |config: &LoopConfig| config.overlap_policy == OverlapPolicy::HighestReplicas
    )]
    #[case(&["--write-attempts", "5"], |config: &LoopConfig| config.retry.max_attempts == 5)]
    #[case(
        &["--retry-initial-delay", "1s"],
        |config: &LoopConfig| config.retry.initial_delay == Duration::from_secs(1)
    )]
    fn flags_reach_the_loop_config(
        #[case] flags: &[&str],
        #[case] check: fn(&LoopConfig) -> bool,
    ) {
        let args = [APP_NAME, "run"].iter().chain(flags).copied();
        let Command::Run(run) = Command::<RunArguments>::parse_from(args) else {
            unreachable!("expected the run command");
        };

        assert!(check(&run.loop_config()));
    }

    #[test]
    fn zero_write_attempts_are_rejected() {
        let result =
            Command::<RunArguments>::try_parse_from([APP_NAME, "run", "--write-attempts", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn crd_command() {
        assert_eq!(
            Command::<RunArguments>::parse_from([APP_NAME, "crd"]),
            Command::Crd
        );
    }
}
