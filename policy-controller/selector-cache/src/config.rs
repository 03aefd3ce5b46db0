/// Selector cache configuration.
///
/// May be flattened into a host process's command line arguments.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args)]
pub struct Config {
    /// Logs a warning when this many selection notifications are waiting to be delivered.
    #[clap(long = "selector-cache-notify-backlog-warn", default_value = "10000")]
    pub notify_backlog_warn: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            notify_backlog_warn: 10_000,
        }
    }
}
