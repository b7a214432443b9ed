use anyhow::Context;
use healer_monitor::{
    config::Config,
    report::Report,
    run_and_monitor,
    vm::{pool::ProcessPool, ssh::SshConfig, Pool},
    ExecutionRequest,
};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};
use std::{
    path::{Path, PathBuf},
    process::exit,
    thread,
    time::Duration,
};
use structopt::StructOpt;
use tokio::sync::watch;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "healer-monitor",
    about = "Run a command on a test machine and decide whether the kernel survived it."
)]
struct Settings {
    /// Config file, defaults are used if absent.
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Address of an already booted test machine, commands run locally if absent.
    #[structopt(long)]
    ssh_addr: Option<String>,
    #[structopt(long, default_value = "22")]
    ssh_port: u16,
    /// Path to ssh key used for logging to test machine.
    #[structopt(long)]
    ssh_key: Option<PathBuf>,
    /// User name for logging to test machine.
    #[structopt(long, default_value = "root")]
    ssh_user: String,
    /// Command run to diagnose a lost machine, e.g. 'cat /proc/meminfo'.
    #[structopt(long)]
    diagnose: Option<String>,
    /// Path to syz-symbolize.
    #[structopt(long)]
    symbolizer: Option<PathBuf>,
    /// Time budget of the command in seconds.
    #[structopt(short, long, default_value = "600")]
    timeout: u64,
    /// Whether the command is allowed to exit on its own.
    #[structopt(long)]
    can_exit: bool,
    /// Directory to write title, report and output of a non-clean run to.
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Verbose logging, repeat for more.
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
    /// Command to run.
    #[structopt(required = true, last = true)]
    command: Vec<String>,
}

impl Settings {
    fn apply(&self, conf: &mut Config) -> anyhow::Result<()> {
        if let Some(addr) = self.ssh_addr.as_ref() {
            let key = self
                .ssh_key
                .clone()
                .context("--ssh-key is required with --ssh-addr")?;
            conf.instance.ssh = Some(SshConfig {
                addr: addr.clone(),
                port: self.ssh_port,
                key,
                user: self.ssh_user.clone(),
            });
        }
        if self.diagnose.is_some() {
            conf.instance.diagnose = self.diagnose.clone();
        }
        if self.symbolizer.is_some() {
            conf.reporter.symbolizer = self.symbolizer.clone();
        }
        Ok(())
    }

    fn level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();
    TermLogger::init(
        settings.level(),
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("failed to init logger")?;

    let mut conf = match settings.config.as_ref() {
        Some(path) => Config::load(path).context("failed to load config")?,
        None => Config::default(),
    };
    settings.apply(&mut conf)?;
    conf.check().context("bad config")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut signals = Signals::new(&[SIGINT, SIGTERM]).context("failed to listen signals")?;
    thread::Builder::new()
        .name("healer-signal".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("signal {} received, stopping", sig);
                let _ = stop_tx.send(true);
            }
        })
        .context("failed to spawn signal thread")?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let pool = ProcessPool::new(conf.instance.clone());
    let mut inst = pool.create(0).context("failed to create instance")?;
    let reporter = conf.reporter.reporter();
    let req = ExecutionRequest {
        command: settings.command.join(" "),
        timeout: Duration::from_secs(settings.timeout),
        stop: Some(stop_rx),
        can_exit: settings.can_exit,
    };
    let verdict = rt
        .block_on(run_and_monitor(&mut inst, reporter, &conf.monitor, req))
        .context("failed to run command")?;
    // kills whatever the command left behind.
    drop(inst);
    drop(rt);

    println!("{}", verdict);
    if let Some(report) = verdict.report() {
        if let Some(dir) = settings.output.as_ref() {
            save(&report, dir)?;
        }
        exit(1);
    }
    Ok(())
}

fn save(report: &Report, dir: &Path) -> anyhow::Result<()> {
    report
        .save(dir)
        .with_context(|| format!("failed to save report to {}", dir.display()))?;
    log::info!("report saved to {}", dir.display());
    Ok(())
}
