//! `roti-master` command line.
//!
//! ```bash
//! roti-master --mock run recipes/dak.toml
//! roti-master --config config/bench.toml status vt
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::try_join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use roti_master::config::{MasterConfig, DEFAULT_CONFIG_PATH};
use roti_master::logging;
use roti_master::modules::{dispenser, Context as FirmwareContext, Drivers};
use roti_master::sequencer::{parse_recipe, ModuleTag, Recipe, Step, StepSequencer};
use roti_master::transport::{MockLink, SlaveLink, Transport};

#[derive(Parser, Debug)]
#[command(name = "roti-master", version, about = "Roti machine master-board controller")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Talk to a simulated idle board instead of the serial port
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the slave firmware version
    Version,
    /// Run a recipe file (.json descriptor list or .toml recipe)
    Run {
        recipe: PathBuf,
        /// Modules whose steps are skipped
        #[arg(long, value_delimiter = ',')]
        disable: Vec<String>,
    },
    /// Print one module's status
    Status { module: String },
    /// Switch the slave firmware context
    SwitchContext {
        #[arg(value_enum)]
        target: ContextArg,
    },
    /// List serial ports
    Ports,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ContextArg {
    Bootloader,
    Application,
}

impl From<ContextArg> for FirmwareContext {
    fn from(arg: ContextArg) -> Self {
        match arg {
            ContextArg::Bootloader => FirmwareContext::Bootloader,
            ContextArg::Application => FirmwareContext::Application,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        MasterConfig::load_from(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        MasterConfig::default()
    };
    logging::init(&config.application);
    info!(config = %cli.config.display(), mock = cli.mock, "starting {}", config.application.name);

    if let Command::Ports = cli.command {
        return list_ports();
    }

    if cli.mock {
        return dispatch(cli.command, &config, MockLink::dry_run()).await;
    }
    open_serial(cli.command, &config).await
}

#[cfg(feature = "serial")]
async fn open_serial(command: Command, config: &MasterConfig) -> Result<()> {
    use roti_master::transport::SerialLink;

    let link = SerialLink::open(&config.transport.port, config.transport.baud_rate)
        .with_context(|| format!("opening {}", config.transport.port))?;
    dispatch(command, config, link).await
}

#[cfg(not(feature = "serial"))]
async fn open_serial(_command: Command, _config: &MasterConfig) -> Result<()> {
    bail!("built without the `serial` feature; pass --mock to use a simulated board")
}

#[cfg(feature = "serial")]
fn list_ports() -> Result<()> {
    for port in roti_master::transport::SerialLink::available_ports()? {
        println!("{port}");
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn list_ports() -> Result<()> {
    bail!("built without the `serial` feature")
}

async fn dispatch<L: SlaveLink + 'static>(
    command: Command,
    config: &MasterConfig,
    link: L,
) -> Result<()> {
    let transport = Transport::with_policy(link, config.transport.resend_policy())
        .with_command_timeout(config.transport.command_timeout());
    let drivers = Arc::new(Drivers::with_timing(Arc::new(transport), &config.timing));

    match command {
        Command::Version => match drivers.who_am_i.version().await? {
            Some(version) => println!("{version}"),
            None => bail!("slave rejected the version request"),
        },
        Command::Run { recipe, disable } => {
            let steps = load_steps(&recipe)?;
            let tags = disable
                .iter()
                .map(|name| name.parse::<ModuleTag>())
                .collect::<Result<Vec<_>, _>>()?;

            let mut sequencer = StepSequencer::from_config(drivers, config);
            sequencer.gate_mut().disable_modules(&tags);

            let (code, elapsed) = sequencer.execute(&steps).await?;
            println!("{code} after {:.1} s", elapsed.as_secs_f64());
            if !code.is_ok() {
                std::process::exit(code as i32);
            }
        }
        Command::Status { module } => print_status(&drivers, module.parse()?).await?,
        Command::SwitchContext { target } => {
            if !drivers.switch_context.switch_to(target.into()).await? {
                bail!("slave rejected the context switch");
            }
            println!("switched to {:?}", target);
        }
        Command::Ports => list_ports()?,
    }
    Ok(())
}

fn load_steps(path: &Path) -> Result<Vec<Step>> {
    let steps = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        parse_recipe(&text)?
    } else {
        let recipe = Recipe::from_toml_file(path)?;
        info!(recipe = %recipe.name, steps = recipe.steps.len(), "recipe loaded");
        recipe.steps
    };
    Ok(steps)
}

async fn print_status<L: SlaveLink>(drivers: &Drivers<L>, tag: ModuleTag) -> Result<()> {
    match tag {
        ModuleTag::Kneader => println!("{:#?}", drivers.kneader.status().await?),
        ModuleTag::Dispenser => {
            let ids = [dispenser::ID_FLOUR, dispenser::ID_WATER, dispenser::ID_OIL];
            let statuses =
                try_join_all(ids.into_iter().map(|id| drivers.dispenser.status(id))).await?;
            for status in statuses {
                println!("{status:#?}");
            }
        }
        ModuleTag::VerticalTray => println!("{:#?}", drivers.vertical_tray.status().await?),
        ModuleTag::WedgePress => println!("{:#?}", drivers.wedge_press.status().await?),
        ModuleTag::Kicker => println!("{:#?}", drivers.kicker.status().await?),
        ModuleTag::Heater | ModuleTag::Fan => println!("{:#?}", drivers.heater.status().await?),
        ModuleTag::Sleep => bail!("sleep has no status"),
    }
    Ok(())
}
