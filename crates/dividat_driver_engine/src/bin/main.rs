use argh::FromArgs;
use dividat_driver_engine::{DriverEngine, EngineOptions, EngineOptionsBuilder, tools};
use dividat_driver_server::senso::firmware;
use std::{path::Path, process::ExitCode};
use tokio::{fs, select, signal::ctrl_c};
use tracing::{Level, info};
use tracing_subscriber::{
  filter::{EnvFilter, LevelFilter},
  layer::SubscriberExt,
  util::SubscriberInitExt,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// hardware bridge daemon for Dividat Senso and Flex devices.
#[derive(FromArgs)]
pub struct DriverCliArguments {
  /// print version and exit.
  #[argh(switch)]
  version: bool,

  /// port of the localhost gateway (defaults to 8382).
  #[argh(option, default = "8382")]
  port: u16,

  /// origin permitted to connect to the gateway; may be repeated.
  #[argh(option)]
  permissible_origin: Vec<String>,

  /// enable the mock-device HTTP routes (debug builds only).
  #[argh(switch)]
  test_mode: bool,

  /// senso address to connect to at startup.
  #[argh(option)]
  senso_address: Option<String>,

  /// set log level for output.
  #[argh(option)]
  log: Option<Level>,

  #[argh(subcommand)]
  command: Option<DriverSubcommand>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum DriverSubcommand {
  Firmware(FirmwareArgs),
  Record(RecordArgs),
  Replay(ReplayArgs),
}

/// capture binary frames from a running driver into a recording file.
#[derive(FromArgs)]
#[argh(subcommand, name = "record")]
struct RecordArgs {
  /// output file.
  #[argh(option, short = 'o')]
  output: String,

  /// device endpoint to record (defaults to flex).
  #[argh(option, default = "\"flex\".to_owned()")]
  endpoint: String,

  /// port of the running driver (defaults to 8382).
  #[argh(option, default = "8382")]
  port: u16,
}

/// replay a recording into a virtual TTY.
#[derive(FromArgs)]
#[argh(subcommand, name = "replay")]
struct ReplayArgs {
  /// recording file.
  #[argh(option, short = 'i')]
  input: String,

  /// path of the virtual TTY to write to.
  #[argh(option)]
  tty: String,

  /// speed factor; 2 halves the recorded delays (defaults to 1).
  #[argh(option, default = "1.0")]
  speed: f64,
}

/// firmware maintenance.
#[derive(FromArgs)]
#[argh(subcommand, name = "firmware")]
struct FirmwareArgs {
  #[argh(subcommand)]
  action: FirmwareAction,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum FirmwareAction {
  Update(FirmwareUpdateArgs),
}

/// transfer a firmware image to a Senso. The target is given by address or
/// serial number; with neither, the first Senso discovered via mDNS is used.
#[derive(FromArgs)]
#[argh(subcommand, name = "update")]
struct FirmwareUpdateArgs {
  /// path of the firmware image file.
  #[argh(option, short = 'i')]
  image: String,

  /// address of the target Senso.
  #[argh(option, short = 'a')]
  address: Option<String>,

  /// serial number of the target Senso.
  #[argh(option, short = 's')]
  serial: Option<String>,
}

fn setup_console_logging(log_level: Option<Level>) {
  if log_level.is_some() {
    tracing_subscriber::registry()
      .with(tracing_subscriber::fmt::layer())
      .with(LevelFilter::from(log_level))
      .try_init()
      .unwrap();
  } else {
    tracing_subscriber::registry()
      .with(tracing_subscriber::fmt::layer())
      .with(
        EnvFilter::try_from_default_env()
          .or_else(|_| EnvFilter::try_new("info"))
          .unwrap(),
      )
      .try_init()
      .unwrap();
  }
}

impl From<&DriverCliArguments> for EngineOptions {
  fn from(args: &DriverCliArguments) -> Self {
    let mut builder = EngineOptionsBuilder::default();
    builder.port(args.port).test_mode(args.test_mode);
    for origin in &args.permissible_origin {
      builder.permissible_origin(origin);
    }
    if let Some(address) = &args.senso_address {
      builder.senso_address(address);
    }
    builder.finish()
  }
}

async fn run_firmware_update(args: &FirmwareUpdateArgs) -> ExitCode {
  let image = match fs::read(&args.image).await {
    Ok(image) => image,
    Err(err) => {
      println!("Cannot read firmware image {}: {}", args.image, err);
      return ExitCode::from(1);
    }
  };
  let progress = |message: String| println!("{}", message);
  match firmware::update(
    &image,
    args.serial.as_deref(),
    args.address.as_deref(),
    &progress,
  )
  .await
  {
    Ok(()) => {
      println!("Firmware update finished");
      ExitCode::SUCCESS
    }
    Err(err) => {
      println!("Firmware update failed: {}", err);
      ExitCode::from(1)
    }
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  let args: DriverCliArguments = argh::from_env();
  if args.version {
    println!("{}", VERSION);
    return ExitCode::SUCCESS;
  }

  setup_console_logging(args.log);

  match &args.command {
    Some(DriverSubcommand::Firmware(firmware_args)) => {
      let FirmwareAction::Update(update_args) = &firmware_args.action;
      return run_firmware_update(update_args).await;
    }
    Some(DriverSubcommand::Record(record_args)) => {
      let url = format!("ws://127.0.0.1:{}/{}", record_args.port, record_args.endpoint);
      let recording = tools::record(&url, Path::new(&record_args.output));
      select! {
        result = recording => {
          if let Err(err) = result {
            println!("Recording failed: {}", err);
            return ExitCode::from(1);
          }
        }
        _ = ctrl_c() => info!("Recording stopped."),
      }
      return ExitCode::SUCCESS;
    }
    Some(DriverSubcommand::Replay(replay_args)) => {
      if let Err(err) = tools::replay(
        Path::new(&replay_args.input),
        Path::new(&replay_args.tty),
        replay_args.speed,
      )
      .await
      {
        println!("Replay failed: {}", err);
        return ExitCode::from(1);
      }
      return ExitCode::SUCCESS;
    }
    None => {}
  }

  let options = EngineOptions::from(&args);
  let engine = DriverEngine::default();
  select! {
    result = engine.run(&options) => {
      if let Err(err) = result {
        println!("Driver errored while running:");
        println!("{:?}", err);
        return ExitCode::from(1);
      }
    }
    _ = ctrl_c() => {
      info!("Control-c hit, exiting.");
      engine.stop();
    }
  }
  ExitCode::SUCCESS
}
