use anyhow::{Context, bail};
use clap::Parser;
use norsu::{Config, Rsu, SptAddresses};
use norsu_hal::Platform;
use std::path::PathBuf;

mod logger;
mod platform;

use platform::{FileFlash, SimFirmware, SimMailbox};

/// RSU client over a flash image file.
#[derive(Debug, Parser)]
#[command(name = "norsu", version)]
struct Args {
    /// Flash image file standing in for the QSPI device.
    ///
    /// Overrides the configuration file's `root qspi` entry.
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Configuration file (default /etc/librsu.rc when present).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Flash address of SPT0, as the firmware would report it.
    #[arg(long, default_value_t = 0x0010_0000, value_parser = parse_addr)]
    spt0: u64,

    /// Flash address of SPT1, as the firmware would report it.
    #[arg(long, default_value_t = 0x0010_8000, value_parser = parse_addr)]
    spt1: u64,

    /// Flash address the simulated firmware reports as currently running.
    #[arg(long, default_value_t = 0, value_parser = parse_addr)]
    current_image: u64,

    /// Log at debug level regardless of the configuration.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// List every slot with its offset, size and priority.
    List,
    /// Show one slot.
    Info { slot: usize },
    /// Program an image into a slot.
    Program {
        slot: usize,
        file: PathBuf,
        /// Skip the image pipeline and the priority append.
        #[arg(long)]
        raw: bool,
    },
    /// Compare a slot against an image file.
    Verify {
        slot: usize,
        file: PathBuf,
        #[arg(long)]
        raw: bool,
    },
    /// Erase a slot and drop it from the priority chain.
    Erase { slot: usize },
    /// Set a slot to the highest boot priority.
    Enable { slot: usize },
    /// Drop a slot from the priority chain.
    Disable { slot: usize },
    /// Create a new slot.
    Create {
        name: String,
        #[arg(value_parser = parse_addr)]
        address: u64,
        #[arg(value_parser = parse_addr)]
        size: u64,
    },
    /// Delete a slot.
    Delete { slot: usize },
    /// Rename a slot.
    Rename { slot: usize, name: String },
    /// Copy a slot's contents to a file.
    Copy { slot: usize, file: PathBuf },
    /// Ask the firmware to boot a slot after the next reboot.
    Request { slot: usize },
    /// Ask the firmware to boot the factory image after the next reboot.
    RequestFactory,
    /// Save the SPT to a file.
    SaveSpt { file: PathBuf },
    /// Restore the SPT from a file.
    RestoreSpt { file: PathBuf },
    /// Save the CPB to a file.
    SaveCpb { file: PathBuf },
    /// Restore the CPB from a file.
    RestoreCpb { file: PathBuf },
    /// Rebuild an empty CPB.
    EmptyCpb,
    /// Show the firmware status report.
    Status,
    /// Send a notify value to the firmware.
    Notify {
        #[arg(value_parser = parse_addr)]
        value: u64,
    },
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("{err}"))
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None if std::path::Path::new(norsu::DEFAULT_CONFIG_PATH).exists() => {
            Config::from_file(norsu::DEFAULT_CONFIG_PATH).context("loading default configuration")
        }
        None => Ok(Config::default()),
    }
}

fn open_session(args: &Args, config: Config) -> anyhow::Result<Rsu> {
    let image = match (&args.image, &config.device) {
        (Some(path), _) => path.clone(),
        (None, Some(norsu::DeviceNode::Qspi(path))) => path.clone(),
        (None, Some(norsu::DeviceNode::Sysfs(_))) | (None, None) => {
            bail!("no flash image given; pass --image or configure `root qspi`")
        }
    };

    let flash = FileFlash::open(&image)
        .with_context(|| format!("opening flash image {}", image.display()))?;
    let mailbox = SimMailbox::new(
        SptAddresses {
            spt0: args.spt0,
            spt1: args.spt1,
        },
        args.current_image,
    );

    let platform = Platform {
        flash: Box::new(flash),
        mailbox: Box::new(mailbox),
        firmware: Box::new(SimFirmware),
    };

    Rsu::open(platform, config).context("opening the RSU session")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args)?;
    logger::init(&config.log, args.verbose)?;

    let rsu = open_session(&args, config)?;

    match args.cmd {
        Command::List => {
            let count = rsu.slot_count()?;
            println!("{count} slots");
            for slot in 0..count {
                let info = rsu.slot_get_info(slot)?;
                println!(
                    "{slot:3}  {:<16} {:#010x}  {:>9}  priority {}",
                    info.name, info.offset, info.size, info.priority
                );
            }
        }
        Command::Info { slot } => {
            let info = rsu.slot_get_info(slot)?;
            println!("name:     {}", info.name);
            println!("offset:   {:#010x}", info.offset);
            println!("size:     {}", info.size);
            println!("priority: {}", info.priority);
        }
        Command::Program { slot, file, raw } => {
            if raw {
                rsu.slot_program_file_raw(slot, &file)?;
            } else {
                rsu.slot_program_file(slot, &file)?;
            }
            println!("programmed slot {slot} from {}", file.display());
        }
        Command::Verify { slot, file, raw } => {
            if raw {
                rsu.slot_verify_file_raw(slot, &file)?;
            } else {
                rsu.slot_verify_file(slot, &file)?;
            }
            println!("slot {slot} matches {}", file.display());
        }
        Command::Erase { slot } => rsu.slot_erase(slot)?,
        Command::Enable { slot } => rsu.slot_enable(slot)?,
        Command::Disable { slot } => rsu.slot_disable(slot)?,
        Command::Create {
            name,
            address,
            size,
        } => rsu.slot_create(&name, address, u32::try_from(size)?)?,
        Command::Delete { slot } => rsu.slot_delete(slot)?,
        Command::Rename { slot, name } => rsu.slot_rename(slot, &name)?,
        Command::Copy { slot, file } => rsu.slot_copy_to_file(slot, &file)?,
        Command::Request { slot } => rsu.slot_load_after_reboot(slot)?,
        Command::RequestFactory => rsu.slot_load_factory_after_reboot()?,
        Command::SaveSpt { file } => rsu.save_spt(&file)?,
        Command::RestoreSpt { file } => rsu.restore_spt(&file)?,
        Command::SaveCpb { file } => rsu.save_cpb(&file)?,
        Command::RestoreCpb { file } => rsu.restore_cpb(&file)?,
        Command::EmptyCpb => rsu.create_empty_cpb()?,
        Command::Status => {
            let info = rsu.status_log()?;
            println!("version:        {:#x}", info.version);
            println!("state:          {:#x}", info.state);
            println!("current image:  {:#010x}", info.current_image);
            println!("fail image:     {:#010x}", info.fail_image);
            println!("error location: {:#x}", info.error_location);
            println!("error details:  {:#x}", info.error_details);
            println!("retry counter:  {}", info.retry_counter);
        }
        Command::Notify { value } => rsu.notify(value as u32)?,
    }

    Ok(())
}
