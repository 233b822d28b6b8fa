use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};
use devrun::{
    run::{self, RunOptions},
    usbmuxd::UsbmuxdAddr,
    ClientManager, IdeviceError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("devrun")
        .about("Install and launch apps on connected iOS devices")
        .subcommand_required(true)
        .subcommand(Command::new("list").about("Lists connected devices"))
        .subcommand(
            Command::new("run")
                .about("Installs an .app bundle and launches it")
                .arg(
                    Arg::new("app")
                        .long("app")
                        .value_name("PATH")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Path to the .app bundle"),
                )
                .arg(
                    Arg::new("target")
                        .long("target")
                        .value_name("UDID")
                        .help("UDID of the device, the first connected device if omitted"),
                )
                .arg(
                    Arg::new("connect")
                        .long("connect")
                        .action(ArgAction::SetTrue)
                        .help("Stay attached until the app exits or ctrl-c is pressed"),
                )
                .arg(
                    Arg::new("developer_disk_image")
                        .long("developer-disk-image")
                        .value_name("PATH")
                        .value_parser(value_parser!(PathBuf))
                        .help("Disk image to mount, looked up in DEVELOPER_DIR by default"),
                ),
        )
        .get_matches();

    let res = match matches.subcommand() {
        Some(("list", _)) => list().await,
        Some(("run", sub)) => {
            let app = sub
                .get_one::<PathBuf>("app")
                .cloned()
                .unwrap_or_default();
            let options = RunOptions {
                wait_for_app: sub.get_flag("connect"),
                developer_disk_image: sub.get_one::<PathBuf>("developer_disk_image").cloned(),
                ..Default::default()
            };
            run(app, sub.get_one::<String>("target").cloned(), options).await
        }
        _ => unreachable!("clap requires a subcommand"),
    };

    if let Err(e) = res {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn list() -> Result<(), IdeviceError> {
    let addr = UsbmuxdAddr::from_env_var()?;
    let devices = run::list_devices(&addr).await?;
    if devices.is_empty() {
        println!("No connected devices");
    }
    for d in devices {
        println!(
            "{}  {} ({}, iOS {})",
            d.unique_device_id, d.device_name, d.product_type, d.product_version
        );
    }
    Ok(())
}

async fn run(
    app: PathBuf,
    target: Option<String>,
    options: RunOptions,
) -> Result<(), IdeviceError> {
    if app.extension().is_some_and(|e| e == "ipa") {
        return Err(IdeviceError::InternalError(
            "unpack the .ipa and pass the .app bundle inside it".into(),
        ));
    }
    let bundle_id = run::bundle_id(&app).await?;

    let addr = UsbmuxdAddr::from_env_var()?;
    let mut usbmuxd = addr.connect(0).await?;
    let device = match target {
        Some(udid) => usbmuxd.get_device(&udid).await?,
        None => run::first_usb_device(usbmuxd.get_devices().await?)
            .ok_or(IdeviceError::DeviceNotFound)?,
    };
    drop(usbmuxd);

    info!("Running {bundle_id} on {}", device.udid);
    let mut manager = ClientManager::new(device.to_provider(addr, "devrun"));
    if let Some(exit) = run::run_on_device(&mut manager, &app, &bundle_id, &options).await? {
        info!("App stopped: {exit}");
    }
    Ok(())
}
