//! Deploy and launch an app bundle on a device
//!
//! Mounts the developer disk image when needed, stages the bundle through AFC,
//! installs it and starts it under debugserver. Every retry the flow needs lives
//! here, never in the protocol clients.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    debugserver::DebugserverClient,
    installation_proxy::AppInfo,
    lockdown::{DeviceValues, LockdownClient},
    mobile_image_mounter::STAGED_IMAGE_PATH,
    provider::IdeviceProvider,
    usbmuxd::{Connection, UsbmuxdAddr, UsbmuxdDevice},
    ClientManager, IdeviceError,
};

/// Where packages are staged before installing
pub const STAGING_DIR: &str = "PublicStaging";

/// Xcode location used when `DEVELOPER_DIR` is not set
pub const DEFAULT_DEVELOPER_DIR: &str = "/Applications/Xcode.app/Contents/Developer";

/// Retry and wait policy for [`run_on_device`]
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Launch attempts before giving up on `EBusy`/`ENotFound`
    pub launch_attempts: u32,
    pub launch_retry_delay: Duration,
    /// Pause between install and launch; launching right away fails with `EBusy`
    pub install_settle: Duration,
    /// Attempts to mount the disk image while the device is locked
    pub unlock_attempts: u32,
    pub unlock_retry_delay: Duration,
    /// Keep the debugserver session open until the app exits
    pub wait_for_app: bool,
    /// Disk image to mount, found through Xcode when `None`
    pub developer_disk_image: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            launch_attempts: 3,
            launch_retry_delay: Duration::from_millis(500),
            install_settle: Duration::from_millis(200),
            unlock_attempts: 30,
            unlock_retry_delay: Duration::from_secs(1),
            wait_for_app: false,
            developer_disk_image: None,
        }
    }
}

/// Lists every device usbmuxd knows, with the values lockdown reports for it
pub async fn list_devices(addr: &UsbmuxdAddr) -> Result<Vec<DeviceValues>, IdeviceError> {
    let mut usbmuxd = addr.connect(0).await?;
    let devices = usbmuxd.get_devices().await?;

    let mut values = Vec::with_capacity(devices.len());
    for device in devices {
        let provider = device.to_provider(addr.clone(), "devrun");
        values.push(device_values(&provider).await?);
    }
    Ok(values)
}

/// Picks the first USB-attached device, skipping network pairings
pub fn first_usb_device(devices: Vec<UsbmuxdDevice>) -> Option<UsbmuxdDevice> {
    devices
        .into_iter()
        .find(|d| d.connection_type == Connection::Usb)
}

/// Reads a device's identifying values, no session needed
pub async fn device_values(provider: &dyn IdeviceProvider) -> Result<DeviceValues, IdeviceError> {
    let idevice = provider.connect(LockdownClient::LOCKDOWND_PORT).await?;
    LockdownClient::new(idevice).get_all_values().await
}

/// Reads `CFBundleIdentifier` from the bundle's `Info.plist`
pub async fn bundle_id(app_path: &Path) -> Result<String, IdeviceError> {
    let info = tokio::fs::read(app_path.join("Info.plist")).await?;
    let info: plist::Dictionary = plist::from_bytes(&info)?;
    info.get("CFBundleIdentifier")
        .and_then(|id| id.as_string())
        .map(str::to_string)
        .ok_or(IdeviceError::UnexpectedResponse)
}

/// Installs and launches the `.app` bundle at `app_path`
///
/// # Returns
/// The exit reply from debugserver when waiting for the app, `None` otherwise
pub async fn run_on_device(
    manager: &mut ClientManager,
    app_path: &Path,
    bundle_id: &str,
    options: &RunOptions,
) -> Result<Option<String>, IdeviceError> {
    mount_developer_disk_image(manager, options).await?;

    let package_path = upload_app(manager, app_path).await?;
    let app = install_app(manager, &package_path, bundle_id).await?;

    tokio::time::sleep(options.install_settle).await;
    let mut gdb = launch_app(manager, &app, options).await?;
    info!("Launched {bundle_id}");

    if options.wait_for_app {
        Ok(Some(wait_for_app(&mut gdb).await?))
    } else {
        Ok(None)
    }
}

/// Mounts the developer disk image unless one is mounted already
///
/// A locked device is retried every `unlock_retry_delay`, up to `unlock_attempts`
/// times in total.
pub async fn mount_developer_disk_image(
    manager: &mut ClientManager,
    options: &RunOptions,
) -> Result<(), IdeviceError> {
    let mut attempt = 1;
    loop {
        match mount_once(manager, options).await {
            Err(IdeviceError::DeviceLocked) if attempt < options.unlock_attempts => {
                if attempt == 1 {
                    warn!("Device is locked, unlock it to continue");
                }
                debug!("Mount attempt {attempt} hit a locked device");
                attempt += 1;
                tokio::time::sleep(options.unlock_retry_delay).await;
            }
            res => return res,
        }
    }
}

async fn mount_once(manager: &mut ClientManager, options: &RunOptions) -> Result<(), IdeviceError> {
    let mut mounter = manager.image_mounter().await?;
    if mounter.lookup_image().await?.is_some() {
        debug!("Developer disk image already mounted");
        return Ok(());
    }

    let image = match &options.developer_disk_image {
        Some(image) => image.clone(),
        None => {
            let version = manager
                .lockdown()
                .await?
                .get_value(Some("ProductVersion"), None)
                .await?;
            let version = version
                .as_string()
                .ok_or(IdeviceError::UnexpectedResponse)?;
            developer_disk_image_path(&developer_dir(), version).await?
        }
    };

    let mut signature_path = image.clone().into_os_string();
    signature_path.push(".signature");
    let signature = tokio::fs::read(&signature_path).await?;

    info!("Mounting {}", image.display());
    mounter.upload_image(&image, signature.clone()).await?;
    mounter.mount_image(STAGED_IMAGE_PATH, signature).await
}

/// The Xcode developer directory, from `DEVELOPER_DIR` when set
pub fn developer_dir() -> PathBuf {
    std::env::var_os("DEVELOPER_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVELOPER_DIR))
}

/// Finds the disk image Xcode ships for an iOS version
///
/// Device support folders look like `14.2` or `14.2 (18B79)`; the first one, in
/// name order, containing the version's `major.minor` wins.
pub async fn developer_disk_image_path(
    developer_dir: &Path,
    ios_version: &str,
) -> Result<PathBuf, IdeviceError> {
    let missing = || IdeviceError::MissingDeveloperDiskImage(ios_version.to_string());

    let mut parts = ios_version.split('.');
    let prefix = match (parts.next(), parts.next()) {
        (Some(major), Some(minor))
            if !major.is_empty()
                && !minor.is_empty()
                && major.chars().chain(minor.chars()).all(|c| c.is_ascii_digit()) =>
        {
            format!("{major}.{minor}")
        }
        _ => return Err(missing()),
    };

    let support = developer_dir.join("Platforms/iPhoneOS.platform/DeviceSupport");
    let mut entries = tokio::fs::read_dir(&support).await.map_err(|e| {
        debug!("Can't read {}: {e}", support.display());
        missing()
    })?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    names
        .into_iter()
        .find(|name| name.contains(&prefix))
        .map(|name| support.join(name).join("DeveloperDiskImage.dmg"))
        .ok_or_else(missing)
}

/// Copies the bundle into `PublicStaging`
///
/// # Returns
/// The package path to hand to the installation proxy
pub async fn upload_app(manager: &mut ClientManager, app_path: &Path) -> Result<String, IdeviceError> {
    let name = app_path
        .file_name()
        .ok_or_else(|| IdeviceError::InternalError(format!("{} has no file name", app_path.display())))?
        .to_string_lossy();
    let package_path = format!("{STAGING_DIR}/{name}");

    let mut afc = manager.afc().await?;
    info!("Uploading {} to {package_path}", app_path.display());
    afc.upload_directory(app_path, &package_path).await?;
    Ok(package_path)
}

/// Installs a staged package and looks up where it landed
///
/// An install rejected because of the copy already on the device is retried once
/// after uninstalling that copy.
pub async fn install_app(
    manager: &mut ClientManager,
    package_path: &str,
    bundle_id: &str,
) -> Result<AppInfo, IdeviceError> {
    let mut proxy = manager.installation_proxy().await?;
    info!("Installing {bundle_id}");
    match proxy.install_app(package_path, bundle_id).await {
        Err(e) if e.is_incompatible_install() => {
            warn!("Install conflicts with the installed app ({e}), reinstalling");
            proxy.uninstall_app(bundle_id).await?;
            proxy.install_app(package_path, bundle_id).await?;
        }
        res => res?,
    }

    proxy
        .lookup_app(&[bundle_id])
        .await?
        .remove(bundle_id)
        .ok_or_else(|| IdeviceError::AppNotFound(bundle_id.to_string()))
}

/// Turns a `qLaunchSuccess` reply into a result
fn launch_result(reply: String) -> Result<(), IdeviceError> {
    match reply.as_str() {
        "OK" => Ok(()),
        "EBusy" | "ENotFound" => Err(IdeviceError::LaunchBusy(reply)),
        _ => Err(IdeviceError::LaunchFailed(reply)),
    }
}

/// Launches the app, opening a new debugserver connection for every attempt
///
/// # Returns
/// The connection of the attempt that succeeded, with the app stopped at entry
pub async fn launch_app(
    manager: &mut ClientManager,
    app: &AppInfo,
    options: &RunOptions,
) -> Result<DebugserverClient, IdeviceError> {
    for attempt in 1..=options.launch_attempts {
        let mut gdb = manager.debugserver().await?;
        gdb.set_max_packet_size(1024).await?;
        gdb.set_working_dir(app.container.as_deref().unwrap_or(&app.path))
            .await?;
        gdb.launch_app(&app.path, &app.executable).await?;

        match launch_result(gdb.check_launch_success().await?) {
            Ok(()) => return Ok(gdb),
            Err(e @ IdeviceError::LaunchBusy(_)) => {
                debug!("Launch attempt {attempt} failed: {e}");
                drop(gdb);
                if attempt < options.launch_attempts {
                    tokio::time::sleep(options.launch_retry_delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(IdeviceError::LaunchTriesExceeded)
}

/// Resumes the app and blocks until it exits or ctrl-c is pressed
///
/// On ctrl-c the app is halted. Unless it already exited it is then killed.
///
/// # Returns
/// The last stop reply, `W..` or `X..` when the app exited on its own
pub async fn wait_for_app(gdb: &mut DebugserverClient) -> Result<String, IdeviceError> {
    info!("Waiting for app to close");
    gdb.write_command("c").await?;

    let reply = tokio::select! {
        reply = gdb.read_reply() => reply?,
        _ = tokio::signal::ctrl_c() => {
            gdb.halt().await?;
            gdb.read_reply().await?
        }
    };

    if !(reply.starts_with('W') || reply.starts_with('X')) {
        debug!("App stopped with {reply}, killing it");
        if let Some(description) = gdb.kill().await? {
            info!("{description}");
        }
    }
    Ok(reply)
}
