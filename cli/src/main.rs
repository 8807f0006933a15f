// wearlink: desktop CLI for the wearable link
//
// Cross-platform (macOS, Linux, Windows) front end over wearlink-core: pair
// with a wearable by name, run a live session over the host radio, exercise
// the payload codec, or walk a simulated session end to end.

mod config;
mod radio;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use wearlink_core::store::DeviceCache;
use wearlink_core::{
    BlePlatformBridge, BleSession, DeviceCommand, PeripheralDescriptor, PeripheralHandle,
    RadioEvent, ScriptedBridge, SessionEvent, SledStorage, StorageBackend,
};

#[derive(Parser)]
#[command(name = "wearlink")]
#[command(about = "Wearlink — phone-to-wearable BLE link", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Remember the wearable to look for
    Pair { name: String },
    /// Show the cached device and link settings
    Status,
    /// Scan for the paired wearable and bring the link up
    Connect {
        /// Seconds to wait for the link to become ready
        #[arg(short, long, default_value = "30")]
        timeout: u64,
        /// Command to send once ready (device-info, step-info, ...)
        #[arg(short, long)]
        command: Option<DeviceCommand>,
        /// Seconds to print notifications before disconnecting
        #[arg(short, long, default_value = "10")]
        listen: u64,
    },
    /// Encipher a payload into wire hex
    Encode {
        payload: String,
        /// Treat the payload as hex bytes rather than text
        #[arg(long)]
        hex: bool,
    },
    /// Decipher wire hex into plaintext
    Decode { ciphertext: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a full session against a simulated wearable
    Simulate {
        #[arg(short, long, default_value = "Watch-42")]
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Pair { name } => cmd_pair(name).await,
        Commands::Status => cmd_status().await,
        Commands::Connect {
            timeout,
            command,
            listen,
        } => cmd_connect(timeout, command, listen).await,
        Commands::Encode { payload, hex } => cmd_encode(payload, hex),
        Commands::Decode { ciphertext } => cmd_decode(ciphertext),
        Commands::Config { action } => cmd_config(action).await,
        Commands::Simulate { name } => cmd_simulate(name).await,
    }
}

fn open_storage(config: &config::Config) -> Result<Arc<dyn StorageBackend>> {
    let path = config.storage_dir()?;
    let storage = SledStorage::new(&path.to_string_lossy())
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to open device cache at {}", path.display()))?;
    Ok(Arc::new(storage))
}

async fn cmd_pair(name: String) -> Result<()> {
    let config = config::Config::load()?;
    let cache = DeviceCache::new(open_storage(&config)?);

    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Device name cannot be empty");
    }
    cache.store_device_name(name)?;

    println!("{} Paired with {}", "✓".green(), name.bright_cyan());
    println!("  Next: {}", "wearlink connect".bright_green());
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = config::Config::load()?;
    let cache = DeviceCache::new(open_storage(&config)?);

    println!("{}", "Wearlink Status".bold());
    println!();
    match cache.device_name()? {
        Some(name) => println!("  Device:   {}", name.bright_cyan()),
        None => println!("  Device:   {}", "(not paired)".dimmed()),
    }
    match cache.device_address()? {
        Some(address) => println!("  Address:  {}", address.bright_yellow()),
        None => println!("  Address:  {}", "(never connected)".dimmed()),
    }
    println!("  Service:  {}", config.ble.service_uuid);
    println!("  Scan:     {:?} window", config.ble.scan_duration());
    println!("  Storage:  {}", config.storage_dir()?.display());
    Ok(())
}

async fn cmd_connect(timeout: u64, command: Option<DeviceCommand>, listen: u64) -> Result<()> {
    let config = config::Config::load()?;
    let storage = open_storage(&config)?;
    let bridge: Arc<dyn BlePlatformBridge> = Arc::new(radio::BtleplugBridge::new());
    let session = BleSession::new(bridge, config.ble.clone(), storage)?;

    let name = session
        .cached_device_name()?
        .context("No paired device. Run `wearlink pair <name>` first")?;

    let _dispatcher = session.initialize().await.context("Failed to start radio")?;
    println!("{} Radio ready", "✓".green());

    let mut events = session.subscribe_events();
    session
        .start_scan(&config.ble.service_uuid, config.ble.scan_duration_secs)
        .await?;
    println!("{} Scanning for {}...", "•".bright_green(), name.bright_cyan());

    let address = tokio::time::timeout(Duration::from_secs(timeout), wait_ready(&mut events))
        .await
        .context("Timed out waiting for the device")??;
    println!("{} Ready: {}", "✓".green(), address.bright_yellow());

    match session.battery_level(&address).await {
        Ok(level) => println!("  Battery: {}%", level),
        // Radio-side failures are reported, not fatal.
        Err(e) if e.is_transport() => println!("  Battery: {}", e.to_string().dimmed()),
        Err(e) => return Err(e).context("Battery read rejected"),
    }

    if let Some(command) = command {
        session.send_command(command).await?;
        println!("{} Sent {}", "✓".green(), command.to_string().bright_cyan());
    }

    if listen > 0 {
        println!();
        println!("{} ({}s)", "Notifications".bold(), listen);
        let deadline = tokio::time::sleep(Duration::from_secs(listen));
        tokio::pin!(deadline);
        let mut states = session.subscribe_state();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                changed = states.changed() => {
                    let state = *states.borrow_and_update();
                    if changed.is_err() || !state.is_connected() {
                        println!("  {}", format!("Session ended ({})", state).bright_red());
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if !print_event(&event) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        println!("  {}", format!("({} events skipped)", n).dimmed());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    if session.state().is_connected() {
        session.disconnect(&address).await?;
    }
    println!("{} Disconnected", "✓".green());
    Ok(())
}

/// Wait for the session's Ready event, failing on the first failure event.
async fn wait_ready(events: &mut broadcast::Receiver<SessionEvent>) -> Result<String> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ready { address }) => return Ok(address),
            Ok(SessionEvent::Failed { error }) => {
                return Err(anyhow::Error::new(error).context("Session failed"))
            }
            Ok(SessionEvent::PeripheralFound { address, .. }) => {
                println!("{} Found {}", "•".bright_green(), address.bright_yellow());
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("Session closed before the device was ready")
            }
        }
    }
}

/// Print one event. Returns false once the link is gone.
fn print_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Notification {
            characteristic_id,
            data,
            ..
        } => {
            println!("  {} {} {}", "←".bright_blue(), characteristic_id.dimmed(), data);
        }
        SessionEvent::BatteryLevel { level, .. } => {
            println!("  {} battery {}%", "←".bright_blue(), level);
        }
        SessionEvent::Disconnected { .. } => {
            println!("  {}", "Link lost".bright_red());
            return false;
        }
        SessionEvent::Failed { error } => {
            println!("  {} {}", "✗".red(), error);
        }
        _ => {}
    }
    true
}

fn cmd_encode(payload: String, is_hex: bool) -> Result<()> {
    let config = config::Config::load()?;
    let codec = wearlink_core::Codec::new(config.ble.cipher_key()?);

    let plaintext = if is_hex {
        hex::decode(payload.trim()).context("Payload is not valid hex")?
    } else {
        payload.into_bytes()
    };
    let frame = codec.encrypt_frame(&plaintext)?;

    println!("{}", "Encoded Frame".bold());
    println!("  Plaintext:  {}", hex::encode(&frame.plaintext));
    println!("  Padded:     {}", hex::encode(&frame.padded_plaintext).dimmed());
    println!("  Ciphertext: {}", frame.hex_ciphertext.bright_yellow());
    Ok(())
}

fn cmd_decode(ciphertext: String) -> Result<()> {
    let config = config::Config::load()?;
    let codec = wearlink_core::Codec::new(config.ble.cipher_key()?);

    let plaintext_hex = codec.decode_hex(&ciphertext)?;
    println!("{}", "Decoded Frame".bold());
    println!("  Plaintext:  {}", plaintext_hex.bright_cyan());
    let bytes = hex::decode(&plaintext_hex)?;
    if let Ok(text) = std::str::from_utf8(&bytes) {
        println!("  Text:       {:?}", text);
    }
    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            let shown = config.get(&key).unwrap_or(value);
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), shown);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<34} {}", key.bright_cyan(), value);
            }
        }

        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }

    Ok(())
}

async fn cmd_simulate(name: String) -> Result<()> {
    let config = config::Config::load()?;
    let ble = config.ble.clone();
    let address = "AA:BB:CC:DD:EE:FF";

    let scripted = ScriptedBridge::new();
    scripted.advertise(
        PeripheralHandle::new("11:22:33:44:55:66", Some("Other-Band")).with_rssi(-80),
    );
    scripted.advertise(PeripheralHandle::new(address, Some(name.as_str())).with_rssi(-52));
    let mut descriptor = PeripheralDescriptor::new(address)
        .with_characteristic(&ble.service_uuid, &ble.tx_characteristic_uuid)
        .with_characteristic(&ble.service_uuid, &ble.flow_control_characteristic_uuid)
        .with_characteristic(&ble.service_uuid, &ble.rx_characteristic_uuid)
        .with_characteristic(&ble.battery_service_uuid, &ble.battery_characteristic_uuid);
    descriptor.name = Some(name.clone());
    scripted.set_descriptor(descriptor);
    scripted.set_value(&ble.battery_characteristic_uuid, vec![87]);

    let storage: Arc<dyn StorageBackend> = Arc::new(wearlink_core::MemoryStorage::new());
    let bridge: Arc<dyn BlePlatformBridge> = Arc::new(scripted.clone());
    let session = BleSession::new(bridge, ble.clone(), storage)?;
    session.set_target_device_name(&name)?;

    let _dispatcher = session.initialize().await?;
    let mut events = session.subscribe_events();

    println!("{}", "Simulated Session".bold());
    println!();
    session.start_scan(&ble.service_uuid, ble.scan_duration_secs).await?;
    let address = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged { from, to }) => {
                    let to = to.to_string();
                    println!("  {} {} → {}", "•".bright_green(), from, to.bright_cyan());
                }
                Ok(SessionEvent::Ready { address }) => return Ok(address),
                Ok(SessionEvent::Failed { error }) => return Err(anyhow::Error::new(error)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => anyhow::bail!("session closed"),
            }
        }
    })
    .await
    .context("Simulated session did not become ready")??;
    println!("{} Ready: {}", "✓".green(), address.bright_yellow());

    let level = session.battery_level(&address).await?;
    println!("  Battery: {}%", level);

    session.send_command(DeviceCommand::DeviceInfo).await?;
    if let Some(written) = scripted.written().last() {
        println!("  {} tx {}", "→".bright_green(), String::from_utf8_lossy(written));
    }

    // Device answers on the rx characteristic
    let reply = session.codec().encode(b"OK")?;
    scripted.emit(RadioEvent::CharacteristicValueChanged {
        address: address.clone(),
        service_id: ble.service_uuid.clone(),
        characteristic_id: ble.rx_characteristic_uuid.clone(),
        value: reply.into_bytes(),
    });
    let notification = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event @ SessionEvent::Notification { .. }) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();
    if let Some(event) = notification {
        print_event(&event);
    }

    session.disconnect(&address).await?;
    println!("{} Disconnected, state {}", "✓".green(), session.state());
    Ok(())
}
