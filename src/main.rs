use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use vyper::config::{self, Appearance, ConfigStore, Rgb, TextColor};
use vyper::platform::Elevation;
use vyper::supervisor::{
    ConnectionState, ConnectionSupervisor, Readiness, StateChange, SupervisorError,
    SupervisorOptions,
};
use vyper::vpn::{CredentialBroker, ProfileStore};

#[derive(Parser)]
#[command(name = "vyper")]
#[command(about = "VPN tunnel launcher for OpenVPN profiles")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored VPN profiles
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Copy an .ovpn file into the profile store
    Import { path: PathBuf },
    /// Connect using a stored profile
    ///
    /// Stays attached while the tunnel is up when a readiness marker is
    /// configured; press Ctrl+C to disconnect.
    Connect {
        /// Profile file name, as shown by `vyper list`
        profile: String,
        /// Username for VPN authentication
        #[arg(short, long)]
        user: Option<String>,
        /// Prompt for a password
        #[arg(long)]
        ask_password: bool,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the settings file
    Show,
    /// Set the appearance (dark or light)
    Appearance { mode: Appearance },
    /// Switch between dark and light appearance
    Toggle,
    /// Set the accent color (#RRGGBB)
    Accent { color: Rgb },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Err(e) = run(cli.command).await {
        error!("{}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let base = config::base_dir()?;

    match command {
        Commands::List { json } => {
            let store = ProfileStore::open(config::profile_dir(&base))?;
            let profiles = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&profiles)?);
            } else if profiles.is_empty() {
                println!("No profiles in {}", store.dir().display());
            } else {
                for profile in &profiles {
                    println!("{}", profile.name());
                }
            }
        }
        Commands::Import { path } => {
            let store = ProfileStore::open(config::profile_dir(&base))?;
            let profile = store.import_file(&path)?;
            println!("Imported {}", profile.name());
        }
        Commands::Connect {
            profile,
            user,
            ask_password,
        } => {
            let password = if ask_password {
                Some(rpassword::prompt_password("VPN password: ")?)
            } else {
                None
            };
            let broker = CredentialBroker::new();
            broker.capture(user, password);
            if broker.is_loaded() {
                debug!("Credentials captured for this connection");
            }
            connect(&base, &profile, &broker).await?;
        }
        Commands::Config { action } => {
            let mut store = ConfigStore::new(config::config_path(&base));
            store.load_or_default();
            match action.unwrap_or(ConfigAction::Show) {
                ConfigAction::Show => {
                    println!("# {}", store.path().display());
                    print!("{}", store.settings().to_toml()?);
                }
                ConfigAction::Appearance { mode } => {
                    store.set_appearance(mode)?;
                    println!("Appearance: {}", mode);
                }
                ConfigAction::Toggle => {
                    let mode = store.settings().appearance.toggled();
                    store.set_appearance(mode)?;
                    println!("Appearance: {}", mode);
                }
                ConfigAction::Accent { color } => {
                    store.set_accent_color(color)?;
                    let text = match color.contrasting_text() {
                        TextColor::White => "white",
                        TextColor::Black => "black",
                    };
                    println!("Accent color: {} (text: {})", color, text);
                }
            }
        }
    }

    Ok(())
}

async fn connect(
    base: &std::path::Path,
    name: &str,
    broker: &CredentialBroker,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config_store = ConfigStore::new(config::config_path(base));
    let settings = config_store.load_or_default().clone();
    let profiles = ProfileStore::open(config::profile_dir(base))?;
    let selected = profiles.find(name)?;
    if selected.is_none() {
        warn!("No profile named {} in {}", name, profiles.dir().display());
    }

    let options = SupervisorOptions::from_settings(&settings.client)?;
    let long_lived = matches!(options.readiness, Readiness::OutputMarker(_));
    if selected.is_some() {
        preflight(options.elevation.as_ref()).await?;
    }
    let supervisor = ConnectionSupervisor::spawn(options);
    let mut updates = supervisor.subscribe();

    info!("Connecting with {}...", name);
    supervisor.connect(selected.as_ref(), broker).await?;

    let mut failure = None;
    loop {
        tokio::select! {
            change = updates.recv() => {
                let Some(change) = change else { break };
                report(&change);
                match change.state {
                    ConnectionState::Connected if !long_lived => break,
                    ConnectionState::Connected => info!("Tunnel up, press Ctrl+C to disconnect"),
                    ConnectionState::Failed(reason) => failure = Some((reason, change.diagnostic)),
                    ConnectionState::Disconnected => break,
                    ConnectionState::Connecting | ConnectionState::Disconnecting => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if supervisor.state().is_active() {
                    info!("Interrupted, disconnecting");
                }
                if let Err(e) = supervisor.force_shutdown().await {
                    error!("{}", e);
                }
            }
        }
    }

    match failure {
        Some((reason, diagnostic)) => {
            let err = SupervisorError::from_failure(reason, diagnostic);
            if let Some(tail) = err.diagnostic_tail() {
                print_client_output(tail);
            }
            Err(err.into())
        }
        None => Ok(()),
    }
}

/// Let the elevation strategy prompt on the terminal before the client starts
async fn preflight(elevation: &dyn Elevation) -> Result<(), Box<dyn std::error::Error>> {
    let Some(launch) = elevation.preflight() else {
        return Ok(());
    };
    debug!("Running {} preflight", elevation.name());
    let status = launch.into_command().status().await?;
    if !status.success() {
        return Err(format!("{} authentication failed ({})", elevation.name(), status).into());
    }
    Ok(())
}

fn report(change: &StateChange) {
    println!("Status: {}", change.state);
    if let Some(diagnostic) = &change.diagnostic {
        // failure output is printed with the final error
        if !matches!(change.state, ConnectionState::Failed(_)) {
            print_client_output(diagnostic);
        }
    }
}

fn print_client_output(output: &str) {
    eprintln!("--- client output ---\n{}", output);
}
